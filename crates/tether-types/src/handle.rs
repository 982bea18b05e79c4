//! Object handles.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one spawn (an object graph rooted at one `New` call).
pub type SpawnId = u64;

/// Identifies one object inside a spawn.
pub type ObjectId = u64;

/// Spawn reserved for objects a peer exposes without an explicit `New`.
pub const AD_HOC_SPAWN: SpawnId = 0;

/// Object id of every spawn's root object.
pub const ROOT_OBJECT: ObjectId = 0;

/// Address of one exposed object: `(spawnId, objectId)`.
///
/// On the wire a handle is the two-element array `[spawnId, objectId]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(SpawnId, ObjectId)", into = "(SpawnId, ObjectId)")]
pub struct Handle {
    pub spawn_id: SpawnId,
    pub object_id: ObjectId,
}

impl Handle {
    pub fn new(spawn_id: SpawnId, object_id: ObjectId) -> Self {
        Self {
            spawn_id,
            object_id,
        }
    }

    /// Handle of a spawn's root object.
    pub fn root(spawn_id: SpawnId) -> Self {
        Self::new(spawn_id, ROOT_OBJECT)
    }

    /// Root objects are destroyed with their spawn, never released individually.
    pub fn is_root(&self) -> bool {
        self.object_id == ROOT_OBJECT
    }
}

impl From<(SpawnId, ObjectId)> for Handle {
    fn from((spawn_id, object_id): (SpawnId, ObjectId)) -> Self {
        Self::new(spawn_id, object_id)
    }
}

impl From<Handle> for (SpawnId, ObjectId) {
    fn from(handle: Handle) -> Self {
        (handle.spawn_id, handle.object_id)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.spawn_id, self.object_id)
    }
}

//! Object store: the objects this peer has exposed to the other side.
//!
//! The store is an arena keyed by `(spawnId, objectId)`. Spawn 0 always
//! exists and holds ad-hoc objects sent inline; every processed `New` adds a
//! spawn whose root sits at object 0.
//!
//! For each object the store also keeps a retained-property map: when a
//! property is assigned a [`RemoteObject`], the store holds one retain on it
//! until the property is replaced or deleted. A reconciliation task polls
//! tracked properties so that assignments made directly on the object,
//! bypassing the store, still settle their retains.

use crate::host::{HostError, ObjectRef};
use crate::remote::RemoteObject;
use crate::value::Value;
use crate::RECONCILE_INTERVAL;

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use tether_types::handle::AD_HOC_SPAWN;
use tether_types::{Handle, ObjectId, SpawnId};
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct StoredObject {
    object: ObjectRef,
    /// Properties currently holding a counted retain on a remote.
    retained: HashMap<String, RemoteObject>,
    reconciler: Option<JoinHandle<()>>,
}

impl StoredObject {
    fn new(object: ObjectRef) -> Self {
        Self {
            object,
            retained: HashMap::new(),
            reconciler: None,
        }
    }

    /// Stop polling and hand back every retain this object held.
    fn teardown(mut self) -> Vec<RemoteObject> {
        if let Some(task) = self.reconciler.take() {
            task.abort();
        }
        self.retained.drain().map(|(_, remote)| remote).collect()
    }
}

#[derive(Default)]
struct SpawnTable {
    next_object: ObjectId,
    objects: HashMap<ObjectId, StoredObject>,
}

impl SpawnTable {
    fn new(root: Option<ObjectRef>) -> Self {
        let mut table = Self {
            next_object: 1,
            objects: HashMap::new(),
        };
        if let Some(root) = root {
            table.objects.insert(0, StoredObject::new(root));
        }
        table
    }

    fn teardown(self) -> Vec<RemoteObject> {
        self.objects
            .into_values()
            .flat_map(StoredObject::teardown)
            .collect()
    }
}

struct StoreInner {
    next_spawn: SpawnId,
    spawns: HashMap<SpawnId, SpawnTable>,
}

impl StoreInner {
    fn entry_mut(&mut self, handle: Handle) -> Option<&mut StoredObject> {
        self.spawns
            .get_mut(&handle.spawn_id)?
            .objects
            .get_mut(&handle.object_id)
    }
}

fn release_all(remotes: Vec<RemoteObject>) {
    for remote in remotes {
        remote.release();
    }
}

/// Thread-safe table of every spawn this peer owns.
#[derive(Clone)]
pub struct ObjectStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore {
    /// Create a store holding only the empty ad-hoc spawn.
    pub fn new() -> Self {
        let mut spawns = HashMap::new();
        spawns.insert(AD_HOC_SPAWN, SpawnTable::new(None));
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                next_spawn: 1,
                spawns,
            })),
        }
    }

    /// Create a spawn rooted at `root` and return its id.
    pub fn new_spawn(&self, root: ObjectRef) -> SpawnId {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let spawn_id = inner.next_spawn;
        inner.next_spawn += 1;
        inner.spawns.insert(spawn_id, SpawnTable::new(Some(root)));
        info!(spawn_id, "spawn created");
        spawn_id
    }

    /// A view of one spawn, if it exists.
    pub fn spawn(&self, spawn_id: SpawnId) -> Option<SpawnRef> {
        self.has_spawn(spawn_id).then(|| SpawnRef {
            store: self.clone(),
            spawn_id,
        })
    }

    /// The ad-hoc spawn 0.
    pub fn ad_hoc(&self) -> SpawnRef {
        SpawnRef {
            store: self.clone(),
            spawn_id: AD_HOC_SPAWN,
        }
    }

    pub fn has_spawn(&self, spawn_id: SpawnId) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.spawns.contains_key(&spawn_id)
    }

    pub fn spawn_ids(&self) -> Vec<SpawnId> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<SpawnId> = inner.spawns.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of objects stored in a spawn (0 if it does not exist).
    pub fn object_count(&self, spawn_id: SpawnId) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .spawns
            .get(&spawn_id)
            .map(|t| t.objects.len())
            .unwrap_or(0)
    }

    pub fn get_object(&self, handle: Handle) -> Option<ObjectRef> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .spawns
            .get(&handle.spawn_id)?
            .objects
            .get(&handle.object_id)
            .map(|stored| Arc::clone(&stored.object))
    }

    /// Store `object` in a spawn under a fresh id.
    pub fn put_object(&self, spawn_id: SpawnId, object: ObjectRef) -> Option<ObjectId> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let table = inner.spawns.get_mut(&spawn_id)?;
        let object_id = table.next_object;
        table.next_object += 1;
        table.objects.insert(object_id, StoredObject::new(object));
        Some(object_id)
    }

    /// Forget an object, releasing the retains its properties held.
    pub fn release_object(&self, handle: Handle) -> bool {
        let removed = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner
                .spawns
                .get_mut(&handle.spawn_id)
                .and_then(|t| t.objects.remove(&handle.object_id))
        };
        match removed {
            Some(stored) => {
                debug!(%handle, "object released");
                release_all(stored.teardown());
                true
            }
            None => false,
        }
    }

    /// Assign a property through the store, keeping retains balanced.
    ///
    /// A remote previously tracked at `name` is released; a remote assigned
    /// now is retained and tracked. Fails without touching the bookkeeping
    /// when the object rejects the assignment.
    pub fn set_object_property(
        &self,
        handle: Handle,
        name: &str,
        value: Value,
    ) -> Result<(), HostError> {
        let object = self
            .get_object(handle)
            .ok_or_else(|| HostError::new("The object does not exist"))?;
        object.set(name, value.clone())?;
        self.settle(handle, name, Some(&value));
        Ok(())
    }

    /// Delete a property through the store, releasing any retain it held.
    pub fn delete_object_property(&self, handle: Handle, name: &str) -> Result<(), HostError> {
        let object = self
            .get_object(handle)
            .ok_or_else(|| HostError::new("The object does not exist"))?;
        object.delete(name)?;
        self.settle(handle, name, None);
        Ok(())
    }

    /// Record the new value of `name` and drop the retain it replaced.
    ///
    /// The object may have been forgotten while its setter ran; then there
    /// is nothing left to track.
    fn settle(&self, handle: Handle, name: &str, value: Option<&Value>) {
        let previous = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            let Some(stored) = inner.entry_mut(handle) else {
                return;
            };
            self.track(stored, handle, name, value)
        };
        if let Some(remote) = previous {
            remote.release();
        }
    }

    /// Property names currently holding a retain on a remote.
    pub fn retained_properties(&self, handle: Handle) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = inner
            .spawns
            .get(&handle.spawn_id)
            .and_then(|t| t.objects.get(&handle.object_id))
            .map(|stored| stored.retained.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Remove a spawn, releasing everything it held. Returns its root.
    ///
    /// The ad-hoc spawn has no root and cannot be destroyed.
    pub fn destroy_spawn(&self, spawn_id: SpawnId) -> Option<ObjectRef> {
        if spawn_id == AD_HOC_SPAWN {
            return None;
        }
        let mut table = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.spawns.remove(&spawn_id)?
        };
        let root = table.objects.get(&0).map(|stored| Arc::clone(&stored.object));
        let remotes = std::mem::take(&mut table).teardown();
        info!(spawn_id, released = remotes.len(), "spawn destroyed");
        release_all(remotes);
        root
    }

    /// Tear every spawn down, as when the owning side shuts down.
    ///
    /// Root `on_destroy` hooks run; the ad-hoc spawn is emptied but kept.
    pub fn shutdown(&self) {
        let tables: Vec<SpawnTable> = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            let mut tables: Vec<SpawnTable> = Vec::new();
            inner.spawns.retain(|&spawn_id, table| {
                if spawn_id == AD_HOC_SPAWN {
                    // Ids handed out here stay burned.
                    tables.push(SpawnTable {
                        next_object: table.next_object,
                        objects: std::mem::take(&mut table.objects),
                    });
                    true
                } else {
                    tables.push(std::mem::take(table));
                    false
                }
            });
            tables
        };
        info!(spawns = tables.len(), "object store shut down");
        for table in tables {
            if let Some(root) = table.objects.get(&0) {
                if let Err(e) = root.object.on_destroy() {
                    debug!(error = %e, "on_destroy hook failed during shutdown");
                }
            }
            release_all(table.teardown());
        }
    }

    /// Update the retained-property map for `name`; returns the retain to drop.
    fn track(
        &self,
        stored: &mut StoredObject,
        handle: Handle,
        name: &str,
        value: Option<&Value>,
    ) -> Option<RemoteObject> {
        let previous = stored.retained.remove(name);
        if let Some(Value::Remote(remote)) = value {
            if remote.retain().is_ok() {
                stored.retained.insert(name.to_string(), remote.clone());
            }
        }
        if stored.retained.is_empty() {
            if let Some(task) = stored.reconciler.take() {
                task.abort();
            }
        } else if stored.reconciler.is_none() {
            stored.reconciler = spawn_reconciler(Arc::downgrade(&self.inner), handle);
        }
        previous
    }

    /// Re-sync tracked properties whose live value drifted.
    ///
    /// Live values are read without holding the store lock; a property
    /// re-tracked through the store in the meantime is left alone.
    fn reconcile(&self, handle: Handle) {
        let snapshot: Vec<(String, RemoteObject)> = {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            let Some(stored) = inner
                .spawns
                .get(&handle.spawn_id)
                .and_then(|t| t.objects.get(&handle.object_id))
            else {
                return;
            };
            stored
                .retained
                .iter()
                .map(|(name, remote)| (name.clone(), remote.clone()))
                .collect()
        };
        let Some(object) = self.get_object(handle) else {
            return;
        };
        let drifted: Vec<(String, RemoteObject, Option<Value>)> = snapshot
            .into_iter()
            .filter_map(|(name, tracked)| {
                let live = object.get(&name);
                let unchanged = matches!(&live, Some(Value::Remote(r)) if r.same_object(&tracked));
                (!unchanged).then_some((name, tracked, live))
            })
            .collect();
        if drifted.is_empty() {
            return;
        }

        let released = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            let Some(stored) = inner.entry_mut(handle) else {
                return;
            };
            let mut released = Vec::new();
            for (name, tracked, live) in drifted {
                let still_tracked = matches!(
                    stored.retained.get(&name),
                    Some(current) if current.same_object(&tracked)
                );
                if !still_tracked {
                    continue;
                }
                debug!(%handle, property = %name, "reconciling retained property");
                released.extend(self.track(stored, handle, &name, live.as_ref()));
            }
            released
        };
        release_all(released);
    }
}

fn spawn_reconciler(store: Weak<RwLock<StoreInner>>, handle: Handle) -> Option<JoinHandle<()>> {
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = store.upgrade() else {
                break;
            };
            ObjectStore { inner }.reconcile(handle);
        }
    }))
}

/// A view of one spawn inside an [`ObjectStore`].
#[derive(Clone)]
pub struct SpawnRef {
    store: ObjectStore,
    spawn_id: SpawnId,
}

impl SpawnRef {
    pub fn spawn_id(&self) -> SpawnId {
        self.spawn_id
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn root(&self) -> Option<ObjectRef> {
        self.get_object(0)
    }

    pub fn put_object(&self, object: ObjectRef) -> Option<ObjectId> {
        self.store.put_object(self.spawn_id, object)
    }

    pub fn get_object(&self, object_id: ObjectId) -> Option<ObjectRef> {
        self.store.get_object(Handle::new(self.spawn_id, object_id))
    }

    pub fn release_object(&self, object_id: ObjectId) -> bool {
        self.store
            .release_object(Handle::new(self.spawn_id, object_id))
    }

    pub fn set_object_property(
        &self,
        object_id: ObjectId,
        name: &str,
        value: Value,
    ) -> Result<(), HostError> {
        self.store
            .set_object_property(Handle::new(self.spawn_id, object_id), name, value)
    }

    /// Destroy this spawn; see [`ObjectStore::destroy_spawn`].
    pub fn destroy(self) -> Option<ObjectRef> {
        self.store.destroy_spawn(self.spawn_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostObject, PlainObject};

    fn root() -> ObjectRef {
        PlainObject::new().with("a", 1).into_ref()
    }

    #[test]
    fn test_new_store_has_ad_hoc_spawn() {
        let store = ObjectStore::new();
        assert_eq!(store.spawn_ids(), vec![0]);
        assert!(store.ad_hoc().root().is_none());
    }

    #[test]
    fn test_spawn_ids_increase() {
        let store = ObjectStore::new();
        assert_eq!(store.new_spawn(root()), 1);
        assert_eq!(store.new_spawn(root()), 2);
        assert!(store.spawn(1).unwrap().root().is_some());
        assert!(store.spawn(9).is_none());
    }

    #[test]
    fn test_put_get_release() {
        let store = ObjectStore::new();
        let spawn = store.ad_hoc();
        let first = spawn.put_object(root()).unwrap();
        let second = spawn.put_object(root()).unwrap();
        assert_eq!(first, 1);
        assert!(second > first);
        assert!(spawn.get_object(first).is_some());
        assert!(spawn.release_object(first));
        assert!(spawn.get_object(first).is_none());
        assert!(!spawn.release_object(first));
        assert!(spawn.get_object(second).is_some());
    }

    #[test]
    fn test_put_into_missing_spawn() {
        let store = ObjectStore::new();
        assert!(store.put_object(5, root()).is_none());
    }

    #[test]
    fn test_destroy_spawn_removes_everything() {
        let store = ObjectStore::new();
        let spawn_id = store.new_spawn(root());
        let child = store.put_object(spawn_id, root()).unwrap();
        assert!(store.destroy_spawn(spawn_id).is_some());
        assert!(!store.has_spawn(spawn_id));
        assert!(store.get_object(Handle::new(spawn_id, child)).is_none());
        assert!(store.destroy_spawn(spawn_id).is_none());
        assert!(store.destroy_spawn(0).is_none());
    }

    #[test]
    fn test_set_plain_value_through_store() {
        let store = ObjectStore::new();
        let spawn_id = store.new_spawn(root());
        let handle = Handle::root(spawn_id);
        store
            .set_object_property(handle, "a", Value::from("y"))
            .unwrap();
        assert_eq!(
            store.get_object(handle).unwrap().get("a"),
            Some(Value::from("y"))
        );
        assert!(store.retained_properties(handle).is_empty());
    }

    #[test]
    fn test_set_rejected_by_object() {
        let store = ObjectStore::new();
        let spawn_id = store.new_spawn(PlainObject::new().with_readonly("k", 1).into_ref());
        let err = store
            .set_object_property(Handle::root(spawn_id), "k", Value::from(2))
            .unwrap_err();
        assert!(err.0.contains("read only"));
        let err = store
            .set_object_property(Handle::new(spawn_id, 99), "k", Value::from(2))
            .unwrap_err();
        assert_eq!(err.0, "The object does not exist");
    }

    #[test]
    fn test_shutdown_runs_destroy_hooks() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let store = ObjectStore::new();
        store.new_spawn(
            PlainObject::new()
                .with_on_destroy(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .into_ref(),
        );
        store.ad_hoc().put_object(root()).unwrap();
        store.shutdown();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.spawn_ids(), vec![0]);
        assert_eq!(store.object_count(0), 0);
    }

    /// Stores a side object on every assignment.
    struct Journaling {
        store: ObjectStore,
        props: PlainObject,
    }

    impl HostObject for Journaling {
        fn keys(&self) -> Vec<String> {
            self.props.keys()
        }

        fn get(&self, name: &str) -> Option<Value> {
            self.props.get(name)
        }

        fn set(&self, name: &str, value: Value) -> Result<(), HostError> {
            self.store.ad_hoc().put_object(root());
            self.props.set(name, value)
        }

        fn delete(&self, name: &str) -> Result<(), HostError> {
            self.store.ad_hoc().put_object(root());
            self.props.delete(name)
        }
    }

    #[test]
    fn test_object_may_use_store_from_setters() {
        let store = ObjectStore::new();
        let spawn_id = store.new_spawn(Arc::new(Journaling {
            store: store.clone(),
            props: PlainObject::new().with("a", 1),
        }));
        let handle = Handle::root(spawn_id);
        store
            .set_object_property(handle, "a", Value::from(2))
            .unwrap();
        store.delete_object_property(handle, "a").unwrap();
        assert_eq!(store.object_count(0), 2);
    }

    #[test]
    fn test_shutdown_never_reuses_ids() {
        let store = ObjectStore::new();
        let spawn_id = store.new_spawn(root());
        let first = store.ad_hoc().put_object(root()).unwrap();
        store.shutdown();

        let second = store
            .ad_hoc()
            .put_object(PlainObject::new().with("v", "new").into_ref())
            .unwrap();
        assert!(second > first);
        assert!(store.get_object(Handle::new(0, first)).is_none());
        assert!(store.new_spawn(root()) > spawn_id);
    }
}

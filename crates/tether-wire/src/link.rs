//! The pair of collaborators every proxy and classifier needs.

use crate::channel::Channel;
use crate::message::Command;
use crate::store::ObjectStore;

use serde_json::Value as Json;
use std::sync::Arc;
use tether_types::TetherResult;

/// A channel to the other peer plus this peer's own object store.
#[derive(Clone)]
pub struct Link {
    channel: Arc<dyn Channel>,
    store: ObjectStore,
}

impl Link {
    pub fn new(channel: Arc<dyn Channel>, store: ObjectStore) -> Self {
        Self { channel, store }
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub async fn send(&self, command: Command) -> TetherResult<Json> {
        self.channel.send_message(command).await
    }
}

//! Peer facade: one side of a channel.
//!
//! A [`Peer`] owns an object store, answers inbound commands through a
//! [`Dispatcher`] and creates root objects on the other side.

use crate::channel::Channel;
use crate::dispatch::{Dispatcher, TypeRegistry};
use crate::host::{HostError, ObjectRef};
use crate::link::Link;
use crate::message::Command;
use crate::remote::RemoteObject;
use crate::store::ObjectStore;
use crate::toolkit;

use serde_json::Value as Json;
use std::sync::Arc;
use tether_types::{Handle, RpcError, TetherConfig, TetherError, TetherResult};
use tracing::{debug, info, warn};

/// One end of a live object-sharing session.
#[derive(Clone)]
pub struct Peer {
    link: Link,
    types: TypeRegistry,
}

impl Peer {
    /// Attach to `channel` with default settings and a private type registry.
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self::with_config(channel, TypeRegistry::new(), &TetherConfig::default())
    }

    /// Attach to `channel`, sharing `types` with other peers.
    ///
    /// Installs the dispatcher as the channel's message handler and tears
    /// every spawn down when the channel disconnects.
    pub fn with_config(
        channel: Arc<dyn Channel>,
        types: TypeRegistry,
        config: &TetherConfig,
    ) -> Self {
        if config.builtin_toolkit && !types.contains(toolkit::TOOLKIT_MIMETYPE) {
            if let Err(e) = toolkit::register(&types) {
                warn!(error = %e, "failed to register builtin toolkit");
            }
        }

        let store = ObjectStore::new();
        let link = Link::new(Arc::clone(&channel), store.clone());
        channel.on_message(Arc::new(Dispatcher::new(link.clone(), types.clone())));

        let node_name = config.node_name.clone();
        channel.on_disconnect(Box::new(move |reason| {
            info!(node = %node_name, %reason, "channel disconnected, tearing down spawns");
            store.shutdown();
        }));

        Self { link, types }
    }

    /// Create a root object of type `mimetype` on the other peer.
    pub async fn create(&self, mimetype: &str, args: Json) -> TetherResult<RemoteObject> {
        let raw = self
            .link
            .send(Command::New {
                mimetype: mimetype.to_string(),
                args,
            })
            .await?;
        let spawn_id = raw
            .as_u64()
            .ok_or_else(|| TetherError::InvalidResponse(format!("New returned {raw}")))?;
        debug!(mimetype, spawn_id, "remote spawn created");
        RemoteObject::wrap(self.link.clone(), Handle::root(spawn_id)).await
    }

    /// Make `mimetype` creatable by the other peer.
    pub fn register_type<F>(&self, mimetype: &str, factory: F) -> Result<(), RpcError>
    where
        F: Fn(Json) -> Result<ObjectRef, HostError> + Send + Sync + 'static,
    {
        self.types.register(mimetype, factory)
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn store(&self) -> &ObjectStore {
        self.link.store()
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Destroy every spawn this peer owns, running root destroy hooks.
    pub fn shutdown(&self) {
        self.link.store().shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LoopbackChannel;
    use crate::host::PlainObject;
    use crate::value::Value;
    use serde_json::json;
    use tether_types::ErrorKind;

    #[tokio::test]
    async fn test_create_and_use_remote_root() {
        let (a, b) = LoopbackChannel::pair();
        let client = Peer::new(a);
        let server = Peer::new(b);
        server
            .register_type("app/counter", |args| {
                let start = args.get("start").and_then(Json::as_i64).unwrap_or(0);
                Ok(PlainObject::new().with("count", start).into_ref())
            })
            .unwrap();

        let root = client
            .create("app/counter", json!({"start": 5}))
            .await
            .unwrap();
        assert_eq!(root.handle(), Handle::root(1));
        assert_eq!(root.properties(), vec!["count"]);
        assert_eq!(root.get_property("count").unwrap().await.unwrap(), Value::from(5));
        assert_eq!(server.store().spawn_ids(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_toolkit_registered_by_default() {
        let (a, b) = LoopbackChannel::pair();
        let client = Peer::new(a);
        let _server = Peer::new(b);
        let root = client.create("toolkit", Json::Null).await.unwrap();
        let out = root
            .invoke("readArray", vec![Value::json(json!([1, "two"]))])
            .await
            .unwrap();
        assert_eq!(out, Value::List(vec![Value::from(1), Value::from("two")]));
    }

    #[tokio::test]
    async fn test_toolkit_can_be_disabled() {
        let (a, b) = LoopbackChannel::pair();
        let client = Peer::new(a);
        let config = TetherConfig {
            builtin_toolkit: false,
            ..TetherConfig::default()
        };
        let _server = Peer::with_config(b, TypeRegistry::new(), &config);
        let err = client.create("toolkit", Json::Null).await.unwrap_err();
        assert_eq!(err.kind(), Some(&ErrorKind::InvalidObjectType));
    }

    #[tokio::test]
    async fn test_disconnect_tears_down_spawns() {
        let (a, b) = LoopbackChannel::pair();
        let client = Peer::new(a.clone());
        let server = Peer::new(b);
        client.create("toolkit", Json::Null).await.unwrap();
        assert_eq!(server.store().spawn_ids(), vec![0, 1]);
        a.close();
        assert_eq!(server.store().spawn_ids(), vec![0]);
    }
}

//! Tether Wire Protocol: live object sharing between two peers.
//!
//! Two peers connected by an asynchronous, message-oriented channel can
//! create objects on each other, read and write their properties, call their
//! methods and receive further live objects back. Neither side ever holds a
//! pointer into the other's memory; objects are addressed by
//! `(spawnId, objectId)` handles.
//!
//! ## Architecture
//!
//! - **Value** / **HostObject**: the local value model and application objects
//! - **transform**: classifies values to and from their wire representation
//! - **ObjectStore**: per-peer table of spawns owning exposed objects
//! - **RemoteObject**: proxy for an object owned by the other peer
//! - **Dispatcher**: interprets inbound commands against the store
//! - **Channel**: the send/receive/disconnect contract transports satisfy
//! - **Peer** / **Node**: the facade and the TCP listener tying it together

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod host;
pub mod link;
pub mod message;
pub mod node;
pub mod peer;
pub mod remote;
pub mod store;
pub mod stream;
pub mod toolkit;
pub mod transform;
pub mod value;

use std::time::Duration;

pub use channel::{Channel, CommandHandler, DisconnectFn, LoopbackChannel};
pub use dispatch::{Dispatcher, TypeRegistry};
pub use host::{ArrayObject, FunctionObject, HostError, HostObject, ObjectKind, ObjectRef, PlainObject};
pub use link::Link;
pub use message::{Command, Response, WireMessage, WireMessageKind};
pub use node::Node;
pub use peer::Peer;
pub use remote::{PropertyAccessor, PropertyFetch, RemoteObject};
pub use store::{ObjectStore, SpawnRef};
pub use stream::StreamChannel;
pub use value::{retain_all_remotes, Members, RetainGuard, Value};

pub use tether_types::{ErrorKind, Handle, RpcError, TetherConfig, TetherError, TetherResult};

/// How long a proxy stays retained after one of its own calls settles.
pub const CALL_HOLD: Duration = Duration::from_millis(500);

/// Grace period between a proxy's last release and the `RelObj` it sends.
pub const RELEASE_GRACE: Duration = Duration::from_millis(5000);

/// Delay between receiving `RelObj` and forgetting the object.
pub const LOCAL_RELEASE_DELAY: Duration = Duration::from_millis(1000);

/// Polling interval of the retained-property reconciliation task.
pub const RECONCILE_INTERVAL: Duration = Duration::from_millis(5000);

//! The channel contract and an in-process implementation.
//!
//! The core never moves bytes itself. It needs an object that can send one
//! command and await its answer, deliver inbound commands to a single
//! handler, and report when it becomes permanently unusable.

use crate::message::Command;

use async_trait::async_trait;
use serde_json::Value as Json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tether_types::{RpcError, TetherError, TetherResult};
use tracing::debug;

/// Callback fired once when a channel becomes unusable.
pub type DisconnectFn = Box<dyn FnOnce(String) + Send + 'static>;

/// Handles commands arriving from the other peer.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Answer one raw command. `Err` becomes an error response.
    async fn handle(&self, command: Json) -> Result<Json, RpcError>;
}

/// What the core requires of a transport.
///
/// Responses are paired per call; two outstanding calls may settle in
/// either order.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Send one command and wait for the peer's success value or error.
    async fn send_message(&self, command: Command) -> TetherResult<Json>;

    /// Install the handler for inbound commands, replacing any previous one.
    fn on_message(&self, handler: Arc<dyn CommandHandler>);

    /// Register a callback for when the channel becomes unusable.
    fn on_disconnect(&self, callback: DisconnectFn);
}

/// Handler slot and disconnect callbacks shared by the transports.
#[derive(Default)]
pub(crate) struct Endpoint {
    handler: RwLock<Option<Arc<dyn CommandHandler>>>,
    disconnect: Mutex<Vec<DisconnectFn>>,
    closed: AtomicBool,
}

impl Endpoint {
    pub(crate) fn handler(&self) -> Option<Arc<dyn CommandHandler>> {
        self.handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_handler(&self, handler: Arc<dyn CommandHandler>) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub(crate) fn add_disconnect(&self, callback: DisconnectFn) {
        if self.is_closed() {
            callback("channel already closed".to_string());
            return;
        }
        self.disconnect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed, drop the handler and fire every callback. Idempotent.
    pub(crate) fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.handler
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let callbacks: Vec<DisconnectFn> = self
            .disconnect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for callback in callbacks {
            callback(reason.to_string());
        }
    }
}

/// In-process channel; [`LoopbackChannel::pair`] returns both ends.
///
/// Every command is serialized to JSON and handled on its own task, so the
/// two peers behave as they would over a real transport.
pub struct LoopbackChannel {
    local: Arc<Endpoint>,
    remote: Arc<Endpoint>,
}

impl LoopbackChannel {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Endpoint::default());
        let b = Arc::new(Endpoint::default());
        (
            Arc::new(Self {
                local: Arc::clone(&a),
                remote: Arc::clone(&b),
            }),
            Arc::new(Self {
                local: b,
                remote: a,
            }),
        )
    }

    /// Close both ends, firing their disconnect callbacks.
    pub fn close(&self) {
        self.local.close("loopback closed");
        self.remote.close("loopback closed");
    }

    pub fn is_closed(&self) -> bool {
        self.local.is_closed()
    }
}

#[async_trait]
impl Channel for LoopbackChannel {
    async fn send_message(&self, command: Command) -> TetherResult<Json> {
        if self.local.is_closed() || self.remote.is_closed() {
            return Err(TetherError::ChannelClosed);
        }
        let handler = self.remote.handler().ok_or(TetherError::ChannelClosed)?;
        let raw = command.to_json();
        debug!(command = command.name(), "loopback send");
        let task = tokio::spawn(async move { handler.handle(raw).await });
        match task.await {
            Ok(result) => result.map_err(TetherError::Rpc),
            Err(e) => Err(TetherError::Transport(format!("handler task failed: {e}"))),
        }
    }

    fn on_message(&self, handler: Arc<dyn CommandHandler>) {
        self.local.set_handler(handler);
    }

    fn on_disconnect(&self, callback: DisconnectFn) {
        self.local.add_disconnect(callback);
    }
}

//! TCP node: accepts connections and runs one [`Peer`] per connection.
//!
//! Every accepted connection gets its own object store; the type registry is
//! shared, so a type registered on the node is creatable from any client.

use crate::channel::Channel;
use crate::dispatch::TypeRegistry;
use crate::peer::Peer;
use crate::stream::StreamChannel;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tether_types::{TetherConfig, TetherError, TetherResult};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// One accepted connection.
struct Connection {
    peer: Peer,
    channel: Arc<StreamChannel>,
}

/// A listening endpoint serving peers over TCP.
pub struct Node {
    config: TetherConfig,
    types: TypeRegistry,
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
    peers: Mutex<HashMap<u64, Connection>>,
    next_peer: AtomicU64,
}

impl Node {
    /// Bind `config.listen_addr` and start accepting connections.
    pub async fn start(
        config: TetherConfig,
        types: TypeRegistry,
    ) -> TetherResult<(Arc<Self>, tokio::task::JoinHandle<()>)> {
        let listener = TcpListener::bind(config.listen_addr.as_str()).await?;
        let local_addr = listener.local_addr()?;
        info!(node = %config.node_name, %local_addr, "tether node listening");

        let node = Arc::new(Self {
            config,
            types,
            local_addr,
            peers: Mutex::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
        });

        let accept_node = Arc::clone(&node);
        let task = tokio::spawn(async move {
            Self::accept_loop(listener, accept_node).await;
        });
        Ok((node, task))
    }

    /// Dial a node and attach a peer to the connection.
    pub async fn connect(
        addr: SocketAddr,
        config: &TetherConfig,
        types: TypeRegistry,
    ) -> TetherResult<Peer> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TetherError::Transport(format!("connect to {addr}: {e}")))?;
        stream.set_nodelay(true)?;
        info!(%addr, "connected to tether node");
        let channel = StreamChannel::new(stream, config.max_message_size);
        Ok(Peer::with_config(channel, types, config))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Number of live connections.
    pub fn connected_count(&self) -> usize {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Tear down every connected peer's spawns and close its connection.
    ///
    /// The accept loop is not stopped; abort the task returned by
    /// [`Node::start`] for that.
    pub async fn shutdown(&self) {
        let connections: Vec<Connection> = self
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        info!(peers = connections.len(), "tether node shutting down");
        for conn in connections {
            conn.peer.shutdown();
            conn.channel.close().await;
        }
    }

    async fn accept_loop(listener: TcpListener, node: Arc<Node>) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%addr, error = %e, "set_nodelay failed");
                    }
                    node.attach(stream, addr);
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn attach(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let channel = StreamChannel::new(stream, self.config.max_message_size);
        let peer = Peer::with_config(channel.clone(), self.types.clone(), &self.config);
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            Connection {
                peer,
                channel: Arc::clone(&channel),
            },
        );
        info!(%addr, peer = id, "peer connected");

        let node: Weak<Node> = Arc::downgrade(self);
        channel.on_disconnect(Box::new(move |reason| {
            if let Some(node) = node.upgrade() {
                node.peers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
            }
            info!(%addr, peer = id, %reason, "peer disconnected");
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use serde_json::json;
    use std::time::Duration;

    fn config() -> TetherConfig {
        TetherConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..TetherConfig::default()
        }
    }

    #[tokio::test]
    async fn test_node_serves_toolkit() {
        let (node, _task) = Node::start(config(), TypeRegistry::new()).await.unwrap();
        let client = Node::connect(node.local_addr(), &config(), TypeRegistry::new())
            .await
            .unwrap();
        let root = client.create("toolkit", json!({})).await.unwrap();
        assert!(root.properties().contains(&"readObject".to_string()));
        let out = root
            .invoke("readObject", vec![Value::json(json!({"k": true}))])
            .await
            .unwrap();
        assert_eq!(out.as_map().unwrap()["k"], Value::from(true));
        assert_eq!(node.connected_count(), 1);
    }

    #[tokio::test]
    async fn test_node_drops_closed_peers() {
        let (node, _task) = Node::start(config(), TypeRegistry::new()).await.unwrap();
        let stream = TcpStream::connect(node.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(node.connected_count(), 1);
        drop(stream);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(node.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (node, _task) = Node::start(config(), TypeRegistry::new()).await.unwrap();
        let client = Node::connect(node.local_addr(), &config(), TypeRegistry::new())
            .await
            .unwrap();
        let root = client.create("toolkit", json!({})).await.unwrap();

        node.shutdown().await;
        assert_eq!(node.connected_count(), 0);

        let err = tokio::time::timeout(Duration::from_secs(5), root.invoke("readArray", vec![]))
            .await
            .expect("call must settle after shutdown")
            .unwrap_err();
        assert_eq!(err, TetherError::ChannelClosed);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = Node::connect(addr, &config(), TypeRegistry::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TetherError::Transport(_)));
    }
}

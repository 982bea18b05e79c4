//! Framed channel over any byte stream.
//!
//! Each frame is a 4-byte big-endian length followed by a JSON
//! [`WireMessage`]. Requests carry a fresh UUID; the response echoes it, so
//! any number of calls can be outstanding and settle in any order.

use crate::channel::{Channel, CommandHandler, DisconnectFn, Endpoint};
use crate::message::{decode_length, decode_message, encode_message, Command, WireMessage, WireMessageKind};

use async_trait::async_trait;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tether_types::{ErrorKind, RpcError, TetherError, TetherResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Pending = HashMap<String, oneshot::Sender<TetherResult<Json>>>;

struct StreamShared {
    writer: tokio::sync::Mutex<Writer>,
    pending: Mutex<Pending>,
    endpoint: Endpoint,
    max_message_size: u32,
}

impl StreamShared {
    async fn write(&self, msg: &WireMessage) -> TetherResult<()> {
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, msg, self.max_message_size).await
    }

    fn take_waiter(&self, id: &str) -> Option<oneshot::Sender<TetherResult<Json>>> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    /// Fail every outstanding call and fire the disconnect callbacks.
    fn close_with(&self, reason: &str) {
        self.endpoint.close(reason);
        let waiters: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, tx)| tx)
            .collect();
        for tx in waiters {
            let _ = tx.send(Err(TetherError::ChannelClosed));
        }
    }
}

/// A [`Channel`] speaking length-prefixed JSON frames over a byte stream.
pub struct StreamChannel {
    shared: Arc<StreamShared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StreamChannel {
    /// Split `stream` and start the read loop. Must run inside a tokio runtime.
    pub fn new<S>(stream: S, max_message_size: u32) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let shared = Arc::new(StreamShared {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending: Mutex::new(HashMap::new()),
            endpoint: Endpoint::default(),
            max_message_size,
        });
        let task = tokio::spawn(read_loop(reader, Arc::clone(&shared)));
        Arc::new(Self {
            shared,
            reader: Mutex::new(Some(task)),
        })
    }

    /// Stop reading, fail outstanding calls and shut the write half down.
    pub async fn close(&self) {
        if let Some(task) = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.shared.close_with("stream closed locally");
        let mut writer = self.shared.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "stream shutdown failed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.endpoint.is_closed()
    }

    /// Number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[async_trait]
impl Channel for StreamChannel {
    async fn send_message(&self, command: Command) -> TetherResult<Json> {
        if self.is_closed() {
            return Err(TetherError::ChannelClosed);
        }
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), tx);
        // A close racing the insert has already drained the table.
        if self.is_closed() {
            self.shared.take_waiter(&id);
            return Err(TetherError::ChannelClosed);
        }

        debug!(command = command.name(), %id, "stream send");
        let msg = WireMessage {
            id: id.clone(),
            kind: WireMessageKind::Request {
                command: command.to_json(),
            },
        };
        if let Err(e) = self.shared.write(&msg).await {
            self.shared.take_waiter(&id);
            return Err(e);
        }
        rx.await.unwrap_or(Err(TetherError::ChannelClosed))
    }

    fn on_message(&self, handler: Arc<dyn CommandHandler>) {
        self.shared.endpoint.set_handler(handler);
    }

    fn on_disconnect(&self, callback: DisconnectFn) {
        self.shared.endpoint.add_disconnect(callback);
    }
}

async fn read_loop<R>(mut reader: R, shared: Arc<StreamShared>)
where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        let body = match read_frame(&mut reader, shared.max_message_size).await {
            Ok(body) => body,
            Err(TetherError::ChannelClosed) => break "end of stream".to_string(),
            Err(e) => break e.to_string(),
        };
        let msg = match decode_message(&body) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "undecodable frame");
                reject_frame(&shared, &body, e.to_string()).await;
                continue;
            }
        };

        let WireMessage { id, kind } = msg;
        match kind {
            WireMessageKind::Request { command } => {
                let handler = shared.endpoint.handler();
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let result = match handler {
                        Some(handler) => run_handler(handler, command).await,
                        None => Err(RpcError::new(
                            ErrorKind::Other("unavailable".to_string()),
                            "No command handler installed",
                        )),
                    };
                    reply(&shared, id, result).await;
                });
            }
            WireMessageKind::Response { result } => match shared.take_waiter(&id) {
                Some(tx) => {
                    let _ = tx.send(result.into_result());
                }
                None => warn!(%id, "response for unknown request"),
            },
        }
    };
    debug!(%reason, "stream read loop ended");
    shared.close_with(&reason);
}

/// Run `handler` in its own task so a panic still produces a reply.
async fn run_handler(handler: Arc<dyn CommandHandler>, command: Json) -> Result<Json, RpcError> {
    match tokio::spawn(async move { handler.handle(command).await }).await {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "command handler failed");
            Err(RpcError::new(
                ErrorKind::Other("internal error".to_string()),
                format!("command handler failed: {e}"),
            ))
        }
    }
}

async fn reply(shared: &StreamShared, id: String, result: Result<Json, RpcError>) {
    let msg = WireMessage {
        id,
        kind: WireMessageKind::Response {
            result: result.into(),
        },
    };
    if let Err(e) = shared.write(&msg).await {
        warn!(error = %e, "failed to write response");
    }
}

/// Settle whatever a frame that failed to decode was meant for.
///
/// A response fails its waiter; a request gets a `malformed message` reply.
/// Frames without a readable id are dropped.
async fn reject_frame(shared: &StreamShared, body: &[u8], reason: String) {
    let Ok(raw) = serde_json::from_slice::<Json>(body) else {
        return;
    };
    let Some(id) = raw.get("id").and_then(Json::as_str).map(str::to_string) else {
        return;
    };
    match raw.get("type").and_then(Json::as_str) {
        Some("response") => {
            if let Some(tx) = shared.take_waiter(&id) {
                let _ = tx.send(Err(TetherError::Serialization(reason)));
            }
        }
        Some("request") => {
            let err = RpcError::new(ErrorKind::MalformedMessage, reason);
            reply(shared, id, Err(err)).await;
        }
        _ => {}
    }
}

/// Write one framed message.
pub async fn write_message<W>(writer: &mut W, msg: &WireMessage, max_size: u32) -> TetherResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = encode_message(msg)?;
    let size = (bytes.len() - 4) as u32;
    if size > max_size {
        return Err(TetherError::MessageTooLarge {
            size,
            max: max_size,
        });
    }
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message. A clean end of stream is `ChannelClosed`.
pub async fn read_message<R>(reader: &mut R, max_size: u32) -> TetherResult<WireMessage>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let body = read_frame(reader, max_size).await?;
    Ok(decode_message(&body)?)
}

/// Read one frame body without decoding it.
async fn read_frame<R>(reader: &mut R, max_size: u32) -> TetherResult<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TetherError::ChannelClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let len = decode_length(&header);
    if len > max_size {
        return Err(TetherError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

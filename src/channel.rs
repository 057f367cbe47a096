//! Persistent chunk channel for one conversation.
//!
//! ## Design
//! - [`ChannelManager::connect`] dials the Socket.IO endpoint, joins the
//!   namespace with the session token and spawns one reader task
//! - The reader task is the producer of a single typed queue of
//!   [`ChannelEvent`]s; the conversation is its only consumer
//! - Events are forwarded in delivery order. No reordering or dedup happens
//!   here, and no reconnect is attempted
//!
//! ## Lifecycle
//! 1. `connect` → handshake (`0` open, `40` connect, `40` ack or `44` error)
//! 2. reader task forwards `chat` events, answers pings
//! 3. socket error or server close → one [`ChannelEvent::Lost`], task ends
//! 4. [`ChannelHandle::close`] (or drop) → disconnect frame, task ends, no
//!    further events are observable

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ChatError, Result};
use crate::frame::{self, Frame};

/// Event name the backend emits chunks under.
pub const CHUNK_EVENT: &str = "chat";
/// Event name the backend emits runtime errors under.
pub const ERROR_EVENT: &str = "error";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the channel hands to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Raw chunk payload, still undecoded.
    Chunk(Value),
    /// The backend rejected the session mid-connection.
    AuthRejected,
    /// The connection dropped. Always the last event.
    Lost(String),
}

// ---------------------------------------------------------------------------
// Producer side
// ---------------------------------------------------------------------------

/// Sending half of a channel's event queue.
#[derive(Debug, Clone)]
pub struct ChannelFeed {
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelFeed {
    /// Returns `false` once the consumer is gone.
    pub fn send(&self, event: ChannelEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn chunk(&self, payload: Value) -> bool {
        self.send(ChannelEvent::Chunk(payload))
    }

    pub fn lost(&self, reason: impl Into<String>) -> bool {
        self.send(ChannelEvent::Lost(reason.into()))
    }

    pub fn auth_rejected(&self) -> bool {
        self.send(ChannelEvent::AuthRejected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ---------------------------------------------------------------------------
// Consumer side
// ---------------------------------------------------------------------------

/// The conversation's end of the channel.
#[derive(Debug)]
pub struct ChannelHandle {
    conversation_id: String,
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    shutdown: Option<oneshot::Sender<()>>,
    reader: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
    closed: bool,
}

impl ChannelHandle {
    /// A channel with no network behind it; events come from the returned
    /// feed. Used for in-process backends and tests.
    pub fn detached(conversation_id: impl Into<String>) -> (ChannelHandle, ChannelFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ChannelHandle {
            conversation_id: conversation_id.into(),
            events: Some(rx),
            shutdown: None,
            reader: None,
            forwarder: None,
            closed: false,
        };
        (handle, ChannelFeed { tx })
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Next event in delivery order, or `None` once the channel is closed
    /// and drained (or handed to [`on_chunk`](Self::on_chunk)).
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.as_mut()?.recv().await
    }

    /// Push-style consumption: invoke `callback` once per event, in delivery
    /// order, until the channel closes. Takes over the queue, so
    /// [`next_event`](Self::next_event) yields `None` afterwards.
    ///
    /// Returns `false` if a consumer was already registered or the channel
    /// is closed.
    pub fn on_chunk<F>(&mut self, mut callback: F) -> bool
    where
        F: FnMut(ChannelEvent) + Send + 'static,
    {
        if self.closed {
            return false;
        }
        let Some(mut rx) = self.events.take() else {
            return false;
        };
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                callback(event);
            }
        }));
        true
    }

    /// Release the connection. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        // Dropping the receiver discards anything still buffered.
        self.events = None;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        // The reader finishes on its own after the shutdown signal.
        self.reader = None;
        debug!(conversation = %self.conversation_id, "channel closed");
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// ChannelManager
// ---------------------------------------------------------------------------

/// Dials chunk channels.
#[derive(Debug, Clone)]
pub struct ChannelManager {
    channel_url: String,
    namespace: String,
    connect_timeout: std::time::Duration,
}

impl ChannelManager {
    pub fn new(config: &ClientConfig) -> Self {
        ChannelManager {
            channel_url: config.channel_url.clone(),
            namespace: config.namespace.clone(),
            connect_timeout: config.connect_timeout(),
        }
    }

    /// Open the channel for `conversation_id`.
    ///
    /// The namespace connect carries `{ token, chat_id }`. The web client only
    /// sends `token`; `chat_id` is extra and lets the backend bind the socket
    /// to the room. Backends that don't look at it ignore it.
    ///
    /// # Errors
    /// - [`ChatError::AuthRejected`] when the handshake answers 401
    /// - [`ChatError::Connect`] on dial failure, timeout or any other
    ///   handshake rejection
    pub async fn connect(&self, conversation_id: &str, token: &str) -> Result<ChannelHandle> {
        let url = frame::engine_url(&self.channel_url);
        let connect_err = |detail: String| ChatError::Connect {
            url: url.clone(),
            detail,
        };

        let (mut socket, _) = tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
            .await
            .map_err(|_| connect_err("timed out".into()))?
            .map_err(|e| connect_err(e.to_string()))?;

        let auth = json!({ "token": token, "chat_id": conversation_id });
        tokio::time::timeout(
            self.connect_timeout,
            handshake(&mut socket, &self.namespace, &auth, &url),
        )
        .await
        .map_err(|_| connect_err("handshake timed out".into()))??;

        info!(conversation = %conversation_id, url = %url, "channel connected");

        let (mut handle, feed) = ChannelHandle::detached(conversation_id);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        handle.shutdown = Some(shutdown_tx);
        handle.reader = Some(tokio::spawn(read_loop(
            socket,
            self.namespace.clone(),
            feed,
            shutdown_rx,
        )));
        Ok(handle)
    }
}

async fn handshake(socket: &mut Socket, namespace: &str, auth: &Value, url: &str) -> Result<()> {
    let fail = |detail: String| ChatError::Connect {
        url: url.to_string(),
        detail,
    };

    while let Some(msg) = socket.next().await {
        let text = match msg {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(reason)) => return Err(fail(format!("closed during handshake: {:?}", reason))),
            Ok(_) => continue,
            Err(e) => return Err(fail(e.to_string())),
        };
        match frame::decode(&text) {
            Frame::Open(_) => socket
                .send(WsMessage::Text(frame::encode_connect(namespace, auth)))
                .await
                .map_err(|e| fail(e.to_string()))?,
            Frame::Ping => socket
                .send(WsMessage::Text(frame::encode_pong().to_string()))
                .await
                .map_err(|e| fail(e.to_string()))?,
            Frame::Connected { namespace: ns } if ns == namespace => return Ok(()),
            Frame::ConnectError { status: Some(401), .. } => return Err(ChatError::AuthRejected),
            Frame::ConnectError { status, message, .. } => {
                return Err(fail(format!("connect rejected (status {:?}): {}", status, message)))
            }
            other => debug!(frame = ?other, "ignoring frame during handshake"),
        }
    }
    Err(fail("connection ended during handshake".into()))
}

async fn read_loop(mut socket: Socket, namespace: String, feed: ChannelFeed, mut shutdown: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                let _ = socket.send(WsMessage::Text(frame::encode_disconnect(&namespace))).await;
                let _ = socket.close(None).await;
                return;
            }
            msg = socket.next() => {
                let text = match msg {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(reason))) => {
                        warn!(reason = ?reason, "channel closed by server");
                        feed.lost("server closed the connection");
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "channel read failed");
                        feed.lost(e.to_string());
                        return;
                    }
                    None => {
                        feed.lost("connection ended");
                        return;
                    }
                };

                match frame::decode(&text) {
                    Frame::Ping => {
                        if let Err(e) = socket.send(WsMessage::Text(frame::encode_pong().to_string())).await {
                            feed.lost(e.to_string());
                            return;
                        }
                    }
                    Frame::Event { namespace: ns, name, payload } if ns == namespace => {
                        if name == CHUNK_EVENT {
                            if !feed.chunk(payload) {
                                return;
                            }
                        } else if name == ERROR_EVENT && is_unauthorized(&payload) {
                            feed.auth_rejected();
                            return;
                        } else {
                            debug!(event = %name, "ignoring channel event");
                        }
                    }
                    Frame::ConnectError { namespace: ns, status: Some(401), .. } if ns == namespace => {
                        feed.auth_rejected();
                        return;
                    }
                    Frame::Disconnect { namespace: ns } if ns == namespace => {
                        feed.lost("server left the namespace");
                        return;
                    }
                    Frame::Close => {
                        feed.lost("server closed the session");
                        return;
                    }
                    other => debug!(frame = ?other, "ignoring frame"),
                }
            }
        }
    }
}

fn is_unauthorized(payload: &Value) -> bool {
    let payload = match payload {
        Value::String(encoded) => serde_json::from_str(encoded).unwrap_or(Value::Null),
        other => other.clone(),
    };
    payload
        .get("status")
        .or_else(|| payload.pointer("/data/status"))
        .and_then(Value::as_u64)
        == Some(401)
}

//! Remote log forwarding over a bidirectional message socket.
//!
//! One JSON object per message, three shapes:
//!
//! - server → client on attach: `{"env": {"PERCY_DEBUG": …, "PERCY_LOGLEVEL": …}}`
//! - client → server on attach: `{"logAll": [entry, …]}` with `meta.remote = true`
//! - either direction afterwards: `{"log": [debug, level, message, meta]}`
//!
//! The transport is any text-frame socket; [`LogSocket::ws_connect`] wires a
//! WebSocket, [`socket_pair`] wires two in-process ends together.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::Error;
use crate::logger::{LogEntry, LogLevel, Logger, ENV_DEBUG, ENV_LOGLEVEL};

/// Socket readiness values, matching the usual WebSocket convention.
pub const SOCKET_CONNECTING: u8 = 0;
pub const SOCKET_OPEN: u8 = 1;
pub const SOCKET_CLOSED: u8 = 3;

/// Default time allowed for the client-side connect race.
pub const REMOTE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Outgoing half of a [`LogSocket`], held by the logger while remote.
#[derive(Clone)]
pub struct RemoteSender {
    tx: mpsc::UnboundedSender<String>,
    state: watch::Receiver<u8>,
}

impl RemoteSender {
    pub fn is_open(&self) -> bool {
        *self.state.borrow() == SOCKET_OPEN
    }

    pub fn send(&self, text: String) -> Result<(), Error> {
        if !self.is_open() {
            return Err(Error::Socket("socket is not open".into()));
        }
        self.tx
            .send(text)
            .map_err(|_| Error::Socket("socket closed".into()))
    }
}

/// A bidirectional text-message socket carrying logger frames.
pub struct LogSocket {
    outgoing: mpsc::UnboundedSender<String>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    state: watch::Receiver<u8>,
    state_tx: Arc<watch::Sender<u8>>,
}

impl LogSocket {
    pub fn ready_state(&self) -> u8 {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == SOCKET_OPEN
    }

    pub fn close(&self) {
        self.state_tx.send_replace(SOCKET_CLOSED);
    }

    pub fn send(&self, text: String) -> Result<(), Error> {
        self.sender().send(text)
    }

    pub fn sender(&self) -> RemoteSender {
        RemoteSender {
            tx: self.outgoing.clone(),
            state: self.state.clone(),
        }
    }

    /// Take the incoming message stream. Each socket has one reader.
    pub fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.incoming.lock().unwrap().take()
    }

    /// Wrap an established WebSocket, spawning its pump tasks.
    pub fn from_ws<S>(ws: WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let (state_tx, state) = watch::channel(SOCKET_OPEN);
        let state_tx = Arc::new(state_tx);

        let writer_state = state_tx.clone();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            writer_state.send_replace(SOCKET_CLOSED);
        });

        let reader_state = state_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            reader_state.send_replace(SOCKET_CLOSED);
        });

        Self {
            outgoing: out_tx,
            incoming: Mutex::new(Some(in_rx)),
            state,
            state_tx,
        }
    }

    /// Connect a WebSocket client to `url`.
    pub async fn ws_connect(url: &str) -> Result<Self, Error> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| Error::Socket(e.to_string()))?;
        Ok(Self::from_ws(ws))
    }
}

/// Two in-process sockets wired back to back. Useful for tests and for
/// same-process producer/consumer pairs.
pub fn socket_pair() -> (LogSocket, LogSocket) {
    let (a_tx, b_in) = mpsc::unbounded_channel();
    let (b_tx, a_in) = mpsc::unbounded_channel();
    let (a_state_tx, a_state) = watch::channel(SOCKET_OPEN);
    let (b_state_tx, b_state) = watch::channel(SOCKET_OPEN);
    (
        LogSocket {
            outgoing: a_tx,
            incoming: Mutex::new(Some(a_in)),
            state: a_state,
            state_tx: Arc::new(a_state_tx),
        },
        LogSocket {
            outgoing: b_tx,
            incoming: Mutex::new(Some(b_in)),
            state: b_state,
            state_tx: Arc::new(b_state_tx),
        },
    )
}

/// Server-side attachment returned by [`Logger::connect`]. Dropping (or
/// calling [`detach`](Self::detach)) stops merging peer messages.
pub struct RemoteAttachment {
    reader: tokio::task::JoinHandle<()>,
}

impl RemoteAttachment {
    pub fn detach(self) {
        self.reader.abort();
    }
}

impl Drop for RemoteAttachment {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl Logger {
    /// Attach as the server side of a log socket.
    ///
    /// Sends the local environment snapshot, then merges incoming `{log}`
    /// and `{logAll}` frames into this logger.
    pub fn connect(&self, socket: &LogSocket) -> Result<RemoteAttachment, Error> {
        let env = json!({
            "env": {
                ENV_DEBUG: std::env::var(ENV_DEBUG).ok(),
                ENV_LOGLEVEL: std::env::var(ENV_LOGLEVEL).ok(),
            }
        });
        socket.send(env.to_string())?;

        let mut rx = socket
            .take_incoming()
            .ok_or_else(|| Error::Socket("socket already has a reader".into()))?;
        let logger = self.clone();
        let reader = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                logger.handle_remote_frame(&text);
            }
        });
        Ok(RemoteAttachment { reader })
    }

    /// Attach as the client side: race `connect` against `timeout`, flush
    /// the retained store as one `{logAll}` frame, then forward every local
    /// call over the socket. On failure, log two debug lines and keep local
    /// behavior unchanged.
    pub async fn remote<F>(&self, connect: F, timeout: Duration)
    where
        F: Future<Output = Result<LogSocket, Error>>,
    {
        let socket = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(socket)) if socket.is_open() => socket,
            Ok(Ok(_)) => {
                self.remote_fallback(&Error::Socket("socket did not open".into()));
                return;
            }
            Ok(Err(err)) => {
                self.remote_fallback(&err);
                return;
            }
            Err(_) => {
                self.remote_fallback(&Error::Socket(format!(
                    "timed out after {}ms",
                    timeout.as_millis()
                )));
                return;
            }
        };

        let entries = self.snapshot_entries_for_remote();
        let frame = json!({ "logAll": entries });
        if let Err(err) = socket.send(frame.to_string()) {
            self.remote_fallback(&err);
            return;
        }

        self.set_remote(socket.sender());

        if let Some(mut rx) = socket.take_incoming() {
            let logger = self.clone();
            tokio::spawn(async move {
                while let Some(text) = rx.recv().await {
                    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&text) {
                        if let Some(Value::Object(env)) = map.get("env") {
                            logger.apply_env(env);
                        }
                    }
                }
                logger.clear_remote();
            });
        }
    }

    fn remote_fallback(&self, err: &Error) {
        self.log(
            "logger",
            LogLevel::Debug,
            "Unable to connect to remote logger",
            Map::new(),
        );
        self.log("logger", LogLevel::Debug, &err.to_string(), Map::new());
    }

    fn handle_remote_frame(&self, text: &str) {
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) else {
            return;
        };

        if let Some(Value::Array(parts)) = map.get("log") {
            let debug = parts.first().and_then(Value::as_str).unwrap_or_default();
            let level = parts
                .get(1)
                .and_then(Value::as_str)
                .and_then(LogLevel::parse)
                .unwrap_or(LogLevel::Info);
            // An error message arrives pre-serialized as {message, stack}.
            let message = match parts.get(2) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Object(err)) => err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                _ => String::new(),
            };
            let meta = match parts.get(3) {
                Some(Value::Object(meta)) => meta.clone(),
                _ => Map::new(),
            };
            self.log(debug, level, &message, meta);
        } else if let Some(Value::Array(entries)) = map.get("logAll") {
            for entry in entries {
                if let Ok(entry) = serde_json::from_value::<LogEntry>(entry.clone()) {
                    self.retain(entry);
                }
            }
        }
    }
}

//! JSON-RPC peer over a framed byte stream.
//!
//! One peer per language-server process: an atomic request counter, a
//! pending table of oneshot senders keyed by request id, and a reader task
//! that decodes frames and resolves exactly one pending entry per response.
//! The peer is generic over the underlying streams so tests drive it with an
//! in-memory duplex instead of a child process.

use super::framing::{self, FrameDecoder};
use super::LspError;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Deserialize)]
struct Incoming {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcErrorObject>>>>>;

pub struct RpcPeer {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Pending,
    next_id: AtomicU64,
}

impl RpcPeer {
    /// Start a peer over the given streams. The reader task runs until EOF;
    /// at that point all pending requests are dropped and their callers
    /// observe [`LspError::Closed`].
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Arc<Self> {
        let peer = Arc::new(Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        });
        tokio::spawn(read_loop(reader, Arc::clone(&peer.pending)));
        peer
    }

    /// Send a request and await the correlated response. A response with an
    /// `error` member rejects with [`LspError::Rpc`].
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, LspError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let message = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(e) = self.write(&message).await {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(LspError::Rpc {
                code: error.code,
                message: error.message,
            }),
            Err(_) => Err(LspError::Closed),
        }
    }

    /// Send a notification. Notifications carry no id and never complete.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), LspError> {
        let message = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write(&message).await
    }

    async fn write(&self, message: &Value) -> Result<(), LspError> {
        let frame = framing::encode(message);
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| LspError::Transport(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| LspError::Transport(e.to_string()))
    }
}

async fn read_loop(mut reader: impl AsyncRead + Send + Unpin, pending: Pending) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                decoder.push(&chunk[..n]);
                while let Some(body) = decoder.next() {
                    dispatch(&body, &pending);
                }
            }
        }
    }
    // Server closed: in-flight requests are left unresolved; dropping their
    // senders errors the callers out.
    pending.lock().unwrap().clear();
}

fn dispatch(body: &[u8], pending: &Pending) {
    let incoming: Incoming = match serde_json::from_slice(body) {
        Ok(m) => m,
        Err(e) => {
            warn!("skipping malformed language-server message: {e}");
            return;
        }
    };
    match (incoming.id, incoming.method) {
        (Some(id), None) => {
            let entry = pending.lock().unwrap().remove(&id);
            match entry {
                Some(tx) => {
                    let outcome = match incoming.error {
                        Some(error) => Err(error),
                        None => Ok(incoming.result.unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(outcome);
                }
                None => warn!("response for unknown request id {id}"),
            }
        }
        (_, Some(method)) => {
            // Server-originated notification or request; the core consumes
            // neither.
            debug!("ignoring server message {method}");
        }
        (None, None) => warn!("language-server message with neither id nor method"),
    }
}

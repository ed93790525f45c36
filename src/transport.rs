//! Line-delimited JSON over TCP.
//!
//! Each line from a client is one frame. Commands are handled in their own
//! task, so a slow command never holds up the connection; replies go out
//! in completion order and carry a `request_id`. If the client has gone
//! away by then, the reply is dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::backoff::AcceptBackoff;
use crate::history::HistoryRecord;
use crate::pipeline::{CommandRequest, OutcomeMessage, Router};

/// Longest accepted frame, newline included.
pub const MAX_LINE_BYTES: usize = 16 * 1024;

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 500;

/// Pending replies per connection.
const REPLY_QUEUE: usize = 64;

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Command {
        command: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    History {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default = "default_history_limit")]
        limit: usize,
    },
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

#[derive(Debug, Serialize)]
pub struct Reply {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: ReplyBody,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyBody {
    Outcome { outcome: OutcomeMessage },
    History { records: Vec<HistoryRecord> },
    Error { message: String },
}

impl Reply {
    fn new(body: ReplyBody) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            body,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self::new(ReplyBody::Error {
            message: message.into(),
        })
    }
}

/// Accepts connections until the listener fails for good.
pub async fn serve(listener: TcpListener, router: Arc<Router>) -> Result<()> {
    let mut backoff = AcceptBackoff::default();

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                backoff.accepted();
                debug!("Connection from {peer}");
                let router = Arc::clone(&router);
                tokio::spawn(async move {
                    let (reader, writer) = stream.into_split();
                    if let Err(e) = handle_connection(reader, writer, peer, router).await {
                        debug!("Connection {peer} closed: {e}");
                    }
                });
            }
            Err(e) => match backoff.failed() {
                Some(delay) => {
                    warn!("Accept failed ({e}), retrying in {}ms", delay.as_millis());
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!("Giving up after {} failed accepts: {e}", backoff.failures());
                    return Err(anyhow!("accept failed repeatedly: {e}"));
                }
            },
        }
    }
}

async fn handle_connection<R, W>(
    reader: R,
    writer: W,
    peer: SocketAddr,
    router: Arc<Router>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Reply>(REPLY_QUEUE);
    let writer_task = tokio::spawn(write_replies(writer, rx));

    let client_identity = peer.ip().to_string();
    // Frames without a session_id share a session private to this connection
    let connection_session = Uuid::new_v4().to_string();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            break;
        }
        if !line.ends_with(b"\n") && line.len() >= MAX_LINE_BYTES {
            warn!("Frame from {peer} exceeds {MAX_LINE_BYTES} bytes, closing");
            let _ = tx
                .send(Reply::error(format!("frame exceeds {MAX_LINE_BYTES} bytes")))
                .await;
            break;
        }

        let text = String::from_utf8_lossy(&line);
        if text.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<ClientFrame>(text.trim()) {
            Ok(ClientFrame::Command {
                command,
                session_id,
            }) => {
                let session_id = session_id.unwrap_or_else(|| connection_session.clone());
                let request = CommandRequest::new(command, session_id, client_identity.clone());
                tokio::spawn(run_command(Arc::clone(&router), request, tx.clone()));
            }
            Ok(ClientFrame::History { session_id, limit }) => {
                let session_id = session_id.unwrap_or_else(|| connection_session.clone());
                let limit = limit.min(MAX_HISTORY_LIMIT);
                let reply = match router.history(&client_identity, &session_id, limit).await {
                    Ok(records) => Reply::new(ReplyBody::History { records }),
                    Err(outcome) => Reply::new(ReplyBody::Outcome { outcome }),
                };
                if tx.send(reply).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Unparseable frame from {peer}: {e}");
                if tx.send(Reply::error(format!("invalid frame: {e}"))).await.is_err() {
                    break;
                }
            }
        }
    }

    // In-flight commands keep their own sender; the writer finishes after them
    drop(tx);
    let _ = writer_task.await;
    Ok(())
}

/// Runs one request. A panic inside the pipeline becomes `InternalError`
/// for this request only.
async fn run_command(router: Arc<Router>, request: CommandRequest, tx: mpsc::Sender<Reply>) {
    let outcome = match tokio::spawn(async move { router.handle(request).await }).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Request task failed: {e}");
            OutcomeMessage::InternalError
        }
    };
    if tx.send(Reply::new(ReplyBody::Outcome { outcome })).await.is_err() {
        debug!("Client gone, dropping result");
    }
}

async fn write_replies<W>(mut writer: W, mut rx: mpsc::Receiver<Reply>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(reply) = rx.recv().await {
        let mut json = match serde_json::to_string(&reply) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize reply: {e}");
                continue;
            }
        };
        json.push('\n');
        if let Err(e) = writer.write_all(json.as_bytes()).await {
            debug!("Write failed, dropping remaining replies: {e}");
            // Drain so in-flight senders are not blocked
            while rx.recv().await.is_some() {}
            return;
        }
    }
    let _ = writer.shutdown().await;
}

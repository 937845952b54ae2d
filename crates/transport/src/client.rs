//! Push-channel transport for per-job status streams.
//!
//! [`Transport`] is the seam the connection hub opens channels through.
//! [`WsTransport`] implements it over WebSocket: one connection per job,
//! authenticated with the session's bearer token.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use jobsync_core::{JobId, JobKind};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::api::build_url;

/// Inbound text frames of one job channel, in delivery order.
///
/// The stream ends when the remote side closes the channel. An `Err`
/// item means the channel broke and no further frames will follow.
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// Opens push channels keyed by job id.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the status channel for one job.
    async fn open(&self, job_id: &JobId, kind: JobKind) -> Result<FrameStream, TransportError>;
}

/// WebSocket transport targeting `{ws_url}/ws/{kind}/{job_id}`.
#[derive(Debug, Clone)]
pub struct WsTransport {
    ws_url: String,
    auth_token: Option<String>,
}

impl WsTransport {
    /// * `ws_url`     - WebSocket base URL, e.g. `wss://api.example.com`.
    /// * `auth_token` - bearer credential appended as a `token` query parameter.
    pub fn new(ws_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            ws_url: ws_url.into().trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Full channel URL for one job, with the id and token percent-encoded.
    pub fn channel_url(&self, job_id: &JobId, kind: JobKind) -> Result<String, TransportError> {
        let mut url = build_url(&self.ws_url, &["ws", kind.endpoint(), job_id.as_str()])
            .map_err(TransportError::Connection)?;
        if let Some(token) = &self.auth_token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url.into())
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, job_id: &JobId, kind: JobKind) -> Result<FrameStream, TransportError> {
        let url = self.channel_url(job_id, kind)?;

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            TransportError::Connection(format!(
                "Failed to open channel for job {job_id} at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::debug!(job_id = %job_id, %kind, "WebSocket handshake complete");

        let frames = stream::unfold(ws_stream, |mut ws| async move {
            loop {
                let msg = match ws.next().await {
                    Some(msg) => msg,
                    None => return None,
                };
                match msg {
                    Ok(Message::Text(text)) => return Some((Ok(text), ws)),
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(?frame, "Job channel close frame received");
                        return None;
                    }
                    Ok(Message::Binary(_)) => {
                        tracing::trace!("Ignoring binary frame on job channel");
                    }
                    // Ping/pong are answered by tungstenite.
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                    Err(e) => return Some((Err(TransportError::Protocol(e.to_string())), ws)),
                }
            }
        });

        Ok(frames.boxed())
    }
}

/// Errors raised while opening or reading a job channel.
///
/// Never fatal to the session: a broken channel leaves the job pending
/// for the poll supervisor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Failed to establish the channel.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an already-established channel.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The channel did not open within the allowed time.
    #[error("Channel open timed out after {0:?}")]
    Timeout(Duration),
}

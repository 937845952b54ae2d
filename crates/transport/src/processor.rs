//! Per-channel frame processing loop.
//!
//! Reads text frames from one job channel, classifies them through the
//! [`router`](jobsync_core::router), and hands every resulting update to
//! the [`UpdateSink`]. Unparseable frames are logged and skipped.

use futures::StreamExt;
use jobsync_core::router::classify_on_channel;
use jobsync_core::JobId;
use tokio_util::sync::CancellationToken;

use crate::client::{FrameStream, TransportError};
use crate::hub::UpdateSink;

/// How a channel's frame loop ended.
#[derive(Debug)]
pub enum ChannelExit {
    /// A terminal message for the channel's own job was delivered.
    Settled,
    /// The channel was untracked.
    Cancelled,
    /// The remote side closed the stream.
    RemoteClosed,
    /// The stream broke.
    Errored(TransportError),
}

/// Process frames until the job settles, the channel is cancelled, or
/// the stream ends.
///
/// Cancellation is checked before every frame so that nothing read
/// after an untrack reaches the sink.
pub async fn process_frames(
    frames: &mut FrameStream,
    job_id: &JobId,
    sink: &dyn UpdateSink,
    cancel: &CancellationToken,
) -> ChannelExit {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ChannelExit::Cancelled,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(text)) => {
                if handle_frame(&text, job_id, sink) {
                    return ChannelExit::Settled;
                }
            }
            Some(Err(e)) => return ChannelExit::Errored(e),
            None => return ChannelExit::RemoteClosed,
        }
    }
}

/// Classify and deliver one frame. Returns `true` when the frame was a
/// terminal update for the channel's own job.
fn handle_frame(text: &str, job_id: &JobId, sink: &dyn UpdateSink) -> bool {
    match classify_on_channel(text, job_id) {
        Ok(event) => {
            let settles_channel = event.status.is_terminal() && &event.job_id == job_id;
            let message_job_id = event.job_id.clone();
            let status = event.status;
            let outcome = sink.deliver(event);
            tracing::debug!(
                job_id = %message_job_id,
                %status,
                ?outcome,
                "Channel update reconciled",
            );
            settles_channel
        }
        Err(e) => {
            tracing::warn!(
                job_id = %job_id,
                error = %e,
                raw_message = %text,
                "Failed to parse channel message",
            );
            false
        }
    }
}

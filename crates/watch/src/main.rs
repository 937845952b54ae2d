//! `jobsync-watch` -- follow generation jobs until they settle.
//!
//! Tracks every job given on the command line as `kind:id` (for example
//! `images:42` or `voiceover:abc`). With no arguments it discovers the
//! configured user's in-flight jobs instead. Logs each job as it settles
//! and exits once nothing is pending, or on Ctrl-C.
//!
//! # Environment variables
//!
//! | Variable     | Required | Default | Description                        |
//! |--------------|----------|---------|------------------------------------|
//! | `JOBSYNC_*`  | no       | --      | See `SyncConfig::from_env`         |
//! | `LOG_FORMAT` | no       | `text`  | `json` for structured log lines    |
//! | `RUST_LOG`   | no       | --      | Overrides the default log filter   |

use anyhow::Context;
use jobsync_core::{JobId, JobKind, JobStatus};
use jobsync_sync::{SyncConfig, SyncSession};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "jobsync_watch=info,jobsync_sync=info,jobsync_transport=info".into()
            }),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();

    let targets = std::env::args()
        .skip(1)
        .map(|arg| parse_target(&arg))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let config = SyncConfig::from_env().context("Invalid JOBSYNC_* configuration")?;
    let session = SyncSession::connect(&config);
    let mut settled = session.subscribe();

    if targets.is_empty() {
        session.discover().await;
    } else {
        for (kind, job_id) in targets {
            session.track(job_id, kind);
        }
    }

    let pending = session.pending_jobs().len();
    tracing::info!(pending, "Watching jobs");

    if pending > 0 {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted");
                    break;
                }
                received = settled.recv() => match received {
                    Ok(job) => {
                        match job.status {
                            JobStatus::Completed => tracing::info!(
                                job_id = %job.id,
                                kind = %job.kind,
                                media_url = ?job.media_url(),
                                "Job completed",
                            ),
                            _ => tracing::warn!(
                                job_id = %job.id,
                                kind = %job.kind,
                                error = ?job.error,
                                "Job failed",
                            ),
                        }
                        if session.pending_jobs().is_empty() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Missed settlement notifications");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

/// Parse a `kind:id` argument.
fn parse_target(arg: &str) -> anyhow::Result<(JobKind, JobId)> {
    let (kind, id) = arg
        .split_once(':')
        .with_context(|| format!("Expected kind:id, got {arg:?}"))?;
    let kind: JobKind = kind.parse()?;
    anyhow::ensure!(!id.is_empty(), "Missing job id in {arg:?}");
    Ok((kind, JobId::new(id)))
}

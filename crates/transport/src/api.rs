//! REST client for job submission and status fetches.
//!
//! [`JobService`] is the seam the session and poll supervisor talk to.
//! [`HttpJobService`] implements it with [`reqwest`].

use async_trait::async_trait;
use jobsync_core::{JobId, JobKind, JobSnapshot};
use reqwest::Url;
use serde::Deserialize;

/// Submission and status fetch endpoints of the generation backend.
#[async_trait]
pub trait JobService: Send + Sync {
    /// Submit a new job and return its server-assigned id.
    async fn submit(&self, kind: JobKind, params: &serde_json::Value)
        -> Result<JobId, FetchError>;

    /// Fetch the authoritative state of one job.
    async fn fetch_status(&self, job_id: &JobId, kind: JobKind)
        -> Result<JobSnapshot, FetchError>;

    /// Fetch the state of every recent job belonging to a user.
    async fn fetch_statuses(&self, user_id: &str) -> Result<Vec<JobSnapshot>, FetchError>;
}

/// HTTP client for the generation backend.
#[derive(Debug, Clone)]
pub struct HttpJobService {
    client: reqwest::Client,
    api_url: String,
    auth_token: Option<String>,
}

/// Response returned by the submission endpoint.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued job.
    #[serde(alias = "job_id")]
    pub id: JobId,
}

/// Batched status responses come either bare or wrapped.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SnapshotList {
    Bare(Vec<JobSnapshot>),
    Wrapped { jobs: Vec<JobSnapshot> },
}

/// Errors from the REST layer. Poll fetch errors are retried next cycle.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The HTTP request itself failed (network, DNS, TLS, decoding).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The configured base URL cannot be extended into an endpoint.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The backend returned a non-2xx status code.
    #[error("Job API error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

impl HttpJobService {
    /// * `api_url`    - Base HTTP URL, e.g. `https://api.example.com`.
    /// * `auth_token` - bearer credential sent with every request.
    pub fn new(api_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url, auth_token)
    }

    /// Reuse an existing [`reqwest::Client`] (shared connection pool).
    pub fn with_client(
        client: reqwest::Client,
        api_url: impl Into<String>,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    pub fn jobs_url(&self, kind: JobKind) -> Result<Url, FetchError> {
        build_url(&self.api_url, &[kind.endpoint(), "jobs"]).map_err(FetchError::InvalidUrl)
    }

    pub fn job_url(&self, job_id: &JobId, kind: JobKind) -> Result<Url, FetchError> {
        build_url(&self.api_url, &[kind.endpoint(), "jobs", job_id.as_str()])
            .map_err(FetchError::InvalidUrl)
    }

    pub fn user_jobs_url(&self, user_id: &str) -> Result<Url, FetchError> {
        build_url(&self.api_url, &["users", user_id, "jobs"]).map_err(FetchError::InvalidUrl)
    }

    // ---- private helpers ----

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Ensure the response has a success status code, or turn it into a
    /// [`FetchError::Api`] carrying the status and body text.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, FetchError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(FetchError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, FetchError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

/// Append percent-encoded path segments to `base`.
pub(crate) fn build_url(base: &str, segments: &[&str]) -> Result<Url, String> {
    let mut url = Url::parse(base).map_err(|e| format!("{base}: {e}"))?;
    url.path_segments_mut()
        .map_err(|_| format!("{base} cannot carry a path"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[async_trait]
impl JobService for HttpJobService {
    async fn submit(
        &self,
        kind: JobKind,
        params: &serde_json::Value,
    ) -> Result<JobId, FetchError> {
        let response = self
            .authorize(self.client.post(self.jobs_url(kind)?))
            .json(params)
            .send()
            .await?;

        let submitted: SubmitResponse = Self::parse_response(response).await?;
        tracing::info!(job_id = %submitted.id, %kind, "Job submitted");
        Ok(submitted.id)
    }

    async fn fetch_status(&self, job_id: &JobId, kind: JobKind) -> Result<JobSnapshot, FetchError> {
        let response = self
            .authorize(self.client.get(self.job_url(job_id, kind)?))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn fetch_statuses(&self, user_id: &str) -> Result<Vec<JobSnapshot>, FetchError> {
        let response = self
            .authorize(self.client.get(self.user_jobs_url(user_id)?))
            .send()
            .await?;

        let list: SnapshotList = Self::parse_response(response).await?;
        Ok(match list {
            SnapshotList::Bare(jobs) | SnapshotList::Wrapped { jobs } => jobs,
        })
    }
}

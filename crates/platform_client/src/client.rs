//! HTTP client for the platform API.

use crate::api::PlatformApi;
use crate::config::PlatformConfig;
use crate::error::{PlatformError, PlatformResult};
use crate::types::{CancelRequest, JobId, JobSpec, JobStatus, LogsResponse, SubmitResponse};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::debug;

/// Header carrying [`JobSpec::request_id`], so a retried submit cannot create a second job.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Talks to the platform over HTTPS with bearer-token authentication.
#[derive(Debug, Clone)]
pub struct HttpPlatformClient {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpPlatformClient {
    pub fn new(config: &PlatformConfig) -> PlatformResult<Self> {
        if config.token.is_empty() {
            return Err(PlatformError::Config("platform token is empty".to_string()));
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(PlatformError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn submit_request(&self, spec: &JobSpec) -> RequestBuilder {
        self.client
            .post(self.url("/v1/jobs"))
            .bearer_auth(&self.token)
            .header(IDEMPOTENCY_HEADER, spec.request_id.as_str())
            .json(spec)
    }

    async fn check(response: Response, job_id: Option<&JobId>) -> PlatformResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(error_for_status(status, body, job_id))
    }
}

/// Maps an unsuccessful HTTP status onto the platform error taxonomy.
pub fn error_for_status(status: StatusCode, body: String, job_id: Option<&JobId>) -> PlatformError {
    let detail = if body.is_empty() { status.to_string() } else { format!("{status}: {body}") };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PlatformError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::PAYMENT_REQUIRED => PlatformError::QuotaExceeded(detail),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            PlatformError::ServiceUnavailable(detail)
        }
        StatusCode::NOT_FOUND => match job_id {
            Some(id) => PlatformError::JobNotFound(id.to_string()),
            None => PlatformError::Protocol(detail),
        },
        _ => PlatformError::Protocol(detail),
    }
}

/// Connection failures and timeouts count as the service being unavailable. Retrying a
/// timed-out submit is safe because every submit carries an idempotency key.
fn transport_error(err: reqwest::Error) -> PlatformError {
    if err.is_connect() || err.is_timeout() {
        PlatformError::ServiceUnavailable(err.to_string())
    } else {
        PlatformError::Http(err)
    }
}

#[async_trait]
impl PlatformApi for HttpPlatformClient {
    async fn submit_job(&self, spec: &JobSpec) -> PlatformResult<JobId> {
        let response = self
            .submit_request(spec)
            .send()
            .await
            .map_err(transport_error)?;
        let response = Self::check(response, None).await?;
        let body: SubmitResponse = response.json().await.map_err(PlatformError::Http)?;
        debug!(job_id = %body.job_id, worker_id = %spec.worker_id, "Submitted platform job");
        Ok(body.job_id)
    }

    async fn poll_job(&self, job_id: &JobId) -> PlatformResult<JobStatus> {
        let response = self
            .client
            .get(self.url(&format!("/v1/jobs/{job_id}")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;
        let response = Self::check(response, Some(job_id)).await?;
        response.json().await.map_err(PlatformError::Http)
    }

    async fn cancel_job(&self, job_id: &JobId, force: bool) -> PlatformResult<()> {
        let response = self
            .client
            .post(self.url(&format!("/v1/jobs/{job_id}/cancel")))
            .bearer_auth(&self.token)
            .json(&CancelRequest { force })
            .send()
            .await
            .map_err(transport_error)?;
        Self::check(response, Some(job_id)).await?;
        debug!(job_id = %job_id, force, "Requested platform job cancellation");
        Ok(())
    }

    async fn fetch_logs(&self, job_id: &JobId) -> PlatformResult<Vec<String>> {
        let response = self
            .client
            .get(self.url(&format!("/v1/jobs/{job_id}/logs")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;
        let response = Self::check(response, Some(job_id)).await?;
        let body: LogsResponse = response.json().await.map_err(PlatformError::Http)?;
        Ok(body.lines)
    }
}

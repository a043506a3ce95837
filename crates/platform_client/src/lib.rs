//! # Platform Client
//!
//! Thin client for the remote cluster-management service that runs cloud workers:
//! job submission, status polling, cancellation and log retrieval.
//!
//! [`PlatformApi`] is the seam used by the worker launcher. [`HttpPlatformClient`] speaks
//! to the real service; wrap it in [`RetryingClient`] to retry
//! [`PlatformError::ServiceUnavailable`] with bounded exponential backoff. Authentication
//! and quota failures are never retried.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod retry;
pub mod types;

pub use api::PlatformApi;
pub use client::HttpPlatformClient;
pub use config::PlatformConfig;
pub use error::{PlatformError, PlatformResult};
pub use retry::{RetryPolicy, RetryingClient};
pub use types::{JobId, JobSpec, JobStatus};

use std::sync::Arc;

/// Builds the HTTP client wrapped in the configured retry policy.
pub fn connect(config: &PlatformConfig) -> PlatformResult<Arc<dyn PlatformApi>> {
    let client = HttpPlatformClient::new(config)?;
    tracing::info!(base_url = %config.base_url, project = %config.project, "Platform client ready");
    Ok(Arc::new(RetryingClient::new(client, config.retry)))
}

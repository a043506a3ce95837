use crate::retry::RetryPolicy;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// Base URL of the platform API, without a trailing slash
    pub base_url: String,
    pub project: String,
    /// Bearer token sent with every request
    pub token: String,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9876".to_string(),
            project: "default".to_string(),
            token: String::new(),
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier assigned by the platform to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        JobId(value.to_string())
    }
}

/// Description of one remote worker job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Platform project the job is billed to
    pub project: String,
    pub deployment: String,
    pub worker_type: String,
    pub worker_id: String,
    /// Location of the schema manifest as seen by the job
    pub schema_uri: String,
    pub snapshot_uri: String,
    pub schema_hash: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Idempotency key. The platform answers a repeated submit carrying the same key
    /// with the job it already created.
    #[serde(default)]
    pub request_id: String,
}

/// Remote job state as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Exited { code: i32 },
    Cancelled,
    /// The platform lost track of the job, e.g. its node disappeared.
    Lost,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Exited { .. } | JobStatus::Cancelled | JobStatus::Lost)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SubmitResponse {
    pub job_id: JobId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CancelRequest {
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LogsResponse {
    #[serde(default)]
    pub lines: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_wire_format() {
        let status: JobStatus = serde_json::from_str(r#"{"state":"exited","code":3}"#).unwrap();
        assert_eq!(status, JobStatus::Exited { code: 3 });
        assert!(status.is_terminal());

        let running: JobStatus = serde_json::from_str(r#"{"state":"running"}"#).unwrap();
        assert_eq!(running, JobStatus::Running);
        assert!(!running.is_terminal());
    }
}

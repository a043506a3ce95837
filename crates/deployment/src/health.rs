//! Worker health sampling for running deployments.

use crate::handle::{WorkerHandle, WorkerHealth, WorkerId};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Overall health of a deployment's workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSample {
    pub worker: WorkerId,
    pub health: WorkerHealth,
    /// Resident memory, local workers only
    pub memory_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub samples: Vec<WorkerSample>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    /// First worker that exited or stopped answering.
    pub fn first_lost(&self) -> Option<&WorkerSample> {
        self.samples.iter().find(|s| s.health.is_gone())
    }
}

/// Polls workers and samples their memory use.
pub struct HealthMonitor {
    system: Mutex<System>,
    memory_warning_mb: u64,
}

impl HealthMonitor {
    pub fn new(memory_warning_mb: u64) -> Self {
        Self {
            system: Mutex::new(System::new()),
            memory_warning_mb,
        }
    }

    /// Polls every handle concurrently and summarizes the result.
    pub async fn check(&self, handles: &[WorkerHandle]) -> HealthReport {
        let healths = join_all(handles.iter().map(|h| h.poll())).await;
        let pids: Vec<u32> = handles.iter().filter_map(|h| h.pid()).collect();
        let memory = self.memory_mb(&pids);

        let mut warnings = Vec::new();
        let mut errors = Vec::new();
        let mut samples = Vec::with_capacity(handles.len());
        for (handle, health) in handles.iter().zip(healths) {
            let memory_mb = handle.pid().and_then(|pid| memory.get(&pid).copied());
            match health {
                WorkerHealth::Exited(code) => errors.push(format!("{} exited with code {}", handle.id(), code)),
                WorkerHealth::Unreachable => errors.push(format!("{} is unreachable", handle.id())),
                WorkerHealth::Pending => warnings.push(format!("{} is not running yet", handle.id())),
                WorkerHealth::Alive => {}
            }
            if let Some(mb) = memory_mb {
                if mb > self.memory_warning_mb {
                    warnings.push(format!("{} high memory usage: {}MB", handle.id(), mb));
                }
            }
            samples.push(WorkerSample {
                worker: handle.id().clone(),
                health,
                memory_mb,
            });
        }

        let status = if !errors.is_empty() {
            HealthStatus::Unhealthy
        } else if !warnings.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            samples,
            warnings,
            errors,
            timestamp: Utc::now(),
        }
    }

    fn memory_mb(&self, pids: &[u32]) -> HashMap<u32, u64> {
        if pids.is_empty() {
            return HashMap::new();
        }
        let targets: Vec<Pid> = pids.iter().map(|&p| Pid::from_u32(p)).collect();
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes(ProcessesToUpdate::Some(&targets), true);
        pids.iter()
            .filter_map(|&pid| {
                system
                    .process(Pid::from_u32(pid))
                    .map(|p| (pid, p.memory() / 1024 / 1024))
            })
            .collect()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(2048)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_deployment_is_healthy() {
        let report = HealthMonitor::default().check(&[]).await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.first_lost().is_none());
    }

    #[test]
    fn test_memory_of_own_process() {
        let monitor = HealthMonitor::default();
        let memory = monitor.memory_mb(&[std::process::id()]);
        assert!(memory.contains_key(&std::process::id()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_worker_is_unhealthy() {
        use crate::handle::LocalProcessHandle;

        let dir = tempfile::tempdir().unwrap();
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("exit 4")
            .spawn()
            .unwrap();
        let handle = WorkerHandle::Local(
            LocalProcessHandle::new(WorkerId::from("d-sim-0"), child, dir.path().join("l.log")).unwrap(),
        );
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let report = HealthMonitor::default().check(&[handle]).await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.first_lost().unwrap().health, WorkerHealth::Exited(4));
    }
}

//! # Deployment Controller
//!
//! Owns every deployment and is the only component that changes a deployment's state.
//!
//! ## Lifecycle
//!
//! [`DeploymentController::start`] reserves the deployment name, then runs the start
//! pipeline on a background task: schema, snapshot, worker launch, startup wait. The
//! caller gets a [`StartTicket`] right away and observes completion through it, through
//! [`DeploymentController::subscribe`] or by polling [`DeploymentController::status`].
//!
//! A failing step releases everything acquired so far (workers, the working snapshot
//! copy, generated schema files) before the deployment is marked `Failed`. A cancelled
//! start performs the same rollback and returns the name to `Idle`.
//!
//! Once `Running`, a supervisor task polls worker health. A worker that exits or stops
//! answering fails the deployment and the remaining workers are torn down.
//!
//! ## Concurrency
//!
//! Deployments live in a `DashMap` keyed by name. The name is reserved with the map's
//! entry API, so two concurrent starts for one name cannot both succeed. Each
//! deployment's record sits behind its own lock; transitions are validated under that
//! lock, which serializes the start task, the supervisor and `stop` for one deployment
//! while leaving different deployments independent.

use crate::config::{ControllerConfig, DeploymentConfig, SnapshotSource, WorkerSpec};
use crate::error::{DeploymentError, DeploymentResult, FailureReport, Phase};
use crate::handle::{WorkerHandle, WorkerHealth, WorkerId};
use crate::health::{HealthMonitor, HealthReport, HealthStatus};
use crate::launcher::{LaunchContext, LaunchStrategy, WorkerLauncher};
use crate::snapshot::{SnapshotArtifact, SnapshotManager, SNAPSHOT_EXTENSION};
use crate::state::DeploymentState;
use crate::world::WorldState;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use schema_gen::{SchemaArtifact, SchemaGenerator};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type DeploymentId = Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub worker_type: String,
    pub strategy: LaunchStrategy,
    pub health: WorkerHealth,
    pub pid: Option<u32>,
    pub memory_mb: Option<u64>,
}

/// Read-only view of one deployment.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentStatus {
    pub name: String,
    pub id: Option<DeploymentId>,
    pub state: DeploymentState,
    pub workers: Vec<WorkerStatus>,
    pub health: Option<HealthStatus>,
    pub last_error: Option<FailureReport>,
    pub schema_hash: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentStatus {
    fn idle(name: &str) -> Self {
        Self {
            name: name.to_string(),
            id: None,
            state: DeploymentState::Idle,
            workers: Vec::new(),
            health: None,
            last_error: None,
            schema_hash: None,
            started_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn alive_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.health.is_alive()).count()
    }
}

struct WorkerEntry {
    handle: WorkerHandle,
    status: WorkerStatus,
}

struct DeploymentRecord {
    state: DeploymentState,
    workers: Vec<WorkerEntry>,
    health: Option<HealthStatus>,
    last_error: Option<FailureReport>,
    schema_hash: Option<String>,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

struct DeploymentSlot {
    name: String,
    id: DeploymentId,
    config: DeploymentConfig,
    record: RwLock<DeploymentRecord>,
    state_tx: watch::Sender<DeploymentState>,
    /// Cancels the start pipeline
    start_cancel: CancellationToken,
    /// Stops the health supervisor
    supervisor: CancellationToken,
    world: Arc<WorldState>,
}

impl DeploymentSlot {
    fn new(config: DeploymentConfig, start_cancel: CancellationToken, world_version: u32) -> Self {
        let now = Utc::now();
        let (state_tx, _) = watch::channel(DeploymentState::Idle);
        Self {
            name: config.name.clone(),
            id: Uuid::new_v4(),
            config,
            record: RwLock::new(DeploymentRecord {
                state: DeploymentState::Idle,
                workers: Vec::new(),
                health: None,
                last_error: None,
                schema_hash: None,
                started_at: now,
                updated_at: now,
            }),
            state_tx,
            start_cancel,
            supervisor: CancellationToken::new(),
            world: Arc::new(WorldState::new(world_version)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, DeploymentRecord> {
        self.record.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DeploymentRecord> {
        self.record.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> DeploymentState {
        self.read().state
    }

    fn handles(&self) -> Vec<WorkerHandle> {
        self.read().workers.iter().map(|w| w.handle.clone()).collect()
    }

    fn status(&self) -> DeploymentStatus {
        let record = self.read();
        DeploymentStatus {
            name: self.name.clone(),
            id: Some(self.id),
            state: record.state,
            workers: record.workers.iter().map(|w| w.status.clone()).collect(),
            health: record.health,
            last_error: record.last_error.clone(),
            schema_hash: record.schema_hash.clone(),
            started_at: Some(record.started_at),
            updated_at: record.updated_at,
        }
    }

    fn transition(&self, to: DeploymentState) -> DeploymentResult<()> {
        let from = {
            let mut record = self.write();
            let from = record.state;
            record.state = from.transition(to)?;
            record.updated_at = Utc::now();
            from
        };
        self.state_tx.send_replace(to);
        info!(deployment = %self.name, from = %from, to = %to, "Deployment state changed");
        Ok(())
    }

    /// Moves to `Failed`, keeping `report` for display. Fails if the state no longer allows it.
    fn fail(&self, report: FailureReport) -> DeploymentResult<()> {
        {
            let mut record = self.write();
            record.state = record.state.transition(DeploymentState::Failed)?;
            record.last_error = Some(report);
            record.health = Some(HealthStatus::Unhealthy);
            record.updated_at = Utc::now();
        }
        self.state_tx.send_replace(DeploymentState::Failed);
        Ok(())
    }

    fn add_workers(&self, spec: &WorkerSpec, handles: Vec<WorkerHandle>) {
        let mut record = self.write();
        for handle in handles {
            let status = WorkerStatus {
                id: handle.id().clone(),
                worker_type: spec.worker_type.clone(),
                strategy: spec.strategy,
                health: WorkerHealth::Pending,
                pid: handle.pid(),
                memory_mb: None,
            };
            record.workers.push(WorkerEntry { handle, status });
        }
        record.updated_at = Utc::now();
    }

    fn set_health(&self, worker: &WorkerId, health: WorkerHealth) {
        let mut record = self.write();
        if let Some(entry) = record.workers.iter_mut().find(|w| &w.status.id == worker) {
            entry.status.health = health;
        }
        record.updated_at = Utc::now();
    }

    fn apply_report(&self, report: &HealthReport) {
        let mut record = self.write();
        for sample in &report.samples {
            if let Some(entry) = record.workers.iter_mut().find(|w| w.status.id == sample.worker) {
                entry.status.health = sample.health;
                entry.status.memory_mb = sample.memory_mb;
            }
        }
        record.health = Some(report.status);
        record.updated_at = report.timestamp;
    }
}

/// Result channel for an in-flight start.
pub struct StartTicket {
    id: DeploymentId,
    name: String,
    state: watch::Receiver<DeploymentState>,
    cancel: CancellationToken,
    done: oneshot::Receiver<DeploymentResult<DeploymentStatus>>,
}

impl StartTicket {
    pub fn id(&self) -> DeploymentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> watch::Receiver<DeploymentState> {
        self.state.clone()
    }

    /// Aborts the start; the pipeline rolls back and the name returns to `Idle`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits until the deployment is running or the start has failed.
    pub async fn wait(self) -> DeploymentResult<DeploymentStatus> {
        self.done
            .await
            .map_err(|_| DeploymentError::Internal("start task ended without a result".to_string()))?
    }
}

/// Result channel for an in-flight stop.
pub struct StopTicket {
    name: String,
    state: watch::Receiver<DeploymentState>,
    done: oneshot::Receiver<DeploymentResult<DeploymentStatus>>,
}

impl StopTicket {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> watch::Receiver<DeploymentState> {
        self.state.clone()
    }

    pub async fn wait(self) -> DeploymentResult<DeploymentStatus> {
        self.done
            .await
            .map_err(|_| DeploymentError::Internal("stop task ended without a result".to_string()))?
    }

    /// Waits for the stop, returning early when `cancel` fires. Termination continues
    /// in the background either way.
    pub async fn wait_or_cancel(self, cancel: &CancellationToken) -> DeploymentResult<DeploymentStatus> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DeploymentError::Cancelled { phase: Phase::Stop }),
            result = self.wait() => result,
        }
    }
}

/// Drives deployments through their lifecycle.
#[derive(Clone)]
pub struct DeploymentController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: ControllerConfig,
    launcher: WorkerLauncher,
    snapshots: SnapshotManager,
    schema_generator: Option<Arc<SchemaGenerator>>,
    health: HealthMonitor,
    deployments: DashMap<String, Arc<DeploymentSlot>>,
}

impl DeploymentController {
    pub fn new(
        config: ControllerConfig,
        launcher: WorkerLauncher,
        schema_generator: Option<Arc<SchemaGenerator>>,
    ) -> Self {
        let snapshots = SnapshotManager::new(config.snapshot_dir.clone(), config.fresh_world_version);
        let health = HealthMonitor::new(config.memory_warning_mb);
        Self {
            inner: Arc::new(ControllerInner {
                config,
                launcher,
                snapshots,
                schema_generator,
                health,
                deployments: DashMap::new(),
            }),
        }
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.inner.snapshots
    }

    /// Starts a deployment. Must be called from within a Tokio runtime.
    ///
    /// Rejected with [`DeploymentError::AlreadyActive`] while another deployment with the
    /// same name is starting, running or stopping. A `Failed` deployment has to be
    /// discarded first; a `Stopped` one is replaced.
    pub fn start(&self, config: DeploymentConfig, cancel: &CancellationToken) -> DeploymentResult<StartTicket> {
        config.validate()?;
        for spec in &config.worker_specs {
            if !self.inner.launcher.supports(spec.strategy) {
                return Err(DeploymentError::Config(format!(
                    "worker type '{}' requests cloud launch but no platform client is configured",
                    spec.worker_type
                )));
            }
        }

        let name = config.name.clone();
        let total_workers = config.total_workers();
        let slot = Arc::new(DeploymentSlot::new(
            config,
            cancel.child_token(),
            self.inner.config.fresh_world_version,
        ));
        slot.transition(DeploymentState::Starting)?;

        match self.inner.deployments.entry(name.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get().state();
                if existing.is_active() {
                    warn!(deployment = %name, state = %existing, "Rejecting start of active deployment");
                    return Err(DeploymentError::AlreadyActive { name });
                }
                if existing == DeploymentState::Failed {
                    return Err(DeploymentError::InvalidTransition {
                        from: existing,
                        to: DeploymentState::Starting,
                    });
                }
                occupied.insert(slot.clone());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot.clone());
            }
        }

        info!(deployment = %name, id = %slot.id, workers = total_workers, "Deployment starting");

        let state = slot.state_tx.subscribe();
        let (done_tx, done_rx) = oneshot::channel();
        let inner = self.inner.clone();
        let task_slot = slot.clone();
        tokio::spawn(async move {
            let result = inner.run_start(task_slot).await;
            let _ = done_tx.send(result);
        });

        Ok(StartTicket {
            id: slot.id,
            name,
            state,
            cancel: slot.start_cancel.clone(),
            done: done_rx,
        })
    }

    /// Stops a running deployment. Workers are terminated concurrently.
    pub fn stop(&self, name: &str) -> DeploymentResult<StopTicket> {
        let slot = self.slot(name)?;
        slot.transition(DeploymentState::Stopping)?;
        slot.supervisor.cancel();

        let state = slot.state_tx.subscribe();
        let (done_tx, done_rx) = oneshot::channel();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = inner.run_stop(slot).await;
            let _ = done_tx.send(result);
        });

        Ok(StopTicket {
            name: name.to_string(),
            state,
            done: done_rx,
        })
    }

    /// Current state, worker health and last error. Unknown names report `Idle`.
    pub fn status(&self, name: &str) -> DeploymentStatus {
        match self.inner.deployments.get(name) {
            Some(slot) => slot.status(),
            None => DeploymentStatus::idle(name),
        }
    }

    pub fn list(&self) -> Vec<DeploymentStatus> {
        let mut statuses: Vec<DeploymentStatus> =
            self.inner.deployments.iter().map(|e| e.value().status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn subscribe(&self, name: &str) -> Option<watch::Receiver<DeploymentState>> {
        self.inner.deployments.get(name).map(|slot| slot.state_tx.subscribe())
    }

    /// Entity mirror of a deployment, fed by the runtime bridge.
    pub fn world(&self, name: &str) -> Option<Arc<WorldState>> {
        self.inner.deployments.get(name).map(|slot| slot.world.clone())
    }

    /// Removes a `Failed` or `Stopped` deployment so its name can be reused.
    pub fn discard(&self, name: &str) -> DeploymentResult<()> {
        let state = self.slot(name)?.state();
        if !state.is_terminal() {
            return Err(DeploymentError::InvalidTransition {
                from: state,
                to: DeploymentState::Idle,
            });
        }
        self.inner
            .deployments
            .remove_if(name, |_, slot| slot.state().is_terminal());
        info!(deployment = %name, "Deployment discarded");
        Ok(())
    }

    /// Point-in-time snapshot of a running deployment, written to the snapshot directory.
    pub async fn capture(&self, name: &str, cancel: &CancellationToken) -> DeploymentResult<SnapshotArtifact> {
        let slot = self.slot(name)?;
        let state = slot.state();
        if state != DeploymentState::Running {
            return Err(DeploymentError::NotRunning {
                name: name.to_string(),
                state,
            });
        }
        self.inner.snapshots.capture(&slot.world, name, cancel).await
    }

    /// Recent log lines of one worker.
    pub async fn worker_logs(&self, name: &str, worker: &WorkerId) -> DeploymentResult<Vec<String>> {
        let slot = self.slot(name)?;
        let handle = slot
            .handles()
            .into_iter()
            .find(|h| h.id() == worker)
            .ok_or_else(|| DeploymentError::NotFound(worker.to_string()))?;
        handle.fetch_logs().await
    }

    /// Cancels in-flight starts and stops every running deployment, waiting for all of them.
    pub async fn shutdown_all(&self) -> Vec<(String, DeploymentResult<DeploymentStatus>)> {
        let slots: Vec<Arc<DeploymentSlot>> =
            self.inner.deployments.iter().map(|e| e.value().clone()).collect();

        let mut starting = Vec::new();
        for slot in &slots {
            if slot.state() == DeploymentState::Starting {
                slot.start_cancel.cancel();
                starting.push(slot.state_tx.subscribe());
            }
        }
        for mut rx in starting {
            let _ = rx.wait_for(|s| *s != DeploymentState::Starting).await;
        }

        let mut results = Vec::new();
        let mut tickets = Vec::new();
        for slot in &slots {
            if slot.state() == DeploymentState::Running {
                match self.stop(&slot.name) {
                    Ok(ticket) => tickets.push(ticket),
                    Err(e) => results.push((slot.name.clone(), Err(e))),
                }
            }
        }
        let stopped = join_all(tickets.into_iter().map(|ticket| async move {
            let name = ticket.name().to_string();
            (name, ticket.wait().await)
        }))
        .await;
        results.extend(stopped);
        results
    }

    fn slot(&self, name: &str) -> DeploymentResult<Arc<DeploymentSlot>> {
        self.inner
            .deployments
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| DeploymentError::NotFound(name.to_string()))
    }
}

fn check_cancelled(cancel: &CancellationToken, phase: Phase) -> Result<(), (Phase, DeploymentError)> {
    if cancel.is_cancelled() {
        Err((phase, DeploymentError::Cancelled { phase }))
    } else {
        Ok(())
    }
}

impl ControllerInner {
    fn deployment_dir(&self, slot: &DeploymentSlot) -> PathBuf {
        self.config.work_dir.join(&slot.name).join(slot.id.to_string())
    }

    async fn run_start(self: Arc<Self>, slot: Arc<DeploymentSlot>) -> DeploymentResult<DeploymentStatus> {
        match self.start_pipeline(&slot).await {
            Ok(()) => {
                let inner = self.clone();
                let supervised = slot.clone();
                tokio::spawn(async move { inner.supervise(supervised).await });
                let status = slot.status();
                info!(deployment = %slot.name, workers = status.workers.len(), "Deployment running");
                Ok(status)
            }
            Err((phase, err)) => {
                let handles = slot.handles();
                let rolled_back = self.launcher.rollback(&handles).await;
                self.remove_working_files(&slot).await;

                if err.is_cancelled() {
                    if let Err(e) = slot.transition(DeploymentState::Idle) {
                        error!(deployment = %slot.name, error = %e, "Failed to roll back cancelled start");
                    }
                    self.deployments
                        .remove_if(&slot.name, |_, current| Arc::ptr_eq(current, &slot));
                    warn!(deployment = %slot.name, phase = %phase, "Deployment start cancelled and rolled back");
                } else {
                    let mut report = FailureReport::new(phase, &err);
                    for id in rolled_back {
                        if !report.workers.contains(&id) {
                            report.workers.push(id);
                        }
                    }
                    error!(deployment = %slot.name, phase = %phase, error = %err, "Deployment failed to start");
                    if let Err(e) = slot.fail(report) {
                        error!(deployment = %slot.name, error = %e, "Failed to record start failure");
                    }
                }
                Err(err)
            }
        }
    }

    async fn start_pipeline(&self, slot: &DeploymentSlot) -> Result<(), (Phase, DeploymentError)> {
        let cancel = &slot.start_cancel;
        let dir = self.deployment_dir(slot);

        let schema = self
            .resolve_schema(&slot.config, cancel)
            .await
            .map_err(|e| (Phase::Schema, e))?;
        let schema_dir = dir.join("schema");
        let written = {
            let schema = schema.clone();
            tokio::task::spawn_blocking(move || schema.write_to_dir(&schema_dir)).await
        };
        let schema_path = match written {
            Ok(Ok(path)) => path,
            Ok(Err(e)) => return Err((Phase::Schema, e.into())),
            Err(e) => return Err((Phase::Schema, DeploymentError::Internal(e.to_string()))),
        };
        slot.write().schema_hash = Some(schema.hash.clone());
        check_cancelled(cancel, Phase::Schema)?;

        let snapshot = self
            .resolve_snapshot(&slot.config, &schema)
            .await
            .map_err(|e| (Phase::Snapshot, e))?;
        let snapshot_path = dir.join(format!("start.{SNAPSHOT_EXTENSION}"));
        self.snapshots
            .save(&snapshot, &snapshot_path)
            .await
            .map_err(|e| (Phase::Snapshot, e))?;
        slot.world.reset(&snapshot).await;
        check_cancelled(cancel, Phase::Snapshot)?;

        let ctx = LaunchContext {
            deployment: &slot.name,
            schema: &schema,
            schema_path: &schema_path,
            snapshot_path: &snapshot_path,
        };
        for spec in &slot.config.worker_specs {
            let handles = self
                .launcher
                .launch(spec, &ctx, cancel)
                .await
                .map_err(|e| (Phase::Launch, e))?;
            slot.add_workers(spec, handles);
        }

        self.wait_until_alive(slot).await.map_err(|e| (Phase::Startup, e))?;
        slot.transition(DeploymentState::Running)
            .map_err(|e| (Phase::Startup, e))
    }

    async fn resolve_schema(
        &self,
        config: &DeploymentConfig,
        cancel: &CancellationToken,
    ) -> DeploymentResult<Arc<SchemaArtifact>> {
        if let Some(schema) = &config.schema {
            match schema.verify() {
                Ok(()) => {
                    debug!(deployment = %config.name, hash = %schema.short_hash(), "Using supplied schema");
                    return Ok(schema.clone());
                }
                Err(e) => {
                    warn!(deployment = %config.name, error = %e, "Supplied schema failed verification, regenerating");
                }
            }
        }

        let generator = self.schema_generator.clone().ok_or_else(|| {
            DeploymentError::Config("no schema supplied and no type feed configured".to_string())
        })?;
        let timeout = self.config.schema_timeout;
        let task = tokio::task::spawn_blocking(move || generator.generate());

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DeploymentError::Cancelled { phase: Phase::Schema }),
            result = tokio::time::timeout(timeout, task) => match result {
                Err(_) => Err(DeploymentError::Timeout {
                    phase: Phase::Schema,
                    timeout,
                }),
                Ok(Err(join)) => Err(DeploymentError::Internal(format!("schema generation task failed: {join}"))),
                Ok(Ok(generation)) => Ok(Arc::new(generation?.artifact)),
            },
        }
    }

    async fn resolve_snapshot(
        &self,
        config: &DeploymentConfig,
        schema: &SchemaArtifact,
    ) -> DeploymentResult<SnapshotArtifact> {
        match &config.snapshot {
            SnapshotSource::Fresh => Ok(self.snapshots.fresh()),
            SnapshotSource::Path(path) => self.snapshots.load(path, schema).await,
            SnapshotSource::Artifact(artifact) => {
                artifact.validate_against(schema)?;
                Ok(artifact.as_ref().clone())
            }
        }
    }

    /// Polls every worker until all are alive, one exits, or the startup timeout passes.
    ///
    /// Each poll is bounded by the startup deadline, so a platform that stops answering
    /// cannot hold the deployment in `Starting`.
    async fn wait_until_alive(&self, slot: &DeploymentSlot) -> DeploymentResult<()> {
        let handles = slot.handles();
        let timeout = self.config.startup_timeout;
        let deadline = Instant::now() + timeout;

        loop {
            let round = join_all(
                handles
                    .iter()
                    .map(|h| tokio::time::timeout_at(deadline, h.poll())),
            );
            let healths = tokio::select! {
                biased;
                _ = slot.start_cancel.cancelled() => {
                    return Err(DeploymentError::Cancelled { phase: Phase::Startup });
                }
                healths = round => healths,
            };

            let mut pending = Vec::new();
            for (handle, health) in handles.iter().zip(healths) {
                let Ok(health) = health else {
                    // No answer before the deadline
                    pending.push(handle.id().clone());
                    continue;
                };
                slot.set_health(handle.id(), health);
                match health {
                    WorkerHealth::Alive => {}
                    WorkerHealth::Pending => pending.push(handle.id().clone()),
                    WorkerHealth::Exited(code) => {
                        return Err(DeploymentError::WorkerExited {
                            worker: handle.id().clone(),
                            code,
                        })
                    }
                    WorkerHealth::Unreachable => {
                        return Err(DeploymentError::Unreachable {
                            worker: handle.id().clone(),
                        })
                    }
                }
            }
            if slot.start_cancel.is_cancelled() {
                return Err(DeploymentError::Cancelled { phase: Phase::Startup });
            }
            if pending.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DeploymentError::StartupTimeout { timeout, pending });
            }
            debug!(deployment = %slot.name, pending = pending.len(), "Waiting for workers");
            tokio::select! {
                biased;
                _ = slot.start_cancel.cancelled() => {
                    return Err(DeploymentError::Cancelled { phase: Phase::Startup });
                }
                _ = tokio::time::sleep_until((Instant::now() + self.config.poll_interval).min(deadline)) => {}
            }
        }
    }

    async fn supervise(self: Arc<Self>, slot: Arc<DeploymentSlot>) {
        let mut ticker = tokio::time::interval(self.config.health_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = slot.supervisor.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let handles = slot.handles();
            let report = self.health.check(&handles).await;
            if slot.supervisor.is_cancelled() {
                break;
            }
            slot.apply_report(&report);

            if let Some(lost) = report.first_lost() {
                let err = match lost.health {
                    WorkerHealth::Exited(code) => DeploymentError::WorkerExited {
                        worker: lost.worker.clone(),
                        code,
                    },
                    _ => DeploymentError::Unreachable {
                        worker: lost.worker.clone(),
                    },
                };
                if slot.fail(FailureReport::new(Phase::Running, &err)).is_ok() {
                    error!(deployment = %slot.name, error = %err, "Worker lost, failing deployment");
                    // Exited workers are gone; unreachable ones may still be running remotely.
                    let remaining: Vec<WorkerHandle> = handles
                        .into_iter()
                        .filter(|h| {
                            !report
                                .samples
                                .iter()
                                .any(|s| &s.worker == h.id() && matches!(s.health, WorkerHealth::Exited(_)))
                        })
                        .collect();
                    self.launcher.rollback(&remaining).await;
                    self.remove_working_files(&slot).await;
                }
                break;
            }
            if report.status == HealthStatus::Degraded {
                warn!(deployment = %slot.name, warnings = ?report.warnings, "Deployment degraded");
            }
        }
        debug!(deployment = %slot.name, "Supervisor finished");
    }

    async fn run_stop(&self, slot: Arc<DeploymentSlot>) -> DeploymentResult<DeploymentStatus> {
        let handles = slot.handles();
        info!(deployment = %slot.name, workers = handles.len(), "Stopping workers");

        for (id, result) in self.launcher.stop_all(&handles).await {
            match result {
                Ok(code) => slot.set_health(&id, WorkerHealth::Exited(code)),
                Err(e) => {
                    warn!(deployment = %slot.name, worker_id = %id, error = %e, "Failed to stop worker cleanly");
                    slot.set_health(&id, WorkerHealth::Unreachable);
                }
            }
        }
        self.remove_working_files(&slot).await;
        slot.transition(DeploymentState::Stopped)?;
        info!(deployment = %slot.name, "Deployment stopped");
        Ok(slot.status())
    }

    async fn remove_working_files(&self, slot: &DeploymentSlot) {
        let dir = self.deployment_dir(slot);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(path = %dir.display(), "Removed deployment working files"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %dir.display(), error = %e, "Failed to remove deployment working files"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::LocalLaunchConfig;
    use schema_gen::{generate, IdRegistry, ReflectedType, StaticTypeFeed, WireType};
    use std::time::Duration;
    use tempfile::TempDir;

    fn types() -> Vec<ReflectedType> {
        vec![ReflectedType::new("/Script/Game.Door").with_field("Open", WireType::Bool)]
    }

    fn controller(dir: &TempDir, generator: Option<Arc<SchemaGenerator>>) -> DeploymentController {
        let config = ControllerConfig {
            work_dir: dir.path().join("work"),
            snapshot_dir: dir.path().join("snapshots"),
            ..ControllerConfig::default()
        };
        let local = LocalLaunchConfig {
            log_dir: dir.path().join("logs"),
            ..LocalLaunchConfig::default()
        };
        DeploymentController::new(config, WorkerLauncher::new(local, Duration::from_secs(1)), generator)
    }

    #[tokio::test]
    async fn test_unknown_deployment_is_idle() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(&dir, None);
        assert_eq!(controller.status("nope").state, DeploymentState::Idle);
        assert!(matches!(controller.stop("nope"), Err(DeploymentError::NotFound(_))));
        assert!(controller.subscribe("nope").is_none());
    }

    #[tokio::test]
    async fn test_start_without_workers_runs_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(&dir, None);
        let schema = Arc::new(generate(&types(), &IdRegistry::default()).unwrap().artifact);

        let ticket = controller
            .start(DeploymentConfig::new("empty").with_schema(schema.clone()), &CancellationToken::new())
            .unwrap();
        let status = ticket.wait().await.unwrap();
        assert_eq!(status.state, DeploymentState::Running);
        assert_eq!(status.schema_hash.as_deref(), Some(schema.hash.as_str()));

        let stopped = controller.stop("empty").unwrap().wait().await.unwrap();
        assert_eq!(stopped.state, DeploymentState::Stopped);
        assert!(!dir.path().join("work").join("empty").join(status.id.unwrap().to_string()).exists());

        // A stopped deployment can be replaced by a new start.
        let again = controller
            .start(DeploymentConfig::new("empty").with_schema(schema), &CancellationToken::new())
            .unwrap();
        assert_ne!(again.id(), status.id.unwrap());
        again.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_schema_generated_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Arc::new(SchemaGenerator::new(
            Arc::new(StaticTypeFeed::new(types())),
            dir.path().join("ids.json"),
            dir.path().join("schema_out"),
        ));
        let controller = controller(&dir, Some(generator));

        let status = controller
            .start(DeploymentConfig::new("gen"), &CancellationToken::new())
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(status.state, DeploymentState::Running);
        assert!(status.schema_hash.is_some());
        assert!(dir.path().join("ids.json").exists());
    }

    #[tokio::test]
    async fn test_missing_schema_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(&dir, None);

        let err = controller
            .start(DeploymentConfig::new("broken"), &CancellationToken::new())
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, DeploymentError::Config(_)));

        let status = controller.status("broken");
        assert_eq!(status.state, DeploymentState::Failed);
        assert_eq!(status.last_error.unwrap().phase, Phase::Schema);

        // Failed deployments must be discarded before the name is reused.
        assert!(controller.start(DeploymentConfig::new("broken"), &CancellationToken::new()).is_err());
        controller.discard("broken").unwrap();
        assert_eq!(controller.status("broken").state, DeploymentState::Idle);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(&dir, None);
        let schema = Arc::new(generate(&types(), &IdRegistry::default()).unwrap().artifact);
        let snapshot = SnapshotArtifact::new(
            1,
            vec![crate::snapshot::SnapshotEntity {
                entity_id: 1,
                type_id: 42,
                fields: Vec::new(),
            }],
        );

        let config = DeploymentConfig::new("snap")
            .with_schema(schema)
            .with_snapshot(SnapshotSource::Artifact(Arc::new(snapshot)));
        let err = controller
            .start(config, &CancellationToken::new())
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, DeploymentError::CorruptSnapshot { .. }));
        assert_eq!(controller.status("snap").last_error.unwrap().phase, Phase::Snapshot);
    }

    #[tokio::test]
    async fn test_cancelled_start_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(&dir, None);
        let schema = Arc::new(generate(&types(), &IdRegistry::default()).unwrap().artifact);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = controller
            .start(DeploymentConfig::new("cancelled").with_schema(schema), &cancel)
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(controller.status("cancelled").state, DeploymentState::Idle);
        assert!(controller.list().is_empty());
    }

    #[tokio::test]
    async fn test_capture_requires_running() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(&dir, None);
        let schema = Arc::new(generate(&types(), &IdRegistry::default()).unwrap().artifact);
        controller
            .start(DeploymentConfig::new("cap").with_schema(schema), &CancellationToken::new())
            .unwrap()
            .wait()
            .await
            .unwrap();

        let world = controller.world("cap").unwrap();
        world.upsert(1, 1, vec![1, 2, 3]).await;
        let captured = controller.capture("cap", &CancellationToken::new()).await.unwrap();
        assert_eq!(captured.entity_count(), 1);
        assert!(captured.path.unwrap().starts_with(dir.path().join("snapshots")));

        controller.stop("cap").unwrap().wait().await.unwrap();
        assert!(matches!(
            controller.capture("cap", &CancellationToken::new()).await,
            Err(DeploymentError::NotRunning { .. })
        ));
    }
}

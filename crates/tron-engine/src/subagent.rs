//! Durable registry of spawned background runs.
//!
//! All runs live in one shared registry file. Every mutation is a
//! read-modify-write under the registry lock; reads for display go straight
//! to the file.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use tron_core::process::{Liveness, ProcessIdentity};
use tron_core::{RunId, SessionKey};
use tron_store::{atomic, LockHandle, LockManager, Record, StoreError, StoreLayout, REGISTRY_RESOURCE};

use crate::error::TurnError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// The worker died while running; the run may be resumed.
    Orphaned,
}

impl RunStatus {
    /// Pending and running runs count against the fan-out cap.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Failed)
                | (Running, Completed | Failed | Orphaned)
                | (Orphaned, Running | Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Orphaned => "orphaned",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "orphaned" => Ok(Self::Orphaned),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubagentRecord {
    pub run_id: RunId,
    pub parent_session_key: SessionKey,
    pub objective: String,
    pub status: RunStatus,
    pub depth: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_host: Option<String>,
}

impl SubagentRecord {
    pub fn worker(&self) -> Option<ProcessIdentity> {
        match (self.worker_pid, &self.worker_host) {
            (Some(pid), Some(host)) => Some(ProcessIdentity::new(pid, host.clone())),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryFile {
    pub runs: Vec<SubagentRecord>,
}

impl Record for RegistryFile {
    const SCHEMA: &'static str = "tron.subagents";
    const VERSION: u32 = 1;
}

impl RegistryFile {
    fn find_mut(&mut self, run_id: &RunId) -> Option<&mut SubagentRecord> {
        self.runs.iter_mut().find(|r| &r.run_id == run_id)
    }

    fn live_children(&self, parent: &SessionKey) -> usize {
        self.runs
            .iter()
            .filter(|r| &r.parent_session_key == parent && r.status.is_live())
            .count()
    }
}

#[derive(Clone, Debug)]
pub struct SpawnLimits {
    pub max_depth: u32,
    pub max_children: usize,
}

impl Default for SpawnLimits {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_children: 5,
        }
    }
}

/// Last observation of a waited-on run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaitOutcome {
    pub record: SubagentRecord,
    /// The run is no longer pending or running.
    pub settled: bool,
}

#[derive(Clone, Debug)]
pub struct SubagentRegistry {
    layout: StoreLayout,
    locks: LockManager,
    limits: SpawnLimits,
    identity: ProcessIdentity,
    poll_interval: Duration,
    /// Age after which a run held by an unverifiable worker is orphaned.
    stale_after: Duration,
}

impl SubagentRegistry {
    pub fn new(layout: StoreLayout, locks: LockManager, limits: SpawnLimits) -> Self {
        Self {
            layout,
            locks,
            limits,
            identity: ProcessIdentity::current(),
            poll_interval: Duration::from_millis(500),
            stale_after: Duration::from_secs(300),
        }
    }

    /// Identity recorded as the worker when a run is marked running.
    pub fn with_identity(mut self, identity: ProcessIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn limits(&self) -> &SpawnLimits {
        &self.limits
    }

    /// Register a new pending run.
    ///
    /// Rejected synchronously when `depth` exceeds the maximum or the parent
    /// already has the maximum number of live children.
    #[instrument(skip(self, objective), fields(parent = %parent))]
    pub async fn spawn(&self, parent: &SessionKey, objective: &str, depth: u32) -> Result<RunId, TurnError> {
        if depth > self.limits.max_depth {
            return Err(TurnError::SpawnLimitExceeded(format!(
                "depth {depth} exceeds the maximum of {}",
                self.limits.max_depth
            )));
        }
        let limits = self.limits.clone();
        let parent = parent.clone();
        let objective = objective.to_string();
        self.modify(move |file| {
            let live = file.live_children(&parent);
            if live >= limits.max_children {
                return Err(TurnError::SpawnLimitExceeded(format!(
                    "{parent} already has {live} active background tasks (limit {})",
                    limits.max_children
                )));
            }
            let now = Utc::now();
            let run_id = RunId::new();
            file.runs.push(SubagentRecord {
                run_id: run_id.clone(),
                parent_session_key: parent,
                objective,
                status: RunStatus::Pending,
                depth,
                created_at: now,
                updated_at: now,
                finished_at: None,
                result: None,
                worker_pid: None,
                worker_host: None,
            });
            info!(run_id = %run_id, depth, "subagent spawned");
            Ok(run_id)
        })
        .await
    }

    /// Transition a run. Moving to `running` records this process as the
    /// worker; terminal states stamp `finished_at`.
    pub async fn update_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        result: Option<String>,
    ) -> Result<SubagentRecord, TurnError> {
        let worker = self.identity.clone();
        self.update_status_as(run_id, status, result, &worker).await
    }

    /// Like [`update_status`](Self::update_status), but a move to `running`
    /// records `worker` instead of this process. Used when the transition is
    /// reported on behalf of a worker, e.g. from the CLI.
    #[instrument(skip(self, result), fields(run_id = %run_id, status = %status, worker = %worker))]
    pub async fn update_status_as(
        &self,
        run_id: &RunId,
        status: RunStatus,
        result: Option<String>,
        worker: &ProcessIdentity,
    ) -> Result<SubagentRecord, TurnError> {
        let identity = worker.clone();
        let run_id = run_id.clone();
        self.modify(move |file| {
            let record = file
                .find_mut(&run_id)
                .ok_or_else(|| TurnError::RunNotFound(run_id.clone()))?;
            if !record.status.can_transition_to(status) {
                return Err(StoreError::InvalidTransition {
                    id: run_id.to_string(),
                    from: record.status.to_string(),
                    to: status.to_string(),
                }
                .into());
            }
            let now = Utc::now();
            record.status = status;
            record.updated_at = now;
            if status == RunStatus::Running {
                record.worker_pid = Some(identity.pid);
                record.worker_host = Some(identity.host.clone());
            }
            if status.is_terminal() {
                record.finished_at = Some(now);
            }
            if result.is_some() {
                record.result = result;
            }
            Ok(record.clone())
        })
        .await
    }

    /// Current state of a run. Non-authoritative read.
    pub fn get(&self, run_id: &RunId) -> Result<Option<SubagentRecord>, TurnError> {
        Ok(self.load()?.runs.into_iter().find(|r| &r.run_id == run_id))
    }

    /// All runs, or only those of `parent`, oldest first.
    pub fn list(&self, parent: Option<&SessionKey>) -> Result<Vec<SubagentRecord>, TurnError> {
        let mut runs = self.load()?.runs;
        if let Some(parent) = parent {
            runs.retain(|r| &r.parent_session_key == parent);
        }
        Ok(runs)
    }

    /// Mark every running run whose worker is gone as orphaned.
    ///
    /// Workers on other hosts cannot be checked; their runs are orphaned once
    /// they have not been updated for the staleness threshold.
    #[instrument(skip(self))]
    pub async fn reconcile_on_startup(&self) -> Result<Vec<RunId>, TurnError> {
        let stale_after = self.stale_after;
        self.modify(move |file| {
            let now = Utc::now();
            let mut orphaned = Vec::new();
            for record in file.runs.iter_mut().filter(|r| r.status == RunStatus::Running) {
                let abandoned = match record.worker().map(|w| w.liveness()) {
                    Some(Liveness::Alive) => false,
                    Some(Liveness::Dead) | None => true,
                    Some(Liveness::Unknown) => {
                        (now - record.updated_at).to_std().unwrap_or_default() >= stale_after
                    }
                };
                if abandoned {
                    warn!(run_id = %record.run_id, worker = ?record.worker(), "subagent worker gone, run orphaned");
                    record.status = RunStatus::Orphaned;
                    record.updated_at = now;
                    orphaned.push(record.run_id.clone());
                }
            }
            Ok(orphaned)
        })
        .await
    }

    /// Poll until the run settles or `timeout` elapses. Returns the last
    /// observed record either way.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn wait(&self, run_id: &RunId, timeout: Duration) -> Result<WaitOutcome, TurnError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let record = self
                .get(run_id)?
                .ok_or_else(|| TurnError::RunNotFound(run_id.clone()))?;
            let settled = !record.status.is_live();
            let now = tokio::time::Instant::now();
            if settled || now >= deadline {
                debug!(status = %record.status, settled, "wait finished");
                return Ok(WaitOutcome { record, settled });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Drop completed and failed runs that finished more than `older_than` ago.
    #[instrument(skip(self))]
    pub async fn prune_terminal(&self, older_than: Duration) -> Result<usize, TurnError> {
        self.modify(move |file| {
            let now = Utc::now();
            let before = file.runs.len();
            file.runs.retain(|r| {
                let expired = r
                    .finished_at
                    .map(|at| (now - at).to_std().unwrap_or_default() >= older_than)
                    .unwrap_or(false);
                !(r.status.is_terminal() && expired)
            });
            let pruned = before - file.runs.len();
            if pruned > 0 {
                info!(pruned, "terminal subagent runs pruned");
            }
            Ok(pruned)
        })
        .await
    }

    fn load(&self) -> Result<RegistryFile, StoreError> {
        Ok(atomic::read_record(&self.layout.registry_file())?.unwrap_or_default())
    }

    async fn modify<T, F>(&self, f: F) -> Result<T, TurnError>
    where
        F: FnOnce(&mut RegistryFile) -> Result<T, TurnError>,
    {
        let handle = self
            .locks
            .acquire(REGISTRY_RESOURCE, self.locks.config().timeout)
            .await?;
        let result = self.modify_locked(&handle, f);
        match handle.release() {
            Ok(()) => result,
            Err(lost) => match result {
                Ok(_) => Err(lost.into()),
                Err(e) => {
                    warn!(error = %lost, "registry lock lost during a failed section");
                    Err(e)
                }
            },
        }
    }

    fn modify_locked<T, F>(&self, handle: &LockHandle, f: F) -> Result<T, TurnError>
    where
        F: FnOnce(&mut RegistryFile) -> Result<T, TurnError>,
    {
        let mut file = self.load()?;
        let before = file.clone();
        let out = f(&mut file)?;
        if file != before {
            handle.verify()?;
            atomic::write_record(&self.layout.registry_file(), &file)?;
        }
        Ok(out)
    }
}

//! Background sync runs with observable status.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::pipeline::{SyncPipeline, SyncRunSummary};

/// Finished statuses kept around for `/jobs/{id}` lookups.
pub const MAX_RETAINED_JOBS: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded { summary: SyncRunSummary },
    Failed { message: String },
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Succeeded { .. } | JobStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnqueueOutcome {
    pub job_id: Uuid,
    /// True when the request joined a run that was already in flight.
    pub coalesced: bool,
}

#[derive(Default)]
struct RunnerState {
    active: Option<Uuid>,
    jobs: HashMap<Uuid, watch::Sender<JobStatus>>,
    order: VecDeque<Uuid>,
}

impl RunnerState {
    fn evict_finished(&mut self, cap: usize) {
        while self.order.len() > cap {
            let Some(pos) = self
                .order
                .iter()
                .position(|id| self.jobs.get(id).is_some_and(|tx| tx.borrow().is_finished()))
            else {
                break;
            };
            if let Some(id) = self.order.remove(pos) {
                self.jobs.remove(&id);
            }
        }
    }
}

/// Runs the sync pipeline off the request path, one run at a time.
///
/// A request that arrives while a run is in flight joins that run instead of
/// starting another. This only serializes runs inside this process.
pub struct JobRunner {
    pipeline: Arc<SyncPipeline>,
    state: Arc<Mutex<RunnerState>>,
    retain: usize,
}

impl JobRunner {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self {
            pipeline,
            state: Arc::new(Mutex::new(RunnerState::default())),
            retain: MAX_RETAINED_JOBS,
        }
    }

    pub fn with_retention(mut self, retain: usize) -> Self {
        self.retain = retain.max(1);
        self
    }

    pub async fn enqueue(&self) -> EnqueueOutcome {
        let mut state = self.state.lock().await;
        if let Some(job_id) = state.active {
            info!(%job_id, "sync already running; joining it");
            return EnqueueOutcome {
                job_id,
                coalesced: true,
            };
        }

        let job_id = Uuid::new_v4();
        let (tx, _rx) = watch::channel(JobStatus::Queued);
        state.jobs.insert(job_id, tx);
        state.order.push_back(job_id);
        state.active = Some(job_id);
        state.evict_finished(self.retain);
        drop(state);

        let pipeline = Arc::clone(&self.pipeline);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            publish(&state, job_id, JobStatus::Running).await;

            // Run in its own task so a panic surfaces as a failed job.
            let status = match tokio::spawn(async move { pipeline.run_once().await }).await {
                Ok(Ok(summary)) => JobStatus::Succeeded { summary },
                Ok(Err(err)) => {
                    warn!(%job_id, error = %format!("{err:#}"), "sync job failed");
                    JobStatus::Failed {
                        message: format!("{err:#}"),
                    }
                }
                Err(err) => {
                    warn!(%job_id, error = %err, "sync job aborted");
                    JobStatus::Failed {
                        message: format!("sync task aborted: {err}"),
                    }
                }
            };

            // Publish and release under one lock so a waiter that sees the
            // final status can enqueue a fresh run.
            let mut guard = state.lock().await;
            if let Some(tx) = guard.jobs.get(&job_id) {
                tx.send_replace(status);
            }
            if guard.active == Some(job_id) {
                guard.active = None;
            }
        });

        info!(%job_id, "sync job queued");
        EnqueueOutcome {
            job_id,
            coalesced: false,
        }
    }

    pub async fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        let state = self.state.lock().await;
        state.jobs.get(&job_id).map(|tx| tx.borrow().clone())
    }

    pub async fn active(&self) -> Option<Uuid> {
        self.state.lock().await.active
    }

    /// Resolves once the job has finished. `None` for unknown or evicted ids.
    pub async fn wait(&self, job_id: Uuid) -> Option<JobStatus> {
        let mut rx = {
            let state = self.state.lock().await;
            state.jobs.get(&job_id)?.subscribe()
        };
        let status = rx.wait_for(JobStatus::is_finished).await.ok()?;
        Some(status.clone())
    }
}

async fn publish(state: &Mutex<RunnerState>, job_id: Uuid, status: JobStatus) {
    if let Some(tx) = state.lock().await.jobs.get(&job_id) {
        tx.send_replace(status);
    }
}

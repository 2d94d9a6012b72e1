// Work queue and worker pool for chained pipeline jobs.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::{ResourceId, SyncPhase, TeamId};

/// A unit of follow-up work. Phase transitions travel as `RunPhase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    RunPhase {
        resource_id: ResourceId,
        phase: SyncPhase,
    },
    Enrich {
        team_id: TeamId,
    },
    Aggregate {
        team_id: TeamId,
    },
}

/// Executes jobs pulled off the queue.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    /// Handle one job. Follow-up jobs are pushed onto the queue, not returned.
    async fn handle(&self, job: Job);
}

/// Producer side of the queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

/// Consumer side, shared by the pool's workers.
#[derive(Debug)]
pub struct JobReceiver {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
}

impl WorkQueue {
    pub fn new() -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                pending: Arc::new(AtomicUsize::new(0)),
                idle: Arc::new(Notify::new()),
            },
            JobReceiver {
                rx: Arc::new(Mutex::new(rx)),
            },
        )
    }

    /// Enqueue a job. Returns false if the receiver is gone.
    pub fn push(&self, job: Job) -> bool {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(job).is_err() {
            self.done();
            warn!(?job, "Work queue closed, job dropped");
            return false;
        }
        debug!(?job, "Job enqueued");
        true
    }

    /// Jobs enqueued but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait until every enqueued job, including follow-ups, has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Fixed set of workers draining one queue.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks (at least one) feeding jobs to `handler`.
    pub fn spawn(
        workers: usize,
        receiver: &JobReceiver,
        queue: &WorkQueue,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&receiver.rx);
                let queue = queue.clone();
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else {
                            debug!(worker, "Queue closed, worker exiting");
                            break;
                        };
                        debug!(worker, ?job, "Worker picked up job");
                        handler.handle(job).await;
                        queue.done();
                    }
                })
            })
            .collect();
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop all workers. In-flight jobs are abandoned at their next await point.
    pub async fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

//! Queue worker
//!
//! Owns the [`JobQueue`] on a tokio task and runs one job at a time. Callers
//! talk to it through a [`QueueHandle`]; every command carries a oneshot
//! reply.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::engine::{JobExecutor, JobOutcome, StopHandle};
use crate::error::{Error, Result};
use crate::queue::JobQueue;
use crate::system::outputs::{archive_instruction, rename_new_outputs, rename_specific_outputs, OutputSnapshot};
use crate::types::job::{JobId, QueueJob};

/// How often a job waiting for the API server is retried.
const NOT_READY_RETRY: Duration = Duration::from_secs(1);

/// Exit code recorded when a job task panics.
const JOB_PANICKED_CODE: i32 = -2;

/// Active and pending jobs at one moment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSnapshot {
    pub active: Option<QueueJob>,
    pub pending: Vec<QueueJob>,
}

impl QueueSnapshot {
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }
}

enum Command {
    Enqueue(QueueJob, oneshot::Sender<JobId>),
    Remove(JobId, oneshot::Sender<Result<bool>>),
    Clear(oneshot::Sender<usize>),
    Cancel(oneshot::Sender<Option<JobId>>),
    Snapshot(oneshot::Sender<QueueSnapshot>),
    WaitIdle(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle for talking to a running [`QueueWorker`]
#[derive(Debug, Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<Command>,
}

impl QueueHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| Error::Queue("queue worker has shut down".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Queue("queue worker dropped reply channel".into()))
    }

    /// Append a job; returns its id.
    pub async fn enqueue(&self, job: QueueJob) -> Result<JobId> {
        self.request(|reply| Command::Enqueue(job, reply)).await
    }

    /// Remove a pending job. Fails for the running job.
    pub async fn remove(&self, job_id: JobId) -> Result<bool> {
        self.request(|reply| Command::Remove(job_id, reply)).await?
    }

    /// Drop all pending jobs; returns how many were removed.
    pub async fn clear(&self) -> Result<usize> {
        self.request(Command::Clear).await
    }

    /// Stop the running job, if any; returns its id.
    pub async fn cancel(&self) -> Result<Option<JobId>> {
        self.request(Command::Cancel).await
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        self.request(Command::Snapshot).await
    }

    /// Resolves once nothing is running and nothing is pending.
    pub async fn wait_idle(&self) -> Result<()> {
        self.request(Command::WaitIdle).await
    }

    /// Cancel the running job, stop the API server and end the worker.
    /// Pending jobs stay in the queue file.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}

/// The job currently executing
struct RunningJob {
    job: QueueJob,
    stop: StopHandle,
    snapshot: Option<OutputSnapshot>,
    task: JoinHandle<JobOutcome>,
}

/// Background task that owns the queue
pub struct QueueWorker {
    queue: JobQueue,
    executor: Arc<dyn JobExecutor>,
    running: Option<RunningJob>,
    idle_waiters: Vec<oneshot::Sender<()>>,
    /// Head of the queue is an API job waiting for the server
    waiting_for_server: bool,
}

impl QueueWorker {
    /// Start the worker on the current runtime.
    pub fn spawn(queue: JobQueue, executor: Arc<dyn JobExecutor>) -> (QueueHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let worker = Self {
            queue,
            executor,
            running: None,
            idle_waiters: Vec::new(),
            waiting_for_server: false,
        };
        let task = tokio::spawn(worker.run(rx));
        (QueueHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        loop {
            self.pump().await;
            self.notify_if_idle();

            tokio::select! {
                command = rx.recv() => {
                    match command {
                        Some(Command::Shutdown(reply)) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle(command),
                        None => {
                            self.shutdown().await;
                            break;
                        }
                    }
                }
                outcome = wait_running(&mut self.running) => {
                    self.complete(outcome);
                }
                _ = tokio::time::sleep(NOT_READY_RETRY), if self.waiting_for_server => {}
            }
        }
        tracing::info!("Queue worker stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue(job, reply) => {
                let id = self.queue.enqueue(job);
                let _ = reply.send(id);
            }
            Command::Remove(job_id, reply) => {
                let _ = reply.send(self.queue.remove(job_id));
            }
            Command::Clear(reply) => {
                let _ = reply.send(self.queue.clear());
            }
            Command::Cancel(reply) => {
                let cancelled = self.running.as_ref().map(|running| {
                    tracing::info!("Cancelling job #{}", running.job.job_id);
                    running.stop.stop();
                    running.job.job_id
                });
                let _ = reply.send(cancelled);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(QueueSnapshot {
                    active: self.queue.active().cloned(),
                    pending: self.queue.pending().cloned().collect(),
                });
            }
            Command::WaitIdle(reply) => self.idle_waiters.push(reply),
            Command::Shutdown(_) => {}
        }
    }

    /// Start the next job if nothing is running and the executor accepts it.
    async fn pump(&mut self) {
        self.waiting_for_server = false;
        if self.running.is_some() {
            return;
        }
        let Some(next) = self.queue.peek_next() else {
            return;
        };
        if !self.executor.ready(next).await {
            tracing::debug!("Job #{} waits for the API server", next.job_id);
            self.waiting_for_server = true;
            return;
        }
        let Some(job) = self.queue.start_next() else {
            return;
        };

        let snapshot = (!job.use_api).then(|| OutputSnapshot::take(&job.out_dir));
        let stop = StopHandle::new();
        let executor = Arc::clone(&self.executor);
        let task = {
            let job = job.clone();
            let stop = stop.clone();
            tokio::spawn(async move { executor.run(&job, stop).await })
        };
        self.running = Some(RunningJob {
            job,
            stop,
            snapshot,
            task,
        });
    }

    /// Post-process a finished job and release the active slot.
    fn complete(&mut self, outcome: JobOutcome) {
        let Some(running) = self.running.take() else {
            return;
        };
        let job = &running.job;

        if job.use_api {
            // Saved files are kept and named even when a later output failed.
            rename_specific_outputs(&job.out_dir, &outcome.outputs, &job.subgenre_for_naming, job.seed);
        } else if outcome.succeeded() {
            if let Some(snapshot) = &running.snapshot {
                rename_new_outputs(&job.out_dir, snapshot, &job.subgenre_for_naming, job.seed);
            }
        }

        if let Some(project_root) = job.instruction_root() {
            if let Err(e) = archive_instruction(project_root, &job.out_dir, job.cfg_path.as_deref(), outcome.code) {
                tracing::warn!(job = job.job_id, "Could not archive instruction.txt: {}", e);
            }
        }

        self.queue.finish(job.job_id, outcome.code);
    }

    fn notify_if_idle(&mut self) {
        if self.running.is_none() && self.queue.is_empty() {
            for waiter in self.idle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(running) = self.running.as_ref() {
            tracing::info!("Stopping job #{} for shutdown", running.job.job_id);
            running.stop.stop();
            let outcome = wait_running(&mut self.running).await;
            self.complete(outcome);
        }
        self.executor.shutdown().await;
        self.notify_if_idle();
    }
}

/// Wait for the running job, or forever when there is none.
async fn wait_running(running: &mut Option<RunningJob>) -> JobOutcome {
    match running.as_mut() {
        Some(running) => match (&mut running.task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(job = running.job.job_id, "Job task failed: {}", e);
                JobOutcome::code(JOB_PANICKED_CODE)
            }
        },
        None => std::future::pending().await,
    }
}

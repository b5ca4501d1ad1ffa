//! Job executor
//!
//! Dispatches queued jobs to the CLI runner or, for keep-in-VRAM jobs, to
//! the API runner backed by one long-lived API server.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::engine::api_runner::ApiRunner;
use crate::engine::api_server::ApiServer;
use crate::engine::runner::{CliRunner, SPAWN_FAILED_CODE};
use crate::engine::{JobExecutor, JobOutcome, StopHandle};
use crate::storage::settings::Settings;
use crate::types::job::QueueJob;

/// How long `run` waits for a server that was started but is still loading.
const READY_WAIT: Duration = Duration::from_secs(20);
/// Short check used when the queue asks whether an API job can start.
const READY_PEEK: Duration = Duration::from_millis(300);

/// Exit code for an API job whose server never came up.
pub const SERVER_UNAVAILABLE_CODE: i32 = 9;

/// Runs CLI jobs directly and API jobs through a shared server
#[derive(Debug)]
pub struct AceExecutor {
    server: Mutex<ApiServer>,
    /// Set when the server failed to start, so API jobs fail instead of waiting
    start_failed: AtomicBool,
}

impl AceExecutor {
    pub fn new(settings: &Settings) -> Self {
        Self::with_server(ApiServer::new(
            settings.env_python.clone(),
            settings.project_root.clone(),
            settings.api_host.clone(),
            settings.api_port,
        ))
    }

    pub fn with_server(server: ApiServer) -> Self {
        Self {
            server: Mutex::new(server),
            start_failed: AtomicBool::new(false),
        }
    }

    async fn run_cli(&self, job: &QueueJob, stop: &StopHandle) -> JobOutcome {
        let Some(cwd) = job.cli_cwd.clone() else {
            tracing::error!(job = job.job_id, "CLI job has no working directory");
            return JobOutcome::code(SPAWN_FAILED_CODE);
        };
        let runner = CliRunner::new(job.job_id, job.cli_args.clone(), cwd);
        JobOutcome::code(runner.run(stop).await)
    }

    async fn run_api(&self, job: &QueueJob, stop: &StopHandle) -> JobOutcome {
        let Some(payload) = job.api_payload.clone() else {
            tracing::error!(job = job.job_id, "API job has no payload");
            return JobOutcome::code(SERVER_UNAVAILABLE_CODE);
        };

        let base_url = {
            let mut server = self.server.lock().await;
            if let Err(e) = server.start() {
                tracing::error!(job = job.job_id, "{}", e);
                return JobOutcome::code(SERVER_UNAVAILABLE_CODE);
            }
            if !server.wait_until_ready(READY_WAIT).await {
                tracing::error!(job = job.job_id, "API server is not ready");
                return JobOutcome::code(SERVER_UNAVAILABLE_CODE);
            }
            if job.api_base_url.is_empty() {
                server.base_url()
            } else {
                job.api_base_url.clone()
            }
        };

        let out_dir: PathBuf = job.out_dir.clone();
        ApiRunner::new(job.job_id, &base_url, payload, out_dir)
            .run(stop)
            .await
    }
}

#[async_trait]
impl JobExecutor for AceExecutor {
    async fn ready(&self, job: &QueueJob) -> bool {
        if !job.use_api {
            return true;
        }
        if self.start_failed.load(Ordering::SeqCst) {
            // Let the job run and fail with a clear code.
            return true;
        }

        let mut server = self.server.lock().await;
        if !server.is_running() {
            if let Err(e) = server.start() {
                tracing::error!("{}", e);
                self.start_failed.store(true, Ordering::SeqCst);
                return true;
            }
        }
        server.is_ready() || server.wait_until_ready(READY_PEEK).await
    }

    async fn run(&self, job: &QueueJob, stop: StopHandle) -> JobOutcome {
        if job.use_api {
            self.run_api(job, &stop).await
        } else {
            self.run_cli(job, &stop).await
        }
    }

    async fn shutdown(&self) {
        self.server.lock().await.stop().await;
    }
}

//! Generation queue
//!
//! A persisted FIFO of resolved jobs with at most one active job. Every
//! change is written to the queue file so pending work survives restarts.

pub mod worker;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::engine::ace_config::{build_config, write_config};
use crate::engine::payload::TaskPayload;
use crate::error::{Error, Result};
use crate::storage::queue_store::{epoch_now, load_queue, save_queue};
use crate::types::job::{JobId, QueueJob};
use crate::types::request::GenerationRequest;

pub use worker::{QueueHandle, QueueSnapshot, QueueWorker};

/// Resolve `request` into a job. The id is assigned on enqueue.
///
/// The TOML config is written now for both workflows, so the command line
/// is fixed and the config name dates the run. API jobs also carry the
/// `/release_task` payload.
pub fn build_job(request: &GenerationRequest) -> Result<QueueJob> {
    let s = request.settings();
    let out_dir = s.output_dir.clone();
    let use_api = s.keep_in_vram;
    let cfg = write_config(&out_dir, &build_config(request, &out_dir))?;

    let (cli_args, cli_cwd, api_payload, api_base_url) = if use_api {
        let payload = TaskPayload::from_request(request).to_value()?;
        (Vec::new(), None, Some(payload), s.api_base_url())
    } else {
        let args = vec![
            s.env_python.to_string_lossy().into_owned(),
            s.cli_py.to_string_lossy().into_owned(),
            "-c".to_string(),
            cfg.to_string_lossy().into_owned(),
        ];
        (args, Some(s.project_root.clone()), None, String::new())
    };

    Ok(QueueJob {
        job_id: 0,
        created_epoch: epoch_now(),
        use_api,
        out_dir,
        project_root: Some(s.project_root.clone()),
        cli_args,
        cli_cwd,
        cfg_path: Some(cfg),
        api_payload,
        api_base_url,
        title: request.title(),
        batch_size: s.batch_size,
        seed: Some(s.seed),
        subgenre_for_naming: request.subgenre_for_naming(),
        task_type: s.task_type,
        duration_s: s.duration,
    })
}

/// Pending jobs, the active job, and the id counter
#[derive(Debug)]
pub struct JobQueue {
    path: PathBuf,
    pending: VecDeque<QueueJob>,
    active: Option<QueueJob>,
    next_job_id: JobId,
}

impl JobQueue {
    /// Restore the queue from `path`; a job that was running when the
    /// previous session ended comes back first in line.
    pub fn load(path: &Path) -> Self {
        let stored = load_queue(path);
        if !stored.jobs.is_empty() {
            tracing::info!("Restored {} queued job(s)", stored.jobs.len());
        }
        Self {
            path: path.to_path_buf(),
            pending: stored.jobs.into(),
            active: None,
            next_job_id: stored.next_job_id,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn active(&self) -> Option<&QueueJob> {
        self.active.as_ref()
    }

    pub fn pending(&self) -> impl Iterator<Item = &QueueJob> {
        self.pending.iter()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Active job (if any) followed by pending jobs in run order.
    pub fn list(&self) -> Vec<&QueueJob> {
        self.active.iter().chain(self.pending.iter()).collect()
    }

    /// Next job to run, without taking it.
    pub fn peek_next(&self) -> Option<&QueueJob> {
        self.pending.front()
    }

    /// Assign an id and append `job`.
    pub fn enqueue(&mut self, mut job: QueueJob) -> JobId {
        job.job_id = self.next_job_id;
        self.next_job_id += 1;
        let id = job.job_id;
        tracing::info!("Queued {}", job.summary());
        self.pending.push_back(job);
        self.persist();
        id
    }

    /// Remove a pending job. The active job cannot be removed; cancel it.
    pub fn remove(&mut self, job_id: JobId) -> Result<bool> {
        if self.active.as_ref().is_some_and(|j| j.job_id == job_id) {
            return Err(Error::Queue(format!(
                "job #{} is running; cancel it instead",
                job_id
            )));
        }
        let Some(pos) = self.pending.iter().position(|j| j.job_id == job_id) else {
            return Ok(false);
        };
        self.pending.remove(pos);
        tracing::info!("Removed job #{}", job_id);
        self.persist();
        Ok(true)
    }

    /// Drop every pending job; the active job keeps running.
    pub fn clear(&mut self) -> usize {
        let removed = self.pending.len();
        self.pending.clear();
        if removed > 0 {
            tracing::info!("Cleared {} pending job(s)", removed);
        }
        self.persist();
        removed
    }

    /// Move the next pending job to active and return a copy of it.
    ///
    /// Returns `None` while another job is active or nothing is pending.
    pub fn start_next(&mut self) -> Option<QueueJob> {
        if self.active.is_some() {
            return None;
        }
        let job = self.pending.pop_front()?;
        tracing::info!("Starting {}", job.summary());
        self.active = Some(job.clone());
        self.persist();
        Some(job)
    }

    /// Clear the active job once it has ended, whatever its exit code.
    pub fn finish(&mut self, job_id: JobId, code: i32) -> Option<QueueJob> {
        if !self.active.as_ref().is_some_and(|j| j.job_id == job_id) {
            tracing::warn!("Job #{} finished but is not the active job", job_id);
            return None;
        }
        let job = self.active.take();
        if code == 0 {
            tracing::info!("Job #{} finished", job_id);
        } else {
            tracing::warn!("Job #{} ended with code {}", job_id, code);
        }
        self.persist();
        job
    }

    fn persist(&self) {
        let pending: Vec<QueueJob> = self.pending.iter().cloned().collect();
        if let Err(e) = save_queue(&self.path, self.active.as_ref(), &pending, self.next_job_id) {
            tracing::warn!("Failed to save queue: {}", e);
        }
    }
}

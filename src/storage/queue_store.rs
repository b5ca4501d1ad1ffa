//! Queue persistence
//!
//! Pending jobs survive restarts. The active job is written first so a run
//! interrupted by a crash comes back as the next pending job.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::storage::write_atomic;
use crate::types::job::{JobId, QueueJob};

const QUEUE_FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    saved_epoch: f64,
    #[serde(default)]
    next_job_id: JobId,
    #[serde(default)]
    jobs: Vec<Value>,
}

/// Jobs restored from disk plus the id to hand out next
#[derive(Debug, Clone, PartialEq)]
pub struct StoredQueue {
    pub jobs: Vec<QueueJob>,
    pub next_job_id: JobId,
}

impl Default for StoredQueue {
    fn default() -> Self {
        Self {
            jobs: Vec::new(),
            next_job_id: 1,
        }
    }
}

/// Write the queue: `active` (if any) followed by `pending`.
pub fn save_queue(
    path: &Path,
    active: Option<&QueueJob>,
    pending: &[QueueJob],
    next_job_id: JobId,
) -> Result<()> {
    let jobs = active
        .into_iter()
        .chain(pending.iter())
        .map(serde_json::to_value)
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let file = QueueFile {
        version: QUEUE_FILE_VERSION,
        saved_epoch: epoch_now(),
        next_job_id: next_job_id.max(1),
        jobs,
    };
    write_atomic(path, &serde_json::to_string_pretty(&file)?)?;
    tracing::debug!("Saved {} queued job(s) to {}", file.jobs.len(), path.display());
    Ok(())
}

/// Load the queue, keeping only jobs that can still run.
///
/// A missing or corrupt file yields an empty queue.
pub fn load_queue(path: &Path) -> StoredQueue {
    match load_queue_internal(path) {
        Ok(stored) => stored,
        Err(e) => {
            tracing::warn!("Failed to load queue, starting empty: {}", e);
            StoredQueue::default()
        }
    }
}

fn load_queue_internal(path: &Path) -> Result<StoredQueue> {
    if !path.exists() {
        return Ok(StoredQueue::default());
    }
    let json = fs::read_to_string(path)?;
    let file: QueueFile = serde_json::from_str(&json)?;

    let jobs: Vec<QueueJob> = file
        .jobs
        .into_iter()
        .filter_map(|raw| match serde_json::from_value::<QueueJob>(raw) {
            Ok(job) if job.is_runnable() => Some(job),
            Ok(job) => {
                tracing::warn!("Dropping queued job #{}: missing run data", job.job_id);
                None
            }
            Err(e) => {
                tracing::warn!("Dropping unreadable queued job: {}", e);
                None
            }
        })
        .collect();

    let max_id = jobs.iter().map(|j| j.job_id).max().unwrap_or(0);
    let next_job_id = file.next_job_id.max(max_id + 1).max(1);

    Ok(StoredQueue { jobs, next_job_id })
}

/// Seconds since the Unix epoch.
pub fn epoch_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn cli_job(id: JobId) -> QueueJob {
        serde_json::from_value(json!({
            "job_id": id,
            "cli_args": ["python", "cli.py", "-c", "run.toml"],
            "cli_cwd": "/ace",
            "title": format!("job {}", id),
        }))
        .unwrap()
    }

    #[test]
    fn test_active_job_is_saved_first_and_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let active = cli_job(4);
        save_queue(&path, Some(&active), &[cli_job(5), cli_job(6)], 7).unwrap();

        let stored = load_queue(&path);
        let ids: Vec<JobId> = stored.jobs.iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec![4, 5, 6]);
        assert_eq!(stored.next_job_id, 7);
        assert_eq!(stored.jobs[0].cli_cwd, Some(PathBuf::from("/ace")));
    }

    #[test]
    fn test_unrunnable_jobs_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let raw = json!({
            "version": 1,
            "next_job_id": 2,
            "jobs": [
                {"job_id": 1, "use_api": true},
                {"job_id": 9, "use_api": true, "api_payload": {"prompt": "x"}},
                {"job_id": 3, "cli_args": []},
                "garbage",
            ]
        });
        fs::write(&path, raw.to_string()).unwrap();

        let stored = load_queue(&path);
        assert_eq!(stored.jobs.len(), 1);
        assert_eq!(stored.jobs[0].job_id, 9);
        assert_eq!(stored.next_job_id, 10);
    }

    #[test]
    fn test_loads_jobs_with_null_fields_and_string_seeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let raw = json!({
            "version": 1,
            "saved_epoch": 1736000000.5,
            "next_job_id": 3,
            "jobs": [
                {
                    "job_id": 1,
                    "created_epoch": 1736000000.0,
                    "use_api": false,
                    "out_dir": "/music/out",
                    "cli_args": ["python", "cli.py", "-c", "/music/out/run.toml"],
                    "cli_cwd": "/ace",
                    "cfg_path": "/music/out/run.toml",
                    "api_payload": null,
                    "api_base_url": null,
                    "title": "Warm pads",
                    "batch_size": 1,
                    "seed": "123",
                    "subgenre_for_naming": "Deep House",
                    "task_type": "text2music",
                    "duration_s": 60.0
                },
                {
                    "job_id": 2,
                    "created_epoch": 1736000001.0,
                    "use_api": true,
                    "out_dir": "/music/out",
                    "cli_args": null,
                    "cli_cwd": null,
                    "cfg_path": null,
                    "api_payload": {"prompt": "lofi"},
                    "api_base_url": "http://127.0.0.1:8001",
                    "title": "lofi",
                    "batch_size": 2,
                    "seed": "AUTO",
                    "subgenre_for_naming": "",
                    "task_type": "",
                    "duration_s": 30.0
                }
            ]
        });
        fs::write(&path, raw.to_string()).unwrap();

        let stored = load_queue(&path);
        assert_eq!(stored.jobs.len(), 2);
        assert_eq!(stored.jobs[0].seed, Some(123));
        assert_eq!(stored.jobs[0].api_base_url, "");
        assert!(stored.jobs[1].cli_args.is_empty());
        assert_eq!(stored.jobs[1].seed, None);
        assert_eq!(stored.next_job_id, 3);
    }

    #[test]
    fn test_missing_or_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        assert_eq!(load_queue(&path), StoredQueue::default());

        fs::write(&path, "{{{").unwrap();
        assert_eq!(load_queue(&path), StoredQueue::default());
    }
}

//! Queue jobs
//!
//! A job is fully resolved when it is queued: the CLI arguments or the API
//! payload are fixed, so later settings edits do not affect it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::types::task::TaskType;

/// Identifier assigned by the queue, starting at 1
pub type JobId = u64;

/// A queued generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub job_id: JobId,
    #[serde(default)]
    pub created_epoch: f64,
    #[serde(default)]
    pub use_api: bool,
    #[serde(default)]
    pub out_dir: PathBuf,

    /// ACE-Step checkout whose `instruction.txt` is archived after the run
    #[serde(default)]
    pub project_root: Option<PathBuf>,

    // CLI workflow
    #[serde(default, deserialize_with = "null_as_default")]
    pub cli_args: Vec<String>,
    #[serde(default)]
    pub cli_cwd: Option<PathBuf>,
    #[serde(default)]
    pub cfg_path: Option<PathBuf>,

    // API workflow
    #[serde(default)]
    pub api_payload: Option<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub api_base_url: String,

    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// `None` is a random seed, shown as `AUTO`
    #[serde(default, deserialize_with = "lenient_seed")]
    pub seed: Option<i64>,
    #[serde(default = "default_subgenre")]
    pub subgenre_for_naming: String,
    #[serde(default, deserialize_with = "lenient_task_type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub duration_s: f64,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accepts `42`, `"42"`, `"AUTO"`, `""` and `null`.
fn lenient_seed<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_task_type<'de, D>(deserializer: D) -> Result<TaskType, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s.parse().unwrap_or_default(),
        _ => TaskType::default(),
    })
}

fn default_title() -> String {
    "Job".to_string()
}

fn default_batch_size() -> u32 {
    1
}

fn default_subgenre() -> String {
    "Custom".to_string()
}

impl QueueJob {
    /// Whether a persisted job still carries enough to run.
    pub fn is_runnable(&self) -> bool {
        if self.use_api {
            matches!(self.api_payload, Some(Value::Object(_)))
        } else {
            !self.cli_args.is_empty() && self.cli_cwd.is_some()
        }
    }

    /// Seed as used in output names.
    pub fn seed_label(&self) -> String {
        self.seed
            .map(|s| s.to_string())
            .unwrap_or_else(|| "AUTO".to_string())
    }

    /// Where `instruction.txt` lives for this job.
    pub fn instruction_root(&self) -> Option<&Path> {
        self.project_root.as_deref().or(self.cli_cwd.as_deref())
    }

    /// One-line summary for listings.
    pub fn summary(&self) -> String {
        let mode = if self.use_api { "api" } else { "cli" };
        format!(
            "#{} [{}] {} ({}, {:.0}s, x{}, seed {})",
            self.job_id,
            mode,
            self.title,
            self.task_type,
            self.duration_s,
            self.batch_size,
            self.seed_label()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_runnable_rules() {
        let mut job: QueueJob = serde_json::from_value(json!({"job_id": 3})).unwrap();
        assert_eq!(job.title, "Job");
        assert_eq!(job.batch_size, 1);
        assert!(!job.is_runnable());

        job.cli_args = vec!["python".into(), "cli.py".into()];
        job.cli_cwd = Some(PathBuf::from("/ace"));
        assert!(job.is_runnable());

        job.use_api = true;
        assert!(!job.is_runnable());
        job.api_payload = Some(json!({"prompt": "x"}));
        assert!(job.is_runnable());
    }

    #[test]
    fn test_summary() {
        let job: QueueJob = serde_json::from_value(json!({
            "job_id": 7,
            "use_api": true,
            "title": "Deep House",
            "duration_s": 120.0,
            "batch_size": 2,
            "seed": 42,
        }))
        .unwrap();
        assert_eq!(job.summary(), "#7 [api] Deep House (text2music, 120s, x2, seed 42)");
    }

    #[test]
    fn test_null_fields_and_string_seeds() {
        let job: QueueJob = serde_json::from_value(json!({
            "job_id": 2,
            "use_api": true,
            "cli_args": null,
            "cli_cwd": null,
            "cfg_path": null,
            "api_payload": {"prompt": "x"},
            "api_base_url": null,
            "seed": "AUTO",
            "task_type": "",
        }))
        .unwrap();
        assert!(job.cli_args.is_empty());
        assert_eq!(job.api_base_url, "");
        assert_eq!(job.seed, None);
        assert_eq!(job.seed_label(), "AUTO");
        assert_eq!(job.task_type, TaskType::Text2music);

        let job: QueueJob =
            serde_json::from_value(json!({"job_id": 3, "seed": "123", "task_type": "Cover"})).unwrap();
        assert_eq!(job.seed, Some(123));
        assert_eq!(job.task_type, TaskType::Cover);

        let job: QueueJob = serde_json::from_value(json!({"job_id": 4, "seed": 9})).unwrap();
        assert_eq!(job.seed_label(), "9");
    }

    #[test]
    fn test_instruction_root_prefers_project_root() {
        let mut job: QueueJob = serde_json::from_value(json!({"job_id": 1, "cli_cwd": "/cli"})).unwrap();
        assert_eq!(job.instruction_root(), Some(Path::new("/cli")));
        job.project_root = Some(PathBuf::from("/proj"));
        assert_eq!(job.instruction_root(), Some(Path::new("/proj")));
    }
}

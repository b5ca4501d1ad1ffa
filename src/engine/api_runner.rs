//! API runner
//!
//! Runs one job through the API server. Each requested output is submitted
//! as its own single-audio task, since the server may shrink a batch under
//! VRAM pressure and return fewer files than asked for.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::engine::{JobOutcome, StopHandle};
use crate::types::job::JobId;

/// Overall limit for one job.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);
/// Delay between `/query_result` polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(800);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

const STATUS_SUCCEEDED: i64 = 1;
const STATUS_FAILED: i64 = 2;

/// Why an API run ended early; each maps to a fixed exit code
#[derive(Debug, Error)]
pub enum ApiRunError {
    #[error("unexpected /release_task response: {0}")]
    BadSubmit(String),

    #[error("timed out waiting for task result")]
    Timeout,

    #[error("task succeeded but no audio file URL was returned")]
    NoFileUrl,

    #[error("task failed")]
    TaskFailed,

    #[error("stopped")]
    Stopped,

    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("download error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiRunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ApiRunError::BadSubmit(_) => 1,
            ApiRunError::Timeout => 2,
            ApiRunError::NoFileUrl => 3,
            ApiRunError::TaskFailed => 4,
            ApiRunError::Stopped => 5,
            ApiRunError::Http(_) | ApiRunError::Io(_) => 9,
        }
    }
}

/// Submits, polls and downloads one job's outputs
#[derive(Debug, Clone)]
pub struct ApiRunner {
    job_id: JobId,
    base_url: String,
    payload: Value,
    output_dir: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
    http: reqwest::Client,
}

impl ApiRunner {
    pub fn new(job_id: JobId, base_url: &str, payload: Value, output_dir: PathBuf) -> Self {
        Self {
            job_id,
            base_url: base_url.trim_end_matches('/').to_string(),
            payload,
            output_dir,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run every requested output; the outcome lists saved files and seeds.
    pub async fn run(&self, stop: &StopHandle) -> JobOutcome {
        let mut saved = Vec::new();
        match self.run_all(stop, &mut saved).await {
            Ok(()) => JobOutcome {
                code: 0,
                outputs: saved,
            },
            Err(e) => {
                tracing::error!(job = self.job_id, "API run ended: {}", e);
                JobOutcome {
                    code: e.exit_code(),
                    outputs: saved,
                }
            }
        }
    }

    async fn run_all(
        &self,
        stop: &StopHandle,
        saved: &mut Vec<(PathBuf, Option<u64>)>,
    ) -> Result<(), ApiRunError> {
        let job = self.job_id;
        let started = Instant::now();
        let requested = self
            .payload
            .get("batch_size")
            .and_then(Value::as_u64)
            .unwrap_or(1)
            .max(1);
        let base_seed = self
            .payload
            .get("seed")
            .and_then(Value::as_i64)
            .and_then(|s| u64::try_from(s).ok());
        let random_seed = self
            .payload
            .get("use_random_seed")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        for i in 0..requested {
            if stop.is_stopped() {
                return Err(ApiRunError::Stopped);
            }

            let mut payload = self.payload.clone();
            payload["batch_size"] = json!(1);
            let seed = if random_seed {
                Some(u64::from(rand::thread_rng().gen::<u32>()))
            } else {
                base_seed.map(|s| s + i)
            };
            if let Some(seed) = seed {
                payload["seed"] = json!(seed);
                payload["use_random_seed"] = json!(false);
            }

            tracing::info!(job, "Submitting task to API server ({}/{})", i + 1, requested);
            let response = self.post_json("/release_task", &payload).await?;
            let task_id = response
                .get("data")
                .and_then(|d| d.get("task_id"))
                .and_then(task_id_text)
                .ok_or_else(|| ApiRunError::BadSubmit(response.to_string()))?;
            tracing::info!(job, "Task queued: {}", task_id);

            let files = self.wait_for_files(&task_id, started, stop).await?;

            let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
            let ext = payload
                .get("audio_format")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or("mp3")
                .to_string();

            for (j, file_url) in files.iter().enumerate() {
                let url = self.absolute_url(file_url);
                tracing::info!(
                    job,
                    "Downloading audio ({}/{}, file {}/{})",
                    i + 1,
                    requested,
                    j + 1,
                    files.len()
                );
                let name = output_file_name(&stamp, i as usize, requested as usize, j, files.len(), &ext);
                let path = self.output_dir.join(name);
                self.download(&url, &path).await?;
                tracing::info!(job, "Saved: {}", path.display());
                saved.push((path, seed));
            }
        }
        Ok(())
    }

    async fn wait_for_files(
        &self,
        task_id: &str,
        started: Instant,
        stop: &StopHandle,
    ) -> Result<Vec<String>, ApiRunError> {
        let query = json!({ "task_id_list": [task_id] });
        let mut last_progress = String::new();

        loop {
            if stop.is_stopped() {
                return Err(ApiRunError::Stopped);
            }
            if started.elapsed() > self.timeout {
                return Err(ApiRunError::Timeout);
            }

            let response = self.post_json("/query_result", &query).await?;
            if let Some(item) = response
                .get("data")
                .and_then(Value::as_array)
                .and_then(|items| items.first())
            {
                let progress = item
                    .get("progress_text")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .unwrap_or_default();
                if !progress.is_empty() && progress != last_progress {
                    tracing::info!(job = self.job_id, "{}", progress);
                    last_progress = progress.to_string();
                }

                match item.get("status").and_then(Value::as_i64).unwrap_or(0) {
                    STATUS_SUCCEEDED => {
                        let files = result_file_urls(item.get("result"));
                        if files.is_empty() {
                            return Err(ApiRunError::NoFileUrl);
                        }
                        return Ok(files);
                    }
                    STATUS_FAILED => return Err(ApiRunError::TaskFailed),
                    _ => {}
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = stop.stopped() => return Err(ApiRunError::Stopped),
            }
        }
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, ApiRunError> {
        let text = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .timeout(REQUEST_TIMEOUT)
            .json(body)
            .send()
            .await?
            .text()
            .await?;
        Ok(serde_json::from_str(&text).unwrap_or_else(|_| json!({ "_raw": text })))
    }

    fn absolute_url(&self, url: &str) -> String {
        if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            url.to_string()
        }
    }

    /// Stream `url` into a temp file next to `path`, then move it into place.
    async fn download(&self, url: &str, path: &Path) -> Result<(), ApiRunError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let mut response = self
            .http
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = File::create(&tmp).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn task_id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `file` URLs in a task result, which arrives either as a JSON string or
/// as an already-decoded list.
fn result_file_urls(result: Option<&Value>) -> Vec<String> {
    let decoded = match result {
        Some(Value::String(text)) => serde_json::from_str(text).unwrap_or(Value::Null),
        Some(other) => other.clone(),
        None => Value::Null,
    };
    decoded
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.get("file").and_then(Value::as_str))
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// `ace15_api_<stamp>[_NN[_MM]].<ext>`; numbered only when a job yields
/// more than one file.
fn output_file_name(
    stamp: &str,
    output: usize,
    outputs: usize,
    file: usize,
    files: usize,
    ext: &str,
) -> String {
    let mut suffix = String::new();
    if outputs > 1 || files > 1 {
        suffix = format!("_{:02}", output + 1);
        if files > 1 {
            suffix.push_str(&format!("_{:02}", file + 1));
        }
    }
    format!("ace15_api_{}{}.{}", stamp, suffix, ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Scripted stand-in for the API server
    #[derive(Clone)]
    struct FakeServer {
        /// Status returned by `/query_result`
        status: i64,
        /// `result` field returned on success
        result: Value,
        submitted: Arc<Mutex<Vec<Value>>>,
    }

    impl FakeServer {
        fn new(status: i64, result: Value) -> Self {
            Self {
                status,
                result,
                submitted: Arc::new(Mutex::new(Vec::new())),
            }
        }

        async fn spawn(self) -> String {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                loop {
                    let Ok((mut socket, _)) = listener.accept().await else { break };
                    let server = self.clone();
                    tokio::spawn(async move {
                        let (path, body) = read_request(&mut socket).await;
                        let reply = server.respond(&path, &body);
                        let head = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            reply.len()
                        );
                        let _ = socket.write_all(head.as_bytes()).await;
                        let _ = socket.write_all(&reply).await;
                    });
                }
            });
            format!("http://{}", addr)
        }

        fn respond(&self, path: &str, body: &[u8]) -> Vec<u8> {
            match path {
                "/release_task" => {
                    let payload: Value = serde_json::from_slice(body).unwrap();
                    let mut submitted = self.submitted.lock().unwrap();
                    submitted.push(payload);
                    json!({"data": {"task_id": format!("t{}", submitted.len())}})
                        .to_string()
                        .into_bytes()
                }
                "/query_result" => json!({"data": [{
                    "status": self.status,
                    "progress_text": "50%",
                    "result": self.result,
                }]})
                .to_string()
                .into_bytes(),
                _ => b"AUDIO".to_vec(),
            }
        }
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> (String, Vec<u8>) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            if n == 0 {
                break buf.len();
            }
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let path = head
            .split_whitespace()
            .nth(1)
            .unwrap_or("/")
            .to_string();
        let length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        while buf.len() < header_end + length {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        (path, buf[header_end..].to_vec())
    }

    fn payload(batch: u64, random: bool) -> Value {
        json!({
            "prompt": "x",
            "batch_size": batch,
            "seed": 100,
            "use_random_seed": random,
            "audio_format": "wav",
        })
    }

    #[test]
    fn test_output_file_name() {
        assert_eq!(output_file_name("S", 0, 1, 0, 1, "mp3"), "ace15_api_S.mp3");
        assert_eq!(output_file_name("S", 1, 3, 0, 1, "mp3"), "ace15_api_S_02.mp3");
        assert_eq!(output_file_name("S", 0, 1, 1, 2, "wav"), "ace15_api_S_01_02.wav");
    }

    #[test]
    fn test_result_file_urls() {
        let as_text = json!("[{\"file\": \"/v1/audio?path=a.mp3\"}, {\"file\": \"\"}]");
        assert_eq!(result_file_urls(Some(&as_text)), vec!["/v1/audio?path=a.mp3"]);
        let as_list = json!([{"file": "http://h/b.mp3"}]);
        assert_eq!(result_file_urls(Some(&as_list)), vec!["http://h/b.mp3"]);
        assert!(result_file_urls(Some(&json!("not json"))).is_empty());
        assert!(result_file_urls(None).is_empty());
    }

    #[tokio::test]
    async fn test_batch_is_split_with_sequential_seeds() {
        let server = FakeServer::new(1, json!("[{\"file\": \"/files/out.wav\"}]"));
        let submitted = Arc::clone(&server.submitted);
        let base_url = server.spawn().await;
        let out = tempfile::tempdir().unwrap();

        let runner = ApiRunner::new(1, &base_url, payload(2, false), out.path().to_path_buf())
            .with_poll_interval(Duration::from_millis(10));
        let outcome = runner.run(&StopHandle::new()).await;

        assert_eq!(outcome.code, 0);
        assert_eq!(outcome.outputs.len(), 2);
        assert_eq!(outcome.outputs[0].1, Some(100));
        assert_eq!(outcome.outputs[1].1, Some(101));
        for (path, _) in &outcome.outputs {
            assert_eq!(std::fs::read(path).unwrap(), b"AUDIO");
            assert_eq!(path.extension().unwrap(), "wav");
        }

        let submitted = submitted.lock().unwrap();
        assert_eq!(submitted.len(), 2);
        assert!(submitted.iter().all(|p| p["batch_size"] == 1));
        assert_eq!(submitted[1]["seed"], 101);
    }

    #[tokio::test]
    async fn test_random_seeds_are_drawn_per_output() {
        let server = FakeServer::new(1, json!([{"file": "/files/a.wav"}]));
        let submitted = Arc::clone(&server.submitted);
        let base_url = server.spawn().await;
        let out = tempfile::tempdir().unwrap();

        let runner = ApiRunner::new(1, &base_url, payload(1, true), out.path().to_path_buf());
        let outcome = runner.run(&StopHandle::new()).await;

        assert_eq!(outcome.code, 0);
        let seed = outcome.outputs[0].1.unwrap();
        assert!(seed <= u64::from(u32::MAX));
        assert_eq!(submitted.lock().unwrap()[0]["use_random_seed"], false);
    }

    #[tokio::test]
    async fn test_failure_codes() {
        let out = tempfile::tempdir().unwrap();

        let failed = FakeServer::new(2, Value::Null).spawn().await;
        let runner = ApiRunner::new(1, &failed, payload(1, false), out.path().to_path_buf());
        assert_eq!(runner.run(&StopHandle::new()).await.code, 4);

        let empty = FakeServer::new(1, json!("[]")).spawn().await;
        let runner = ApiRunner::new(1, &empty, payload(1, false), out.path().to_path_buf());
        assert_eq!(runner.run(&StopHandle::new()).await.code, 3);

        let pending = FakeServer::new(0, Value::Null).spawn().await;
        let runner = ApiRunner::new(1, &pending, payload(1, false), out.path().to_path_buf())
            .with_timeout(Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(10));
        assert_eq!(runner.run(&StopHandle::new()).await.code, 2);

        let stop = StopHandle::new();
        stop.stop();
        let runner = ApiRunner::new(1, &pending, payload(1, false), out.path().to_path_buf());
        assert_eq!(runner.run(&stop).await.code, 5);

        let runner = ApiRunner::new(1, "http://127.0.0.1:1", payload(1, false), out.path().to_path_buf());
        assert_eq!(runner.run(&StopHandle::new()).await.code, 9);
    }
}

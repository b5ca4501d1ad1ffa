//! Keep-in-VRAM API server
//!
//! Starts ACE-Step's FastAPI server once so models stay loaded between
//! jobs. Upstream `api_server.py` imports a helper from the Gradio UI
//! package; when it does, a Gradio-free copy is generated next to it.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::process::{Child, Command};

use crate::engine::process::{apply_utf8_env, merge_output, terminate, TERMINATE_GRACE};
use crate::error::{Error, Result};

/// Log lines that mean uvicorn is accepting requests.
pub const READY_MARKERS: [&str; 2] = ["Uvicorn running on", "Application startup complete"];

const HEADLESS_FILE: &str = "api_server_headless.py";
const GRADIO_PACKAGE: &str = "acestep.ui.gradio";
const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);
const READY_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

const HEADLESS_HELPER: &str = r#"# --- generation info without gradio (generated by ace15-studio) ---
from typing import Any, Dict, Optional


def _build_generation_info_headless(
    lm_metadata: Any = None,
    time_costs: Optional[Dict[str, Any]] = None,
    seed_value: Optional[str] = None,
    inference_steps: Optional[int] = None,
    num_audios: int = 1,
) -> str:
    try:
        costs = time_costs if isinstance(time_costs, dict) else {}
        total = float(costs.get("lm_total_time", 0.0) or 0.0)
        total += float(costs.get("dit_total_time_cost", 0.0) or 0.0)
        n = int(num_audios or 0)
        if total <= 0 or n <= 0:
            return ""
        seed = f" seed={seed_value}" if seed_value else ""
        steps = f" steps={inference_steps}" if inference_steps else ""
        return f"Total: {total:.2f}s ({n} audio, avg {total / n:.2f}s){seed}{steps}"
    except Exception:
        return ""
# ------------------------------------------------------------------
"#;

/// Upstream server script inside the ACE-Step checkout.
pub fn api_server_script(project_root: &Path) -> PathBuf {
    project_root.join("acestep").join("api_server.py")
}

/// Rewrite `source` so it no longer imports the Gradio package.
///
/// Returns `None` when the source does not depend on Gradio.
pub fn patch_headless(source: &str) -> Option<String> {
    if !source.contains(GRADIO_PACKAGE) {
        return None;
    }

    let import = Regex::new(
        r"(?m)^from\s+acestep\.ui\.gradio\.events\.results_handlers\s+import\s+_build_generation_info\s*$",
    )
    .ok()?;
    let uvicorn_with_args = Regex::new(r#"uvicorn\.run\(\s*["']acestep\.api_server:app["']\s*,"#).ok()?;
    let uvicorn_bare = Regex::new(r#"uvicorn\.run\(\s*["']acestep\.api_server:app["']\s*\)"#).ok()?;

    let patched = import.replace_all(source, regex::NoExpand(HEADLESS_HELPER));
    let patched = patched.replace("_build_generation_info(", "_build_generation_info_headless(");
    // Running by module path would re-import the Gradio-dependent upstream module.
    let patched = uvicorn_with_args.replace_all(&patched, "uvicorn.run(app,");
    let patched = uvicorn_bare.replace_all(&patched, "uvicorn.run(app)");
    Some(patched.into_owned())
}

/// Script to launch: the upstream file, or its headless copy when upstream
/// needs Gradio. A headless copy newer than upstream is reused.
pub fn ensure_headless(api_server_py: &Path) -> PathBuf {
    let headless = api_server_py.with_file_name(HEADLESS_FILE);
    let source = match fs::read(api_server_py) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::warn!("Failed to read {}: {}", api_server_py.display(), e);
            return api_server_py.to_path_buf();
        }
    };

    if !source.contains(GRADIO_PACKAGE) {
        return api_server_py.to_path_buf();
    }
    if is_newer_or_same(&headless, api_server_py) {
        return headless;
    }

    let Some(patched) = patch_headless(&source) else {
        return api_server_py.to_path_buf();
    };
    match fs::write(&headless, patched) {
        Ok(()) => {
            tracing::info!("Generated headless API server: {}", headless.display());
            headless
        }
        Err(e) => {
            tracing::warn!("Failed to write headless API server: {}", e);
            api_server_py.to_path_buf()
        }
    }
}

fn is_newer_or_same(candidate: &Path, reference: &Path) -> bool {
    let mtime = |p: &Path| fs::metadata(p).and_then(|m| m.modified()).ok();
    match (mtime(candidate), mtime(reference)) {
        (Some(c), Some(r)) => c >= r,
        _ => false,
    }
}

/// The API server child process
#[derive(Debug)]
pub struct ApiServer {
    env_python: PathBuf,
    project_root: PathBuf,
    host: String,
    port: u16,
    child: Option<Child>,
    ready: Arc<AtomicBool>,
    http: reqwest::Client,
}

impl ApiServer {
    pub fn new(env_python: PathBuf, project_root: PathBuf, host: String, port: u16) -> Self {
        Self {
            env_python,
            project_root,
            host,
            port,
            child: None,
            ready: Arc::new(AtomicBool::new(false)),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn is_ready(&mut self) -> bool {
        self.is_running() && self.ready.load(Ordering::SeqCst)
    }

    /// Start the server unless it is already running.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.ready.store(false, Ordering::SeqCst);

        let upstream = api_server_script(&self.project_root);
        if !upstream.exists() {
            return Err(Error::Server(format!(
                "{} not found; install the full ACE-Step checkout or disable keep_in_vram",
                upstream.display()
            )));
        }
        let script = ensure_headless(&upstream);

        let mut cmd = Command::new(&self.env_python);
        cmd.arg(&script)
            .args(["--host", &self.host, "--port", &self.port.to_string()])
            .current_dir(&self.project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_utf8_env(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Server(format!("failed to start API server: {}", e)))?;
        tracing::info!("Starting API server at {}", self.base_url());

        let mut lines = merge_output(&mut child);
        let ready = Arc::clone(&self.ready);
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                if !line.is_empty() {
                    tracing::info!(target: "ace15_studio::api_server::log", "{}", line);
                }
                if READY_MARKERS.iter().any(|marker| line.contains(marker)) {
                    ready.store(true, Ordering::SeqCst);
                }
            }
            tracing::info!("API server output closed");
        });

        self.child = Some(child);
        Ok(())
    }

    /// Wait until the log reports readiness or `/openapi.json` answers.
    pub async fn wait_until_ready(&mut self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        let url = format!("{}/openapi.json", self.base_url());

        while Instant::now() < deadline {
            if !self.is_running() {
                return false;
            }
            if self.ready.load(Ordering::SeqCst) {
                return true;
            }
            if self.probe(&url).await {
                self.ready.store(true, Ordering::SeqCst);
                return true;
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
        false
    }

    async fn probe(&self, url: &str) -> bool {
        match self
            .http
            .get(url)
            .timeout(READY_PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().as_u16() < 500,
            Err(_) => false,
        }
    }

    /// Terminate the server, killing it after a grace period.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            tracing::info!("Stopping API server");
            terminate(&mut child, TERMINATE_GRACE).await;
        }
        self.ready.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPSTREAM: &str = r#"import uvicorn
from acestep.ui.gradio.events.results_handlers import _build_generation_info

def handler():
    return _build_generation_info(None, {}, "1", 8, 1)

if __name__ == "__main__":
    uvicorn.run("acestep.api_server:app", host=args.host)
"#;

    #[test]
    fn test_patch_headless() {
        let patched = patch_headless(UPSTREAM).unwrap();
        assert!(!patched.contains("acestep.ui.gradio"));
        assert!(patched.contains("def _build_generation_info_headless("));
        assert!(patched.contains("return _build_generation_info_headless(None"));
        assert!(patched.contains("uvicorn.run(app, host=args.host)"));
    }

    #[test]
    fn test_gradio_free_source_is_used_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("api_server.py");
        fs::write(&script, "import uvicorn\n").unwrap();

        assert!(patch_headless("import uvicorn\n").is_none());
        assert_eq!(ensure_headless(&script), script);
        assert!(!dir.path().join(HEADLESS_FILE).exists());
    }

    #[test]
    fn test_headless_copy_is_written_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("api_server.py");
        fs::write(&script, UPSTREAM).unwrap();

        let headless = ensure_headless(&script);
        assert_eq!(headless, dir.path().join(HEADLESS_FILE));

        fs::write(&headless, "# edited\n").unwrap();
        assert_eq!(ensure_headless(&script), headless);
        assert_eq!(fs::read_to_string(&headless).unwrap(), "# edited\n");
    }

    #[test]
    fn test_headless_copy_tolerates_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("api_server.py");
        let mut bytes = b"# caf\xe9\n".to_vec();
        bytes.extend_from_slice(UPSTREAM.as_bytes());
        fs::write(&script, bytes).unwrap();

        let headless = ensure_headless(&script);
        assert_eq!(headless, dir.path().join(HEADLESS_FILE));
        let written = fs::read_to_string(&headless).unwrap();
        assert!(written.starts_with("# caf\u{FFFD}\n"));
    }

    #[test]
    fn test_start_without_checkout_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = ApiServer::new(
            dir.path().join("python"),
            dir.path().to_path_buf(),
            "127.0.0.1".into(),
            8001,
        );
        assert!(matches!(server.start(), Err(Error::Server(_))));
        assert!(!server.is_running());
        assert_eq!(server.base_url(), "http://127.0.0.1:8001");
    }
}

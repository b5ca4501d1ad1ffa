//! Launcher
//!
//! Install and run entry points. Both resolve an interpreter (the bundled
//! environment when present, else `python` from PATH) and run one script
//! with the application root as working directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::error::{Error, Result};
use crate::storage::layout::AppLayout;

/// Interpreter looked up on PATH when no bundled environment exists.
pub const SYSTEM_PYTHON: &str = "python";

/// Which script a launch runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// `presets/extra_env/ace_step_15_installer.py`
    Installer,
    /// `helpers/ace_step_15.py`
    App,
}

impl Entry {
    pub fn script(self, layout: &AppLayout) -> PathBuf {
        match self {
            Entry::Installer => layout.installer_script(),
            Entry::App => layout.app_entry_script(),
        }
    }
}

/// A fully resolved launch: interpreter, script and working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub interpreter: PathBuf,
    pub script: PathBuf,
    pub working_dir: PathBuf,
}

/// Bundled interpreter under `base_dir`, else the system one.
pub fn resolve_interpreter(base_dir: &Path) -> PathBuf {
    let bundled = AppLayout::new(base_dir).bundled_python();
    if bundled.is_file() {
        bundled
    } else {
        PathBuf::from(SYSTEM_PYTHON)
    }
}

/// Directory of the running executable, falling back to the current one.
pub fn default_base_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Resolve what `entry` would run from `base_dir`.
pub fn plan(base_dir: &Path, entry: Entry) -> Result<LaunchPlan> {
    let layout = AppLayout::new(base_dir);
    let script = entry.script(&layout);
    if !script.is_file() {
        return Err(Error::NotFound(script));
    }
    Ok(LaunchPlan {
        interpreter: resolve_interpreter(base_dir),
        script,
        working_dir: base_dir.to_path_buf(),
    })
}

/// Run the plan with inherited stdio and wait; returns the exit code.
pub async fn run(plan: &LaunchPlan) -> Result<i32> {
    tracing::info!(
        "Running {} {} in {}",
        plan.interpreter.display(),
        plan.script.display(),
        plan.working_dir.display()
    );
    let status = Command::new(&plan.interpreter)
        .arg(&plan.script)
        .current_dir(&plan.working_dir)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|e| {
            Error::Process(format!(
                "failed to start {}: {}",
                plan.interpreter.display(),
                e
            ))
        })?;
    Ok(status.code().unwrap_or(-1))
}

/// Run the installer script.
pub async fn install(base_dir: &Path) -> Result<i32> {
    run(&plan(base_dir, Entry::Installer)?).await
}

/// Run the application entry script.
pub async fn launch(base_dir: &Path) -> Result<i32> {
    run(&plan(base_dir, Entry::App)?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    #[test]
    fn test_prefers_bundled_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_interpreter(dir.path()), PathBuf::from(SYSTEM_PYTHON));

        let bundled = AppLayout::new(dir.path()).bundled_python();
        touch(&bundled);
        assert_eq!(resolve_interpreter(dir.path()), bundled);
    }

    #[test]
    fn test_plan_uses_base_dir_as_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let layout = AppLayout::new(dir.path());
        touch(&layout.app_entry_script());

        let plan = plan(dir.path(), Entry::App).unwrap();
        assert_eq!(plan.working_dir, dir.path());
        assert_eq!(plan.script, layout.app_entry_script());
        assert_eq!(plan.interpreter, PathBuf::from(SYSTEM_PYTHON));
    }

    #[test]
    fn test_missing_script_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = plan(dir.path(), Entry::Installer).unwrap_err();
        match err {
            Error::NotFound(path) => assert!(path.ends_with("ace_step_15_installer.py")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reports_exit_code_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("entry.sh");
        fs::write(&script, "pwd > where.txt\nexit 4\n").unwrap();

        let plan = LaunchPlan {
            interpreter: PathBuf::from("sh"),
            script,
            working_dir: dir.path().to_path_buf(),
        };
        assert_eq!(run(&plan).await.unwrap(), 4);

        let recorded = fs::read_to_string(dir.path().join("where.txt")).unwrap();
        assert_eq!(
            fs::canonicalize(recorded.trim()).unwrap(),
            fs::canonicalize(dir.path()).unwrap()
        );
    }
}

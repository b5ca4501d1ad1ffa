//! Application layout
//!
//! Every well-known path under the application root: the bundled Python
//! environment, the ACE-Step checkout, and the `presets/setsave` state files.

use std::path::{Path, PathBuf};

/// Settings file name under `presets/setsave`.
pub const SETTINGS_JSON: &str = "ace_step_15_ui.settings.json";
/// Remembers where the last settings file was saved.
pub const SETTINGS_POINTER_JSON: &str = "ace_step_15_ui.settings_path.json";
/// Persisted generation queue.
pub const QUEUE_JSON: &str = "ace_step_15_ui.queue.json";
/// Genre / subgenre preset document.
pub const PRESET_MANAGER_JSON: &str = "presetmanager.json";

/// Environment variable overriding root detection.
pub const ROOT_ENV_VAR: &str = "ACE15_ROOT";

const ROOT_SEARCH_DEPTH: usize = 8;

/// Resolved application root and the paths derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppLayout {
    root: PathBuf,
}

impl AppLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Detect the root starting from `start`, honoring `ACE15_ROOT`.
    pub fn detect(start: &Path) -> Self {
        if let Ok(root) = std::env::var(ROOT_ENV_VAR) {
            let root = root.trim();
            if !root.is_empty() {
                return Self::new(root);
            }
        }
        Self::new(guess_root(start))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn setsave_dir(&self) -> PathBuf {
        self.root.join("presets").join("setsave")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.setsave_dir().join(SETTINGS_JSON)
    }

    pub fn settings_pointer_path(&self) -> PathBuf {
        self.setsave_dir().join(SETTINGS_POINTER_JSON)
    }

    pub fn queue_path(&self) -> PathBuf {
        self.setsave_dir().join(QUEUE_JSON)
    }

    pub fn presets_path(&self) -> PathBuf {
        self.setsave_dir()
            .join("ace15presets")
            .join(PRESET_MANAGER_JSON)
    }

    /// Directory holding the installer script and the bundled environment.
    pub fn extra_env_dir(&self) -> PathBuf {
        self.root.join("presets").join("extra_env")
    }

    pub fn installer_script(&self) -> PathBuf {
        self.extra_env_dir().join("ace_step_15_installer.py")
    }

    pub fn app_entry_script(&self) -> PathBuf {
        self.root.join("helpers").join("ace_step_15.py")
    }

    /// Interpreter of the environment created by the installer.
    pub fn bundled_python(&self) -> PathBuf {
        venv_python(&self.extra_env_dir().join(".ace_env"))
    }

    /// Interpreter of the shared `environments/.ace_15` environment.
    pub fn shared_env_python(&self) -> PathBuf {
        venv_python(&self.root.join("environments").join(".ace_15"))
    }

    /// Interpreter used to run ACE-Step: the bundled one when installed,
    /// otherwise the shared environment.
    pub fn default_env_python(&self) -> PathBuf {
        let bundled = self.bundled_python();
        if bundled.exists() {
            bundled
        } else {
            self.shared_env_python()
        }
    }

    pub fn ace_project_root(&self) -> PathBuf {
        self.root
            .join("models")
            .join("ace_step_15")
            .join("repo")
            .join("ACE-Step-1.5")
    }

    pub fn ace_cli_py(&self) -> PathBuf {
        self.ace_project_root().join("cli.py")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.ace_project_root().join("checkpoints")
    }

    pub fn default_output_dir(&self) -> PathBuf {
        self.root.join("output").join("audio").join("ace15")
    }

    /// Output folders used by older builds; settings pointing here are migrated.
    pub fn legacy_output_dirs(&self) -> [PathBuf; 2] {
        [
            self.root.join("output").join("ace_step_15"),
            self.root
                .join("helpers")
                .join("output")
                .join("audio")
                .join("ace15"),
        ]
    }
}

/// Interpreter path inside a virtual environment.
pub fn venv_python(env_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        env_dir.join("Scripts").join("python.exe")
    } else {
        env_dir.join("bin").join("python")
    }
}

/// Best-effort guess for the application root.
///
/// A start directory named `helpers` maps to its parent. Otherwise walk up
/// looking for a folder with `models` plus `environments` or `presets`.
pub fn guess_root(start: &Path) -> PathBuf {
    let is_helpers = start
        .file_name()
        .map(|name| name.to_string_lossy().eq_ignore_ascii_case("helpers"))
        .unwrap_or(false);
    if is_helpers {
        if let Some(parent) = start.parent() {
            return parent.to_path_buf();
        }
    }

    let mut current = Some(start);
    for _ in 0..ROOT_SEARCH_DEPTH {
        let Some(dir) = current else { break };
        if dir.join("models").is_dir()
            && (dir.join("environments").is_dir() || dir.join("presets").is_dir())
        {
            return dir.to_path_buf();
        }
        current = dir.parent();
    }

    start.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_helpers_dir_maps_to_parent() {
        let dir = tempfile::tempdir().unwrap();
        let helpers = dir.path().join("helpers");
        fs::create_dir_all(&helpers).unwrap();

        assert_eq!(guess_root(&helpers), dir.path());
    }

    #[test]
    fn test_walks_up_to_marked_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("models")).unwrap();
        fs::create_dir_all(dir.path().join("presets")).unwrap();
        let nested = dir.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();

        assert_eq!(guess_root(&nested), dir.path());
    }

    #[test]
    fn test_unmarked_tree_falls_back_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("plain");
        fs::create_dir_all(&nested).unwrap();

        assert_eq!(guess_root(&nested), nested);
    }

    #[test]
    fn test_setsave_paths() {
        let layout = AppLayout::new("/fv");
        assert_eq!(
            layout.queue_path(),
            Path::new("/fv/presets/setsave/ace_step_15_ui.queue.json")
        );
        assert_eq!(
            layout.presets_path(),
            Path::new("/fv/presets/setsave/ace15presets/presetmanager.json")
        );
        assert_eq!(
            layout.checkpoints_dir(),
            Path::new("/fv/models/ace_step_15/repo/ACE-Step-1.5/checkpoints")
        );
    }

    #[test]
    fn test_default_env_python_prefers_bundled_env() {
        let dir = tempfile::tempdir().unwrap();
        let layout = AppLayout::new(dir.path());
        assert_eq!(layout.default_env_python(), layout.shared_env_python());

        let bundled = layout.bundled_python();
        fs::create_dir_all(bundled.parent().unwrap()).unwrap();
        fs::write(&bundled, "").unwrap();
        assert_eq!(layout.default_env_python(), bundled);
    }
}

//! Fixtures shared by unit tests.

use std::fs;

use tempfile::TempDir;

use crate::storage::layout::AppLayout;
use crate::storage::settings::Settings;

/// A root with placeholder python, cli.py and checkout, plus settings
/// pointing at it.
pub fn fake_install() -> (TempDir, Settings) {
    let dir = tempfile::tempdir().unwrap();
    let layout = AppLayout::new(dir.path());
    let settings = Settings::for_layout(&layout);

    fs::create_dir_all(settings.env_python.parent().unwrap()).unwrap();
    fs::write(&settings.env_python, "").unwrap();
    fs::create_dir_all(&settings.project_root).unwrap();
    fs::write(&settings.cli_py, "").unwrap();

    (dir, settings)
}

//! Output folder housekeeping
//!
//! Lists generated audio, gives fresh outputs readable names, and moves the
//! `instruction.txt` ACE-Step leaves in its checkout into the output folder.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::Result;
use crate::storage::ensure_dir;

/// Extensions treated as generated audio.
pub const AUDIO_EXTENSIONS: [&str; 5] = ["wav", "mp3", "flac", "ogg", "m4a"];

const INSTRUCTION_TXT: &str = "instruction.txt";
const CONFIG_PREFIX: &str = "ace_step_run_";
const NEW_FILE_SLACK: Duration = Duration::from_secs(2);

/// Audio files under `dir` (recursive), newest first.
pub fn list_audio_files(dir: &Path) -> Vec<PathBuf> {
    if !dir.exists() {
        return Vec::new();
    }
    let pattern = format!("{}/**/*", glob::Pattern::escape(&dir.to_string_lossy()));

    let mut files: Vec<(PathBuf, SystemTime)> = match glob::glob(&pattern) {
        Ok(paths) => paths
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_file() && is_audio(path))
            .map(|path| {
                let mtime = modified(&path);
                (path, mtime)
            })
            .collect(),
        Err(e) => {
            tracing::warn!("Bad output glob {}: {}", pattern, e);
            return Vec::new();
        }
    };

    files.sort_by(|a, b| b.1.cmp(&a.1));
    files.into_iter().map(|(path, _)| path).collect()
}

fn is_audio(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_ascii_lowercase();
            AUDIO_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

fn modified(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Make `value` safe as a file name fragment.
///
/// Alphanumerics, `-` and `_` are kept, anything else becomes `_`; runs of
/// `_` collapse and leading/trailing `.`, `_` and spaces are trimmed.
pub fn sanitize_filename_part(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.trim().chars() {
        let keep = ch.is_alphanumeric() || ch == '-' || ch == '_';
        let ch = if keep { ch } else { '_' };
        if ch == '_' && out.ends_with('_') {
            continue;
        }
        out.push(ch);
    }
    out.trim_matches(|c| c == '.' || c == '_' || c == ' ').to_string()
}

fn sanitize_or(value: &str, fallback: &str) -> String {
    let clean = sanitize_filename_part(value);
    if clean.is_empty() {
        fallback.to_string()
    } else {
        clean
    }
}

/// Outputs present before a run, used to tell which files are new.
#[derive(Debug, Clone)]
pub struct OutputSnapshot {
    existing: HashSet<PathBuf>,
    started: SystemTime,
}

impl OutputSnapshot {
    pub fn take(dir: &Path) -> Self {
        Self {
            existing: list_audio_files(dir).iter().map(|p| canonical(p)).collect(),
            started: SystemTime::now(),
        }
    }

    /// Files not in the snapshot; failing that, files written since the run
    /// started (minus a small slack). Oldest first.
    pub fn new_files(&self, dir: &Path) -> Vec<PathBuf> {
        let all = list_audio_files(dir);
        let mut fresh: Vec<PathBuf> = all
            .iter()
            .filter(|p| !self.existing.contains(&canonical(p)))
            .cloned()
            .collect();

        if fresh.is_empty() {
            let since = self
                .started
                .checked_sub(NEW_FILE_SLACK)
                .unwrap_or(SystemTime::UNIX_EPOCH);
            fresh = all.into_iter().filter(|p| modified(p) >= since).collect();
        }

        fresh.sort_by_key(|p| modified(p));
        fresh
    }
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// First free path, appending `_2`, `_3`, ... to the stem on collision.
pub fn unique_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();

    let mut i = 2;
    loop {
        let candidate = parent.join(format!("{}_{}{}", stem, i, ext));
        if !candidate.exists() {
            return candidate;
        }
        i += 1;
    }
}

fn output_name(subgenre: &str, seed: &str, stamp: &str, index: Option<usize>, src: &Path) -> String {
    let counter = index.map(|i| format!("_{}", i)).unwrap_or_default();
    let ext = src
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    format!("{}__seed{}__{}{}{}", subgenre, seed, stamp, counter, ext)
}

fn rename_all<'a>(
    out_dir: &Path,
    subgenre: &str,
    outputs: impl ExactSizeIterator<Item = (&'a Path, String)>,
) -> Vec<PathBuf> {
    let subgenre = sanitize_or(subgenre, "Custom");
    let stamp = timestamp();
    let multiple = outputs.len() > 1;

    let mut renamed = Vec::new();
    for (idx, (src, seed)) in outputs.enumerate() {
        if !src.exists() {
            continue;
        }
        let seed = sanitize_or(&seed, "AUTO");
        let index = multiple.then_some(idx + 1);
        let dst = unique_path(out_dir.join(output_name(&subgenre, &seed, &stamp, index, src)));

        match fs::rename(src, &dst) {
            Ok(()) => {
                tracing::info!(
                    "Renamed output: {} -> {}",
                    file_name(src),
                    file_name(&dst)
                );
                renamed.push(dst);
            }
            Err(e) => tracing::warn!("Could not rename '{}': {}", file_name(src), e),
        }
    }
    renamed
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Rename the outputs of a CLI run to `<subgenre>__seed<seed>__<stamp>[_i]`.
pub fn rename_new_outputs(
    out_dir: &Path,
    snapshot: &OutputSnapshot,
    subgenre: &str,
    seed: Option<i64>,
) -> Vec<PathBuf> {
    if !out_dir.exists() {
        return Vec::new();
    }
    let fresh = snapshot.new_files(out_dir);
    let seed = seed.map(|s| s.to_string()).unwrap_or_default();
    rename_all(
        out_dir,
        subgenre,
        fresh.iter().map(|p| (p.as_path(), seed.clone())),
    )
}

/// Rename known outputs, each with the seed it was generated with.
pub fn rename_specific_outputs(
    out_dir: &Path,
    outputs: &[(PathBuf, Option<u64>)],
    subgenre: &str,
    fallback_seed: Option<i64>,
) -> Vec<PathBuf> {
    if !out_dir.exists() || outputs.is_empty() {
        return Vec::new();
    }
    rename_all(
        out_dir,
        subgenre,
        outputs.iter().map(|(path, seed)| {
            let seed = seed
                .map(|s| s.to_string())
                .or_else(|| fallback_seed.map(|s| s.to_string()))
                .unwrap_or_default();
            (path.as_path(), seed)
        }),
    )
}

/// Move `<project_root>/instruction.txt` into `out_dir`.
///
/// The name carries the config's timestamp and whether the run succeeded.
/// Returns the new path, or `None` when there was nothing to move.
pub fn archive_instruction(
    project_root: &Path,
    out_dir: &Path,
    cfg_path: Option<&Path>,
    exit_code: i32,
) -> Result<Option<PathBuf>> {
    let instruction = project_root.join(INSTRUCTION_TXT);
    if !instruction.is_file() {
        return Ok(None);
    }
    ensure_dir(out_dir)?;

    let stamp = cfg_path
        .and_then(|p| p.file_stem())
        .map(|stem| {
            let stem = stem.to_string_lossy();
            stem.strip_prefix(CONFIG_PREFIX).unwrap_or(&stem).to_string()
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(timestamp);

    let kind = if exit_code == 0 { "used" } else { "error" };
    let dst = unique_path(out_dir.join(format!("instruction_{}_{}.txt", kind, stamp)));

    move_file(&instruction, &dst)?;
    tracing::info!("Moved instruction.txt -> {}", dst.display());
    Ok(Some(dst))
}

fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if fs::rename(src, dst).is_err() {
        fs::copy(src, dst)?;
        fs::remove_file(src)?;
    }
    Ok(())
}

/// Open a folder or file with the platform's default handler.
pub fn open_in_explorer(path: &Path) -> Result<()> {
    let program = if cfg!(windows) {
        "explorer"
    } else if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    };
    std::process::Command::new(program).arg(path).spawn()?;
    Ok(())
}

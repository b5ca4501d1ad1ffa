//! Checkpoint discovery
//!
//! Lists the DiT and LM checkpoints present under the ACE-Step checkout.
//! Known model IDs are always offered so picking one lets ACE download it.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::types::task::non_auto;

/// Main (DiT) models ACE-Step can download on first use.
pub const KNOWN_MAIN_MODELS: [&str; 4] = [
    "acestep-v15-base",
    "acestep-v15-sft",
    "acestep-v15-turbo",
    "acestep-v15-turbo-rl",
];

/// 5Hz LM models ACE-Step can download on first use.
pub const KNOWN_LM_MODELS: [&str; 3] = [
    "acestep-5Hz-lm-0.6B",
    "acestep-5Hz-lm-1.7B",
    "acestep-5Hz-lm-4B",
];

const HIDDEN_LM_MODEL: &str = "acestep-5Hz-lm-3B";

/// Main models under `<project_root>/checkpoints`, then known IDs not present.
pub fn discover_main_models(project_root: &Path) -> Vec<String> {
    let found = scan_checkpoints(project_root, |name| {
        name.contains("acestep") && name.contains("v15")
    });
    with_known(found, &KNOWN_MAIN_MODELS)
}

/// LM models under `<project_root>/checkpoints`, then known IDs not present.
pub fn discover_lm_models(project_root: &Path) -> Vec<String> {
    let found = scan_checkpoints(project_root, |name| {
        name.contains("acestep-5Hz-lm") && !name.contains(HIDDEN_LM_MODEL)
    });
    with_known(found, &KNOWN_LM_MODELS)
}

/// Whether the DiT shift parameter applies to `main_model`.
///
/// Only base checkpoints honor it; auto selection does not.
pub fn shift_supported(main_model: &str) -> bool {
    let Some(name) = non_auto(main_model) else {
        return false;
    };
    let name = name.to_ascii_lowercase();
    name.contains("base")
        && !["turbo", "sft", "rl", "distill"]
            .iter()
            .any(|variant| name.contains(variant))
}

fn scan_checkpoints(project_root: &Path, keep: impl Fn(&str) -> bool) -> Vec<String> {
    let ckpt = project_root.join("checkpoints");
    let Ok(entries) = fs::read_dir(&ckpt) else {
        return Vec::new();
    };

    let names: BTreeSet<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| keep(name))
        .collect();

    let mut names: Vec<String> = names.into_iter().collect();
    names.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    names
}

fn with_known(mut found: Vec<String>, known: &[&str]) -> Vec<String> {
    for id in known {
        if !found.iter().any(|name| name == id) {
            found.push(id.to_string());
        }
    }
    found
}

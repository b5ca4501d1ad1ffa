//! Settings storage
//!
//! Manages persistence of user preferences and generation defaults.

use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::storage::layout::AppLayout;
use crate::storage::{ensure_dir, write_atomic};
use crate::types::request::Draft;
use crate::types::task::{AudioFormat, TaskType};

/// LM backends understood by ACE-Step.
pub const BACKENDS: [&str; 2] = ["vllm", "pt"];
/// Log levels passed through to ACE-Step.
pub const LOG_LEVELS: [&str; 5] = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"];
/// Time signatures (beats per bar); 0 = auto.
pub const TIME_SIGNATURES: [u32; 5] = [0, 2, 3, 4, 6];
/// Upper bound for a drawn random seed.
pub const MAX_RANDOM_SEED: i64 = 1_000_000;
/// LM sampling used when the stored value is zero or missing.
pub const DEFAULT_LM_TEMPERATURE: f64 = 0.85;
pub const DEFAULT_LM_TOP_P: f64 = 0.95;

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application root the paths below were derived from
    #[serde(alias = "framevision_root")]
    pub root: PathBuf,
    /// Python interpreter of the ACE-Step environment
    pub env_python: PathBuf,
    /// ACE-Step `cli.py`
    pub cli_py: PathBuf,
    /// ACE-Step checkout (working directory for runs)
    pub project_root: PathBuf,
    /// Where generated audio is written
    pub output_dir: PathBuf,

    /// LM backend: "vllm" or "pt"
    pub backend: String,
    /// DiT timestep shift (1.0 - 5.0), only honored by base models
    pub shift: f64,
    pub log_level: String,
    pub task_type: TaskType,
    pub audio_format: AudioFormat,
    /// Track length in seconds
    pub duration: f64,
    /// Tracks produced by one job (1 - 8)
    pub batch_size: u32,
    pub seed: i64,
    /// Draw a fresh seed for every run
    pub seed_random: bool,
    /// 0 = auto
    pub bpm: u32,
    /// 0 = auto
    pub timesignature: u32,
    /// Empty = auto
    pub keyscale: String,
    /// ISO 639-1 vocal language; empty = auto
    pub vocal_language: String,

    /// Use the 5Hz LM at all
    pub enable_lm: bool,
    /// LM "thinking" mode
    pub thinking: bool,
    pub parallel_thinking: bool,
    /// Let the LM rewrite caption, language and metas
    pub lm_enhance: bool,
    pub lm_temperature: f64,
    pub lm_top_p: f64,
    /// 0 = disabled
    pub lm_top_k: u32,
    /// Empty = let ACE use its default
    pub lm_negative_prompt: String,

    pub offload_to_cpu: bool,
    pub offload_dit_to_cpu: bool,
    pub use_flash_attention: bool,
    /// Run through the resident API server instead of one CLI process per job
    pub keep_in_vram: bool,
    pub api_host: String,
    pub api_port: u16,

    /// Empty = auto
    pub main_model_path: String,
    /// Empty = auto
    pub lm_model_path: String,

    /// 0.0 = auto
    pub guidance_scale: f64,
    /// Empty = auto
    pub infer_method: String,
    /// 0 = auto
    pub inference_steps: u32,

    /// Caption, lyrics and task inputs for the next run
    pub draft: Draft,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            env_python: PathBuf::new(),
            cli_py: PathBuf::new(),
            project_root: PathBuf::new(),
            output_dir: PathBuf::new(),
            backend: "vllm".to_string(),
            shift: 3.0,
            log_level: "INFO".to_string(),
            task_type: TaskType::Text2music,
            audio_format: AudioFormat::Mp3,
            duration: 180.0,
            batch_size: 1,
            seed: 0,
            seed_random: false,
            bpm: 0,
            timesignature: 0,
            keyscale: String::new(),
            vocal_language: String::new(),
            enable_lm: false,
            thinking: false,
            parallel_thinking: false,
            lm_enhance: false,
            lm_temperature: DEFAULT_LM_TEMPERATURE,
            lm_top_p: DEFAULT_LM_TOP_P,
            lm_top_k: 0,
            lm_negative_prompt: String::new(),
            offload_to_cpu: false,
            offload_dit_to_cpu: false,
            use_flash_attention: false,
            keep_in_vram: false,
            api_host: "127.0.0.1".to_string(),
            api_port: 8001,
            main_model_path: String::new(),
            lm_model_path: String::new(),
            guidance_scale: 0.0,
            infer_method: String::new(),
            inference_steps: 0,
            draft: Draft::default(),
        }
    }
}

impl Settings {
    /// Defaults with every path derived from `layout`.
    pub fn for_layout(layout: &AppLayout) -> Self {
        let mut settings = Self::default();
        settings.apply_layout(layout);
        settings
    }

    /// Reset the core paths to the layout's defaults.
    ///
    /// The output folder is kept unless it is empty or a legacy default.
    pub fn apply_layout(&mut self, layout: &AppLayout) {
        self.root = layout.root().to_path_buf();
        self.env_python = layout.default_env_python();
        self.project_root = layout.ace_project_root();
        self.cli_py = layout.ace_cli_py();
        self.migrate_output_dir(layout);
    }

    /// Fill only the paths that are still empty.
    pub fn fill_missing_paths(&mut self, layout: &AppLayout) {
        if is_blank(&self.root) {
            self.root = layout.root().to_path_buf();
        }
        if is_blank(&self.env_python) {
            self.env_python = layout.default_env_python();
        }
        if is_blank(&self.project_root) {
            self.project_root = layout.ace_project_root();
        }
        if is_blank(&self.cli_py) {
            self.cli_py = layout.ace_cli_py();
        }
        self.migrate_output_dir(layout);
    }

    fn migrate_output_dir(&mut self, layout: &AppLayout) {
        let is_legacy = layout
            .legacy_output_dirs()
            .iter()
            .any(|legacy| legacy == &self.output_dir);
        if is_blank(&self.output_dir) || is_legacy {
            self.output_dir = layout.default_output_dir();
        }
    }

    /// LM temperature passed to ACE-Step; zero means the default.
    pub fn effective_lm_temperature(&self) -> f64 {
        if self.lm_temperature > 0.0 {
            self.lm_temperature
        } else {
            DEFAULT_LM_TEMPERATURE
        }
    }

    /// LM top-p passed to ACE-Step; zero means the default.
    pub fn effective_lm_top_p(&self) -> f64 {
        if self.lm_top_p > 0.0 {
            self.lm_top_p
        } else {
            DEFAULT_LM_TOP_P
        }
    }

    /// Validate settings values
    ///
    /// Clamps numeric ranges and resets unknown enumerated values.
    pub fn validate(&mut self) {
        // Older builds stored -1 to mean "random".
        if self.seed < 0 {
            self.seed = 0;
            self.seed_random = true;
        }

        self.shift = self.shift.clamp(1.0, 5.0);
        self.duration = self.duration.clamp(10.0, 600.0);
        self.batch_size = self.batch_size.clamp(1, 8);
        self.bpm = self.bpm.min(300);
        self.lm_temperature = self.lm_temperature.clamp(0.0, 2.0);
        self.lm_top_p = self.lm_top_p.clamp(0.0, 1.0);
        self.guidance_scale = self.guidance_scale.clamp(0.0, 30.0);
        self.inference_steps = self.inference_steps.min(200);

        if !TIME_SIGNATURES.contains(&self.timesignature) {
            self.timesignature = 0;
        }

        if !BACKENDS.contains(&self.backend.as_str()) {
            self.backend = "vllm".to_string();
        }

        self.log_level = self.log_level.to_ascii_uppercase();
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            self.log_level = "INFO".to_string();
        }

        if self.api_host.trim().is_empty() {
            self.api_host = "127.0.0.1".to_string();
        }
        if self.api_port == 0 {
            self.api_port = 8001;
        }
    }

    /// Base URL of the keep-in-VRAM API server.
    pub fn api_base_url(&self) -> String {
        format!("http://{}:{}", self.api_host, self.api_port)
    }

    /// Set one field from its textual form (`settings set key value`).
    ///
    /// String and path fields take the raw text; everything else is parsed
    /// as JSON so booleans and numbers keep their types.
    pub fn set_field(&mut self, key: &str, raw: &str) -> Result<()> {
        let mut value = serde_json::to_value(&*self)?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| Error::Validation("settings are not an object".into()))?;

        let current = obj
            .get(key)
            .ok_or_else(|| Error::Validation(format!("unknown setting '{}'", key)))?;

        let parsed = match current {
            Value::String(_) => Value::String(raw.to_string()),
            _ => serde_json::from_str(raw).map_err(|e| {
                Error::Validation(format!("invalid value for '{}': {}", key, e))
            })?,
        };
        obj.insert(key.to_string(), parsed);

        let mut updated: Settings = serde_json::from_value(value)
            .map_err(|e| Error::Validation(format!("invalid value for '{}': {}", key, e)))?;
        updated.validate();
        *self = updated;
        Ok(())
    }

    /// Paths that must exist before a run, with a label for each missing one.
    pub fn missing_paths(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.env_python.exists() {
            missing.push("env python");
        }
        if !self.cli_py.exists() {
            missing.push("cli.py");
        }
        if !self.project_root.exists() {
            missing.push("project root");
        }
        missing
    }

    /// Draw a fresh seed if random seeds are enabled.
    pub fn prepare_seed(&mut self) {
        if self.seed_random {
            self.seed = rand::thread_rng().gen_range(0..=MAX_RANDOM_SEED);
        }
    }
}

fn is_blank(path: &Path) -> bool {
    path.as_os_str().is_empty()
}

#[derive(Debug, Serialize, Deserialize)]
struct SettingsPointer {
    settings_path: PathBuf,
}

/// Settings file recorded by the last save, if it still exists.
pub fn read_last_settings_path(layout: &AppLayout) -> Option<PathBuf> {
    let json = fs::read_to_string(layout.settings_pointer_path()).ok()?;
    let pointer: SettingsPointer = serde_json::from_str(&json).ok()?;
    if is_blank(&pointer.settings_path) || !pointer.settings_path.exists() {
        return None;
    }
    Some(pointer.settings_path)
}

fn write_last_settings_path(layout: &AppLayout, settings_path: &Path) -> Result<()> {
    let pointer = SettingsPointer {
        settings_path: settings_path.to_path_buf(),
    };
    let path = layout.settings_pointer_path();
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(&pointer)?)?;
    Ok(())
}

/// Load settings from disk
///
/// Returns layout defaults if the file doesn't exist or is corrupted
pub fn load_settings(layout: &AppLayout) -> Settings {
    match load_settings_internal(layout) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            Settings::for_layout(layout)
        }
    }
}

/// Internal settings loading with error propagation
fn load_settings_internal(layout: &AppLayout) -> Result<Settings> {
    let path = read_last_settings_path(layout).unwrap_or_else(|| layout.settings_path());

    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(Settings::for_layout(layout));
    }

    let json = fs::read_to_string(&path)?;
    let mut settings: Settings = serde_json::from_str(&json)?;

    settings.fill_missing_paths(layout);
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
///
/// The file goes under the settings' own root; the pointer is written under
/// `layout` so the next launch finds it even if detection changes.
pub fn save_settings(layout: &AppLayout, settings: &Settings) -> Result<PathBuf> {
    let target = if is_blank(&settings.root) {
        layout.clone()
    } else {
        AppLayout::new(&settings.root)
    };
    let path = target.settings_path();

    let json = serde_json::to_string_pretty(settings)?;
    write_atomic(&path, &json)?;
    write_last_settings_path(layout, &path)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(path)
}

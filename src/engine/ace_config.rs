//! ACE-Step run configuration
//!
//! Builds the flat TOML file `cli.py -c` reads. ACE-Step only needs
//! top-level scalar keys, so the emitter handles exactly that.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::storage::{ensure_dir, write_atomic};
use crate::system::models::shift_supported;
use crate::system::outputs::unique_path;
use crate::types::request::{GenerationRequest, INSTRUMENTAL_LYRICS};
use crate::types::task::{non_auto, normalize_infer_method, TaskType};

/// Prefix of generated config files; the rest of the stem is the timestamp.
pub const CONFIG_FILE_PREFIX: &str = "ace_step_run_";

/// A scalar TOML value
#[derive(Debug, Clone, PartialEq)]
pub enum TomlValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for TomlValue {
    fn from(value: &str) -> Self {
        TomlValue::Str(value.to_string())
    }
}

impl From<String> for TomlValue {
    fn from(value: String) -> Self {
        TomlValue::Str(value)
    }
}

impl From<bool> for TomlValue {
    fn from(value: bool) -> Self {
        TomlValue::Bool(value)
    }
}

impl From<i64> for TomlValue {
    fn from(value: i64) -> Self {
        TomlValue::Int(value)
    }
}

impl From<u32> for TomlValue {
    fn from(value: u32) -> Self {
        TomlValue::Int(value.into())
    }
}

impl From<f64> for TomlValue {
    fn from(value: f64) -> Self {
        TomlValue::Float(value)
    }
}

impl TomlValue {
    fn render(&self) -> String {
        match self {
            TomlValue::Str(s) => format!("\"{}\"", escape_str(s)),
            TomlValue::Int(i) => i.to_string(),
            TomlValue::Bool(b) => b.to_string(),
            TomlValue::Float(f) => format_float(*f),
        }
    }
}

/// Six decimals with trailing zeros removed; never scientific notation.
fn format_float(value: f64) -> String {
    let fixed = format!("{:.6}", value);
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// TOML basic strings cannot hold raw newlines.
fn escape_str(s: &str) -> String {
    s.replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Ordered flat key/value table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AceConfig {
    entries: Vec<(String, TomlValue)>,
}

impl AceConfig {
    /// Set `key`, replacing an earlier value but keeping its position.
    pub fn set(&mut self, key: &str, value: impl Into<TomlValue>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    /// Set `key` only when `value` is present.
    pub fn set_opt<V: Into<TomlValue>>(&mut self, key: &str, value: Option<V>) {
        if let Some(value) = value {
            self.set(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&TomlValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Render as TOML, one `key = value` line per entry.
    pub fn to_toml(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            let _ = writeln!(out, "{} = {}", key, value.render());
        }
        out
    }
}

fn absolute(path: &Path) -> PathBuf {
    path.canonicalize()
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Build the run configuration for `request`, saving audio into `out_dir`.
pub fn build_config(request: &GenerationRequest, out_dir: &Path) -> AceConfig {
    let s = request.settings();
    let draft = request.draft();
    let task = s.task_type;
    let main_model = s.main_model_path.trim();

    let mut cfg = AceConfig::default();
    cfg.set("project_root", path_text(&absolute(&s.project_root)));
    cfg.set("backend", s.backend.as_str());
    cfg.set("log_level", s.log_level.as_str());
    cfg.set("device", "auto");
    cfg.set_opt("shift", shift_supported(main_model).then_some(s.shift));
    cfg.set_opt("use_flash_attention", s.use_flash_attention.then_some(true));
    cfg.set("offload_to_cpu", s.offload_to_cpu);
    cfg.set("offload_dit_to_cpu", s.offload_dit_to_cpu);
    cfg.set("save_dir", path_text(&absolute(out_dir)));
    cfg.set("audio_format", s.audio_format.as_str());
    cfg.set("task_type", task.as_str());
    cfg.set("caption", draft.caption.trim());
    cfg.set("duration", s.duration);
    cfg.set("batch_size", s.batch_size);
    cfg.set("seed", s.seed);

    cfg.set_opt("vocal_language", non_auto(&s.vocal_language));
    cfg.set_opt("guidance_scale", (s.guidance_scale > 0.0).then_some(s.guidance_scale));
    cfg.set_opt("inference_steps", (s.inference_steps > 0).then_some(s.inference_steps));
    let infer_method = normalize_infer_method(&s.infer_method);
    cfg.set_opt("infer_method", (!infer_method.is_empty()).then_some(infer_method));

    cfg.set_opt("bpm", (s.bpm > 0).then_some(s.bpm));
    cfg.set_opt(
        "timesignature",
        (s.timesignature > 0).then(|| s.timesignature.to_string()),
    );
    cfg.set_opt("keyscale", non_auto(&s.keyscale));

    cfg.set("thinking", s.enable_lm && s.thinking);
    cfg.set_opt("parallel_thinking", (s.enable_lm && s.parallel_thinking).then_some(true));

    let negative = s.lm_negative_prompt.trim();
    cfg.set_opt("lm_negative_prompt", (!negative.is_empty()).then_some(negative));

    if s.enable_lm {
        // The LM may only rewrite caption and metas when asked to.
        cfg.set("use_cot_caption", s.lm_enhance);
        cfg.set("use_cot_language", s.lm_enhance);
        cfg.set("use_cot_metas", s.lm_enhance);
        cfg.set("lm_temperature", s.effective_lm_temperature());
        cfg.set("lm_top_p", s.effective_lm_top_p());
        cfg.set("lm_top_k", s.lm_top_k);
    }

    // ACE-Step builds disagree on which key selects the DiT.
    if !main_model.is_empty() {
        for key in ["main_model_path", "config_path", "main_model", "dit_model"] {
            cfg.set(key, main_model);
        }
    }
    let lm_model = s.lm_model_path.trim();
    if !lm_model.is_empty() {
        cfg.set("lm_model_path", lm_model);
        cfg.set("lm_model", lm_model);
    }

    if task.takes_lyrics() && draft.instrumental {
        cfg.set("instrumental", true);
        cfg.set("lyrics", INSTRUMENTAL_LYRICS);
        cfg.set("use_cot_lyrics", false);
    } else {
        cfg.set("instrumental", false);
        cfg.set("use_cot_lyrics", false);
        if task.takes_lyrics() {
            let lyrics = draft.lyrics.trim();
            cfg.set_opt("lyrics", (!lyrics.is_empty()).then_some(lyrics));
        }
    }

    if task.needs_source_audio() {
        let src = draft
            .src_audio
            .as_deref()
            .map(path_text)
            .unwrap_or_default();
        cfg.set("src_audio", src);
    }
    match task {
        TaskType::Repaint => {
            cfg.set("repainting_start", draft.repainting_start);
            cfg.set("repainting_end", draft.repainting_end);
        }
        TaskType::Lego => cfg.set("lego_track", draft.track.trim()),
        TaskType::Extract => cfg.set("extract_track", draft.track.trim()),
        TaskType::Complete => cfg.set("complete_tracks", draft.complete_tracks.trim()),
        TaskType::Text2music | TaskType::Cover => {}
    }

    cfg
}

/// Write `config` as `<out_dir>/ace_step_run_<stamp>.toml`.
pub fn write_config(out_dir: &Path, config: &AceConfig) -> Result<PathBuf> {
    ensure_dir(out_dir)?;
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = unique_path(out_dir.join(format!("{}{}.toml", CONFIG_FILE_PREFIX, stamp)));
    write_atomic(&path, &config.to_toml())?;
    tracing::info!("Saved config: {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fake_install;
    use crate::storage::settings::Settings;

    fn request(settings: Settings) -> GenerationRequest {
        GenerationRequest::new(settings).unwrap()
    }

    #[test]
    fn test_toml_rendering() {
        let mut cfg = AceConfig::default();
        cfg.set("name", "say \"hi\"\nC:\\x");
        cfg.set("steps", 8u32);
        cfg.set("scale", 7.5);
        cfg.set("whole", 3.0);
        cfg.set("zero", 0.0);
        cfg.set("flag", true);
        cfg.set_opt::<bool>("skipped", None);
        cfg.set("steps", 12u32);

        assert_eq!(
            cfg.to_toml(),
            "name = \"say \\\"hi\\\"\\nC:\\\\x\"\nsteps = 12\nscale = 7.5\nwhole = 3\nzero = 0\nflag = true\n"
        );
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(0.85), "0.85");
        assert_eq!(format_float(180.0), "180");
        assert_eq!(format_float(-2.5), "-2.5");
        assert_eq!(format_float(1e-7), "0");
    }

    #[test]
    fn test_text2music_defaults_leave_auto_keys_out() {
        let (_dir, mut settings) = fake_install();
        settings.draft.caption = "warm deep house".to_string();
        let cfg = build_config(&request(settings), Path::new("/tmp/out"));

        assert_eq!(cfg.get("device"), Some(&TomlValue::from("auto")));
        assert_eq!(cfg.get("thinking"), Some(&TomlValue::Bool(false)));
        assert_eq!(cfg.get("instrumental"), Some(&TomlValue::Bool(false)));
        for key in [
            "shift",
            "bpm",
            "keyscale",
            "timesignature",
            "infer_method",
            "main_model_path",
            "lyrics",
            "use_cot_caption",
            "src_audio",
            "use_flash_attention",
        ] {
            assert!(!cfg.contains(key), "{} should be omitted", key);
        }
    }

    #[test]
    fn test_model_aliases_and_shift() {
        let (_dir, mut settings) = fake_install();
        settings.draft.caption = "x".to_string();
        settings.main_model_path = "acestep-v15-base".to_string();
        settings.lm_model_path = "acestep-5Hz-lm-1.7B".to_string();
        settings.shift = 2.5;
        settings.timesignature = 3;
        settings.infer_method = "euler".to_string();
        let cfg = build_config(&request(settings), Path::new("/tmp/out"));

        for key in ["main_model_path", "config_path", "main_model", "dit_model"] {
            assert_eq!(cfg.get(key), Some(&TomlValue::from("acestep-v15-base")));
        }
        assert_eq!(cfg.get("lm_model"), Some(&TomlValue::from("acestep-5Hz-lm-1.7B")));
        assert_eq!(cfg.get("shift"), Some(&TomlValue::Float(2.5)));
        assert_eq!(cfg.get("timesignature"), Some(&TomlValue::from("3")));
        assert_eq!(cfg.get("infer_method"), Some(&TomlValue::from("ode")));
    }

    #[test]
    fn test_lm_keys_only_when_enabled() {
        let (_dir, mut settings) = fake_install();
        settings.draft.caption = "x".to_string();
        settings.thinking = true;
        settings.parallel_thinking = true;
        let cfg = build_config(&request(settings.clone()), Path::new("/tmp/out"));
        assert_eq!(cfg.get("thinking"), Some(&TomlValue::Bool(false)));
        assert!(!cfg.contains("parallel_thinking"));
        assert!(!cfg.contains("lm_temperature"));

        settings.enable_lm = true;
        settings.lm_enhance = true;
        let cfg = build_config(&request(settings), Path::new("/tmp/out"));
        assert_eq!(cfg.get("thinking"), Some(&TomlValue::Bool(true)));
        assert_eq!(cfg.get("parallel_thinking"), Some(&TomlValue::Bool(true)));
        assert_eq!(cfg.get("use_cot_metas"), Some(&TomlValue::Bool(true)));
        assert_eq!(cfg.get("lm_top_k"), Some(&TomlValue::Int(0)));
    }

    #[test]
    fn test_instrumental_and_task_keys() {
        let (dir, mut settings) = fake_install();
        let src = dir.path().join("song.wav");
        std::fs::write(&src, b"RIFF").unwrap();

        settings.task_type = TaskType::Repaint;
        settings.draft.caption = "fix the bridge".to_string();
        settings.draft.instrumental = true;
        settings.draft.src_audio = Some(src.clone());
        settings.draft.repainting_start = 10.0;
        settings.draft.repainting_end = 20.5;
        let cfg = build_config(&request(settings.clone()), Path::new("/tmp/out"));
        assert_eq!(cfg.get("lyrics"), Some(&TomlValue::from(INSTRUMENTAL_LYRICS)));
        assert_eq!(cfg.get("src_audio"), Some(&TomlValue::from(path_text(&src))));
        assert_eq!(cfg.get("repainting_end"), Some(&TomlValue::Float(20.5)));

        settings.task_type = TaskType::Extract;
        settings.draft.track = "vocals".to_string();
        let cfg = build_config(&request(settings), Path::new("/tmp/out"));
        assert_eq!(cfg.get("instrumental"), Some(&TomlValue::Bool(false)));
        assert!(!cfg.contains("lyrics"));
        assert_eq!(cfg.get("extract_track"), Some(&TomlValue::from("vocals")));
    }

    #[test]
    fn test_write_config_names_file_by_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AceConfig::default();
        cfg.set("caption", "x");

        let first = write_config(dir.path(), &cfg).unwrap();
        let second = write_config(dir.path(), &cfg).unwrap();
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(CONFIG_FILE_PREFIX) && name.ends_with(".toml"));
        assert_ne!(first, second);
        assert_eq!(std::fs::read_to_string(first).unwrap(), "caption = \"x\"\n");
    }
}

//! Preset manager
//!
//! Genre / subgenre presets persisted in `presetmanager.json`. A preset body
//! is a free-form JSON object; known keys are mapped onto [`Settings`] when a
//! preset is applied, unknown keys are preserved.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::storage::settings::{Settings, DEFAULT_LM_TEMPERATURE, DEFAULT_LM_TOP_P};
use crate::storage::write_atomic;
use crate::types::request::INSTRUMENTAL_LYRICS;
use crate::types::task::{non_auto, normalize_infer_method};

/// Body of a single preset
pub type PresetPayload = Map<String, Value>;

/// The whole preset document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetDocument {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub genres: BTreeMap<String, Genre>,
}

/// One genre and its subgenre presets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Genre {
    #[serde(default)]
    pub subgenres: BTreeMap<String, PresetPayload>,
}

fn default_version() -> u32 {
    1
}

/// A (genre, subgenre) pair for listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetKey {
    pub genre: String,
    pub subgenre: String,
}

impl std::fmt::Display for PresetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} / {}", self.genre, self.subgenre)
    }
}

impl PresetDocument {
    /// Starter presets written on first launch.
    pub fn starter() -> Self {
        let mut doc = Self {
            version: 1,
            genres: BTreeMap::new(),
        };
        let starters = [
            (
                "EDM",
                "Progressive House",
                "Uplifting progressive house anthem at 128 BPM with bright plucks, driving four-on-the-floor kick, rolling bass, and airy female vocal chops. Big build with risers into a euphoric drop. Clean club mix, wide stereo pads, punchy drums.",
                false,
                "lofi, jazz, acoustic, orchestral, ambient drone",
            ),
            (
                "EDM",
                "Deep House",
                "Warm deep house groove at 122 BPM with round sub-bass, shuffled hats, silky Rhodes chords, subtle vinyl texture, and a late-night underground vibe. Minimal vocals, tasteful reverb, tight mix.",
                false,
                "trap, dubstep, heavy distortion, screech leads",
            ),
            (
                "Rock",
                "Alt Rock",
                "Energetic alternative rock track with crunchy guitars, steady live drums, and a catchy hook. Modern mix, tight low end, wide choruses, slightly gritty male vocal.",
                true,
                "EDM, four-on-the-floor club kick, synthwave",
            ),
            (
                "Reggae",
                "Roots Reggae",
                "Classic roots reggae groove with offbeat guitar skank, warm organ bubble, steady one-drop drum feel, and deep melodic bass. Positive conscious vibe, sunny mix, relaxed tempo.",
                false,
                "metal, harsh screaming, aggressive distortion",
            ),
        ];

        for (genre, sub, caption, thinking, negatives) in starters {
            let payload = json!({
                "backend": "vllm",
                "device": "auto",
                "caption": caption,
                "timesignature": "4",
                "thinking": thinking,
                "use_cot_caption": thinking,
                "use_cot_language": thinking,
                "use_cot_metas": thinking,
                "main_model_path": "acestep-v15-base",
                "lm_model_path": "acestep-5Hz-lm-4B",
                "instrumental": false,
                "use_cot_lyrics": false,
                "lm_negative_prompt": negatives,
            });
            if let Value::Object(map) = payload {
                doc.insert(genre, sub, map);
            }
        }
        doc
    }

    /// Genre names, case-insensitively sorted.
    pub fn genres(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.genres.keys().map(String::as_str).collect();
        names.sort_by_key(|name| name.to_lowercase());
        names
    }

    /// Presets of one genre, or of every genre when `genre` is `None`.
    pub fn list(&self, genre: Option<&str>) -> Vec<PresetKey> {
        let mut keys: Vec<PresetKey> = self
            .genres
            .iter()
            .filter(|(name, _)| genre.map(|g| g == name.as_str()).unwrap_or(true))
            .flat_map(|(name, g)| {
                g.subgenres.keys().map(move |sub| PresetKey {
                    genre: name.clone(),
                    subgenre: sub.clone(),
                })
            })
            .collect();
        keys.sort_by_key(|k| (k.genre.to_lowercase(), k.subgenre.to_lowercase()));
        keys
    }

    pub fn get(&self, genre: &str, subgenre: &str) -> Option<&PresetPayload> {
        self.genres.get(genre)?.subgenres.get(subgenre)
    }

    /// Add or overwrite a preset.
    pub fn add(&mut self, genre: &str, subgenre: &str, payload: PresetPayload) -> Result<PresetKey> {
        let (genre, subgenre) = clean_names(genre, subgenre)?;
        self.insert(&genre, &subgenre, payload);
        Ok(PresetKey { genre, subgenre })
    }

    fn insert(&mut self, genre: &str, subgenre: &str, payload: PresetPayload) {
        self.genres
            .entry(genre.to_string())
            .or_default()
            .subgenres
            .insert(subgenre.to_string(), payload);
    }

    /// Remove a preset. Returns `true` when the genre was dropped as well,
    /// which only happens when it became empty and `drop_empty_genre` is set.
    pub fn remove(&mut self, genre: &str, subgenre: &str, drop_empty_genre: bool) -> Result<bool> {
        let entry = self
            .genres
            .get_mut(genre)
            .ok_or_else(|| Error::Preset(format!("genre '{}' not found", genre)))?;
        if entry.subgenres.remove(subgenre).is_none() {
            return Err(Error::Preset(format!(
                "preset '{} / {}' not found",
                genre, subgenre
            )));
        }
        if entry.subgenres.is_empty() && drop_empty_genre {
            self.genres.remove(genre);
            return Ok(true);
        }
        Ok(false)
    }

    /// Move a preset to a new (genre, subgenre) and optionally replace its
    /// body. A genre left empty by the move is removed.
    pub fn edit(
        &mut self,
        genre: &str,
        subgenre: &str,
        new_genre: &str,
        new_subgenre: &str,
        payload: Option<PresetPayload>,
    ) -> Result<PresetKey> {
        let (new_genre, new_subgenre) = clean_names(new_genre, new_subgenre)?;
        let old = self
            .get(genre, subgenre)
            .cloned()
            .ok_or_else(|| Error::Preset(format!("preset '{} / {}' not found", genre, subgenre)))?;

        self.remove(genre, subgenre, true)?;
        self.insert(&new_genre, &new_subgenre, payload.unwrap_or(old));
        Ok(PresetKey {
            genre: new_genre,
            subgenre: new_subgenre,
        })
    }
}

fn clean_names(genre: &str, subgenre: &str) -> Result<(String, String)> {
    let genre = genre.trim();
    let subgenre = subgenre.trim();
    if genre.is_empty() || subgenre.is_empty() {
        return Err(Error::Preset("genre and subgenre cannot be empty".into()));
    }
    Ok((genre.to_string(), subgenre.to_string()))
}

/// Parse a preset body from JSON text; it must be an object.
pub fn parse_payload(text: &str) -> Result<PresetPayload> {
    let text = text.trim();
    let value: Value = if text.is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_str(text)?
    };
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(Error::Preset("preset JSON must be an object".into())),
    }
}

/// Load the preset document, writing the starter set when the file is
/// missing or unreadable.
pub fn load_presets(path: &Path) -> PresetDocument {
    match load_presets_internal(path) {
        Ok(Some(doc)) => doc,
        Ok(None) => {
            tracing::info!("Preset file not found, writing starter presets");
            write_starter(path)
        }
        Err(e) => {
            tracing::warn!("Failed to load presets, using starter presets: {}", e);
            write_starter(path)
        }
    }
}

fn load_presets_internal(path: &Path) -> Result<Option<PresetDocument>> {
    if !path.exists() {
        return Ok(None);
    }
    let json = fs::read_to_string(path)?;
    let json = if json.trim().is_empty() { "{}" } else { json.as_str() };
    let doc: PresetDocument = serde_json::from_str(json)?;
    Ok(Some(doc))
}

fn write_starter(path: &Path) -> PresetDocument {
    let doc = PresetDocument::starter();
    if let Err(e) = save_presets(path, &doc) {
        tracing::warn!("Failed to write starter presets: {}", e);
    }
    doc
}

/// Save the preset document.
pub fn save_presets(path: &Path, doc: &PresetDocument) -> Result<()> {
    let json = serde_json::to_string_pretty(doc)?;
    write_atomic(path, &json)?;
    tracing::debug!("Saved presets to {}", path.display());
    Ok(())
}

/// Capture the musical part of `settings` as a preset body.
///
/// Duration, seed, batch size and output format are deliberately left out.
pub fn payload_from_settings(settings: &Settings) -> PresetPayload {
    let draft = &settings.draft;
    let infer_method = normalize_infer_method(&settings.infer_method);
    let enhance = settings.enable_lm && settings.lm_enhance;
    let time_sig = if settings.timesignature > 0 {
        json!(settings.timesignature)
    } else {
        json!("auto")
    };

    let mut payload = json!({
        "caption": draft.caption.trim(),
        "negatives": settings.lm_negative_prompt.trim(),
        "bpm": settings.bpm,
        "instrumental": draft.instrumental,
        "thinking": settings.thinking,
        "parallel_thinking": settings.parallel_thinking,
        "enable_lm": settings.enable_lm,
        "lm_enhance_prompt": settings.lm_enhance,
        "backend": settings.backend,
        "shift": settings.shift,
        "lm_temperature": settings.lm_temperature,
        "lm_top_p": settings.lm_top_p,
        "lm_top_k": settings.lm_top_k,
        "time_sig": time_sig,
        "key_scale": non_auto(&settings.keyscale).unwrap_or("auto"),
        "guidance": settings.guidance_scale,
        "infer_method": if infer_method.is_empty() { "auto" } else { infer_method.as_str() },
        "steps": settings.inference_steps,
        "main_model": settings.main_model_path,
        "lm_model": settings.lm_model_path,
        "lm_negative_prompt": settings.lm_negative_prompt.trim(),
        "timesignature": if settings.timesignature > 0 { settings.timesignature.to_string() } else { "auto".to_string() },
        "keyscale": non_auto(&settings.keyscale).unwrap_or("auto"),
        "vocal_language": non_auto(&settings.vocal_language).unwrap_or(""),
        "use_cot_caption": enhance,
        "use_cot_language": enhance,
        "use_cot_metas": enhance,
    });

    if let Value::Object(map) = &mut payload {
        if settings.guidance_scale > 0.0 {
            map.insert("guidance_scale".into(), json!(settings.guidance_scale));
        }
        if settings.inference_steps > 0 {
            map.insert("inference_steps".into(), json!(settings.inference_steps));
        }
        if !settings.main_model_path.is_empty() {
            map.insert("main_model_path".into(), json!(settings.main_model_path));
        }
        if !settings.lm_model_path.is_empty() {
            map.insert("lm_model_path".into(), json!(settings.lm_model_path));
        }
    }

    match payload {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Apply a preset body onto `settings` and remember the subgenre for naming.
///
/// Only keys present in the preset are touched; aliases written by older
/// builds are accepted.
pub fn apply_payload(settings: &mut Settings, subgenre: &str, preset: &PresetPayload) {
    if let Some(backend) = str_of(preset, "backend").and_then(non_auto_owned) {
        settings.backend = backend.to_lowercase();
    }
    if let Some(lang) = str_of(preset, "vocal_language") {
        settings.vocal_language = non_auto(&lang).unwrap_or("").to_string();
    }
    if let Some(v) = f64_of(preset, "shift") {
        settings.shift = if v > 0.0 { v } else { 3.0 };
    }
    if preset.contains_key("lm_temperature") {
        let v = f64_of(preset, "lm_temperature").unwrap_or(0.0);
        settings.lm_temperature = if v > 0.0 { v } else { DEFAULT_LM_TEMPERATURE };
    }
    if preset.contains_key("lm_top_p") {
        let v = f64_of(preset, "lm_top_p").unwrap_or(0.0);
        settings.lm_top_p = if v > 0.0 { v } else { DEFAULT_LM_TOP_P };
    }
    if let Some(v) = u64_of(preset, "lm_top_k") {
        settings.lm_top_k = v as u32;
    }
    if let Some(fmt) = str_of(preset, "audio_format").and_then(|s| s.parse().ok()) {
        settings.audio_format = fmt;
    }
    if let Some(task) = str_of(preset, "task_type").and_then(|s| s.parse().ok()) {
        settings.task_type = task;
    }

    if let Some(caption) = str_of(preset, "caption") {
        settings.draft.caption = caption;
    }
    if let Some(neg) = str_of(preset, "negatives").or_else(|| str_of(preset, "lm_negative_prompt")) {
        settings.lm_negative_prompt = neg;
    }
    if let Some(lyrics) = str_of(preset, "lyrics") {
        settings.draft.lyrics = if lyrics.trim() == INSTRUMENTAL_LYRICS {
            String::new()
        } else {
            lyrics
        };
    }

    if let Some(v) = f64_of(preset, "duration") {
        settings.duration = v;
    }
    if let Some(v) = u64_of(preset, "batch_size") {
        settings.batch_size = v.max(1) as u32;
    }
    if let Some(seed) = preset.get("seed").and_then(Value::as_i64) {
        settings.seed_random = bool_of(preset, "seed_random") || seed < 0;
        settings.seed = seed.max(0);
    }
    if let Some(v) = u64_of(preset, "bpm") {
        settings.bpm = v as u32;
    }

    let time_sig = preset
        .get("time_sig")
        .or_else(|| preset.get("timesignature"))
        .map(value_text)
        .unwrap_or_default();
    if let Ok(ts) = time_sig.trim().parse::<u32>() {
        if ts > 0 {
            settings.timesignature = ts;
        }
    }

    let key_scale = str_of(preset, "key_scale").or_else(|| str_of(preset, "keyscale"));
    if let Some(ks) = key_scale {
        settings.keyscale = non_auto(&ks).unwrap_or("").to_string();
    }

    // Older presets used "thinking" to mean "enable the LM".
    let enable_lm = preset
        .get("enable_lm")
        .filter(|v| !v.is_null())
        .or_else(|| preset.get("thinking"));
    settings.enable_lm = enable_lm.map(truthy).unwrap_or(false);
    let thinking = preset
        .get("thinking")
        .filter(|v| !v.is_null())
        .or_else(|| preset.get("enable_lm"));
    settings.thinking = thinking.map(truthy).unwrap_or(false);
    settings.parallel_thinking = preset
        .get("parallel_thinking")
        .or_else(|| preset.get("parallelthinking"))
        .map(truthy)
        .unwrap_or(false);
    settings.lm_enhance = preset
        .get("lm_enhance_prompt")
        .or_else(|| preset.get("use_cot_caption"))
        .map(truthy)
        .unwrap_or(false);
    settings.draft.instrumental = bool_of(preset, "instrumental");

    if let Some(v) = f64_of(preset, "guidance").or_else(|| f64_of(preset, "guidance_scale")) {
        settings.guidance_scale = v;
    }
    if let Some(v) = u64_of(preset, "steps").or_else(|| u64_of(preset, "inference_steps")) {
        settings.inference_steps = v as u32;
    }
    if let Some(im) = str_of(preset, "infer_method") {
        settings.infer_method = normalize_infer_method(&im);
    }

    let main = str_of(preset, "main_model")
        .filter(|s| !s.trim().is_empty())
        .or_else(|| str_of(preset, "main_model_path"));
    if let Some(main) = main.filter(|s| !s.trim().is_empty()) {
        settings.main_model_path = main.trim().to_string();
    }
    let lm = str_of(preset, "lm_model")
        .filter(|s| !s.trim().is_empty())
        .or_else(|| str_of(preset, "lm_model_path"));
    if let Some(lm) = lm.filter(|s| !s.trim().is_empty()) {
        settings.lm_model_path = lm.trim().to_string();
    }

    settings.draft.subgenre = subgenre.to_string();
    settings.validate();
}

fn str_of(preset: &PresetPayload, key: &str) -> Option<String> {
    preset.get(key).and_then(Value::as_str).map(str::to_string)
}

fn non_auto_owned(s: String) -> Option<String> {
    non_auto(&s).map(str::to_string)
}

fn f64_of(preset: &PresetPayload, key: &str) -> Option<f64> {
    match preset.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn u64_of(preset: &PresetPayload, key: &str) -> Option<u64> {
    match preset.get(key)? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Null => Some(0),
        _ => None,
    }
}

fn bool_of(preset: &PresetPayload, key: &str) -> bool {
    preset.get(key).map(truthy).unwrap_or(false)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Null => false,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

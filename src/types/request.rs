//! Generation requests
//!
//! The per-run text a user edits between generations, and a validated
//! snapshot of everything one job needs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::ensure_dir;
use crate::storage::settings::Settings;
use crate::types::task::TaskType;

/// Lyrics marker ACE-Step understands as "no vocals".
pub const INSTRUMENTAL_LYRICS: &str = "[Instrumental]";

const TITLE_MAX_CHARS: usize = 80;

/// Text and task inputs for the next generation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Draft {
    pub caption: String,
    pub lyrics: String,
    pub instrumental: bool,
    /// Subgenre of the last applied preset, used to name outputs
    pub subgenre: String,
    /// Source audio for cover / repaint / lego / extract / complete
    pub src_audio: Option<PathBuf>,
    pub repainting_start: f64,
    pub repainting_end: f64,
    /// Track name for lego / extract
    pub track: String,
    /// Track list for complete
    pub complete_tracks: String,
}

/// A settings snapshot that passed validation and has its seed fixed
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    settings: Settings,
}

impl GenerationRequest {
    /// Validate `settings` and draw the run's seed.
    pub fn new(mut settings: Settings) -> Result<Self> {
        settings.validate();
        validate(&settings)?;
        settings.prepare_seed();
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn draft(&self) -> &Draft {
        &self.settings.draft
    }

    /// Queue title: first caption line, else the preset subgenre, else "Job".
    pub fn title(&self) -> String {
        let draft = &self.settings.draft;
        let first_line = draft
            .caption
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty());
        let title = match first_line {
            Some(line) => line,
            None if !draft.subgenre.trim().is_empty() => draft.subgenre.trim(),
            None => "Job",
        };
        title.chars().take(TITLE_MAX_CHARS).collect()
    }

    /// Name fragment for output files: the preset subgenre, else a short
    /// printable first caption line, else "Custom".
    pub fn subgenre_for_naming(&self) -> String {
        let draft = &self.settings.draft;
        let sub = draft.subgenre.trim();
        if !sub.is_empty() {
            return sub.to_string();
        }
        if let Some(first) = draft.caption.trim().lines().next().map(str::trim) {
            let len = first.chars().count();
            if (2..=48).contains(&len) && first.chars().all(|c| !c.is_control()) {
                return first.to_string();
            }
        }
        "Custom".to_string()
    }
}

/// Check that a run with these settings can start.
pub fn validate(settings: &Settings) -> Result<()> {
    if !settings.env_python.exists() {
        return Err(Error::Validation(format!(
            "env python not found at {}; point it to the environment's python executable",
            settings.env_python.display()
        )));
    }
    if !settings.cli_py.exists() {
        return Err(Error::Validation(format!(
            "cli.py not found at {}",
            settings.cli_py.display()
        )));
    }
    if !settings.project_root.exists() {
        return Err(Error::Validation(format!(
            "project root not found at {}",
            settings.project_root.display()
        )));
    }
    ensure_dir(&settings.output_dir).map_err(|e| {
        Error::Validation(format!(
            "cannot create output folder {}: {}",
            settings.output_dir.display(),
            e
        ))
    })?;

    validate_task(settings)
}

/// Task-specific checks that do not touch the ACE-Step install.
pub fn validate_task(settings: &Settings) -> Result<()> {
    let task = settings.task_type;
    let draft = &settings.draft;

    if task.needs_base_model() && settings.main_model_path.to_ascii_lowercase().contains("turbo") {
        return Err(Error::Validation(format!(
            "task '{}' requires the base model; switch the main model to 'acestep-v15-base' (or auto)",
            task
        )));
    }

    let has_caption = !draft.caption.trim().is_empty();
    if task == TaskType::Text2music {
        if !has_caption && draft.lyrics.trim().is_empty() {
            return Err(Error::Validation(
                "text2music needs a caption or lyrics".into(),
            ));
        }
        return Ok(());
    }

    if task.needs_caption() && !has_caption {
        return Err(Error::Validation(format!(
            "task '{}' needs a caption",
            task
        )));
    }
    if task.needs_source_audio() {
        let exists = draft
            .src_audio
            .as_ref()
            .map(|p| p.exists())
            .unwrap_or(false);
        if !exists {
            return Err(Error::Validation(format!(
                "task '{}' needs an existing source audio file",
                task
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with(task: TaskType, caption: &str) -> Settings {
        let mut settings = Settings::default();
        settings.task_type = task;
        settings.draft.caption = caption.to_string();
        settings
    }

    #[test]
    fn test_text2music_needs_caption_or_lyrics() {
        let mut settings = settings_with(TaskType::Text2music, "");
        assert!(validate_task(&settings).is_err());

        settings.draft.lyrics = "[verse]\nla la".to_string();
        assert!(validate_task(&settings).is_ok());
    }

    #[test]
    fn test_cover_needs_source_audio() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_with(TaskType::Cover, "jazz cover");
        assert!(validate_task(&settings).is_err());

        let src = dir.path().join("in.wav");
        std::fs::write(&src, b"RIFF").unwrap();
        settings.draft.src_audio = Some(src);
        assert!(validate_task(&settings).is_ok());
    }

    #[test]
    fn test_extract_rejects_turbo() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.wav");
        std::fs::write(&src, b"RIFF").unwrap();

        let mut settings = settings_with(TaskType::Extract, "");
        settings.draft.src_audio = Some(src);
        settings.main_model_path = "acestep-v15-turbo".to_string();
        assert!(validate_task(&settings).is_err());

        settings.main_model_path = "acestep-v15-base".to_string();
        assert!(validate_task(&settings).is_ok());
    }

    #[test]
    fn test_missing_install_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_with(TaskType::Text2music, "ambient");
        settings.env_python = dir.path().join("missing-python");
        settings.output_dir = dir.path().join("out");

        let err = GenerationRequest::new(settings).unwrap_err();
        assert!(err.to_string().contains("env python"));
    }

    #[test]
    fn test_title_and_naming() {
        let mut settings = settings_with(TaskType::Text2music, "\n  Dreamy synthwave \nmore");
        let request = GenerationRequest { settings: settings.clone() };
        assert_eq!(request.title(), "Dreamy synthwave");
        assert_eq!(request.subgenre_for_naming(), "Dreamy synthwave");

        settings.draft.subgenre = "Deep House".to_string();
        settings.draft.caption = String::new();
        let request = GenerationRequest { settings };
        assert_eq!(request.title(), "Deep House");
        assert_eq!(request.subgenre_for_naming(), "Deep House");
    }

    #[test]
    fn test_blank_request_names() {
        let request = GenerationRequest {
            settings: settings_with(TaskType::Extract, "  "),
        };
        assert_eq!(request.title(), "Job");
        assert_eq!(request.subgenre_for_naming(), "Custom");
    }

    #[test]
    fn test_title_is_truncated() {
        let settings = settings_with(TaskType::Text2music, &"x".repeat(200));
        let request = GenerationRequest { settings };
        assert_eq!(request.title().chars().count(), 80);
    }
}

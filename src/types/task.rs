//! Task types
//!
//! ACE-Step task kinds, output formats and diffusion inference methods.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of generation ACE-Step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Text2music,
    Cover,
    Repaint,
    Lego,
    Extract,
    Complete,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::Text2music,
        TaskType::Cover,
        TaskType::Repaint,
        TaskType::Lego,
        TaskType::Extract,
        TaskType::Complete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Text2music => "text2music",
            TaskType::Cover => "cover",
            TaskType::Repaint => "repaint",
            TaskType::Lego => "lego",
            TaskType::Extract => "extract",
            TaskType::Complete => "complete",
        }
    }

    /// Tasks that transform an existing source audio file.
    pub fn needs_source_audio(self) -> bool {
        !matches!(self, TaskType::Text2music)
    }

    /// Tasks where a caption is mandatory.
    pub fn needs_caption(self) -> bool {
        matches!(
            self,
            TaskType::Cover | TaskType::Repaint | TaskType::Lego | TaskType::Complete
        )
    }

    /// Tasks that accept lyrics / instrumental settings.
    pub fn takes_lyrics(self) -> bool {
        !matches!(self, TaskType::Extract)
    }

    /// Tasks the turbo checkpoints cannot run.
    pub fn needs_base_model(self) -> bool {
        matches!(self, TaskType::Lego | TaskType::Extract)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        TaskType::ALL
            .into_iter()
            .find(|task| task.as_str() == wanted)
            .ok_or_else(|| format!("unknown task type '{}'", s))
    }
}

/// Audio container written by ACE-Step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Wav,
    Flac,
}

impl AudioFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
            AudioFormat::Flac => "flac",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp3" => Ok(AudioFormat::Mp3),
            "wav" => Ok(AudioFormat::Wav),
            "flac" => Ok(AudioFormat::Flac),
            other => Err(format!("unknown audio format '{}'", other)),
        }
    }
}

/// Deterministic ODE sampling.
pub const INFER_METHOD_ODE: &str = "ode";
/// Stochastic SDE sampling.
pub const INFER_METHOD_SDE: &str = "sde";

/// Map an inference method (including legacy sampler names) to what
/// ACE-Step 1.5 accepts. An empty result means "let ACE decide".
///
/// Old k-diffusion sampler names are not valid for 1.5 and produce broken
/// audio, so they collapse to `ode`.
pub fn normalize_infer_method(value: &str) -> String {
    let s = value.trim().to_ascii_lowercase();
    match s.as_str() {
        "" | "auto" => String::new(),
        "ode" | "euler" => INFER_METHOD_ODE.to_string(),
        "sde" | "dpmpp_sde" => INFER_METHOD_SDE.to_string(),
        "ddim" | "heun" | "dpmpp_2m" | "dpmpp" => INFER_METHOD_ODE.to_string(),
        _ => s,
    }
}

/// Treat "auto" (any case) and blank strings as unset.
pub fn non_auto(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_infer_method() {
        assert_eq!(normalize_infer_method(""), "");
        assert_eq!(normalize_infer_method(" Auto "), "");
        assert_eq!(normalize_infer_method("euler"), "ode");
        assert_eq!(normalize_infer_method("DPMPP_SDE"), "sde");
        assert_eq!(normalize_infer_method("heun"), "ode");
        assert_eq!(normalize_infer_method("custom"), "custom");
    }

    #[test]
    fn test_task_requirements() {
        assert!(!TaskType::Text2music.needs_source_audio());
        assert!(TaskType::Extract.needs_source_audio());
        assert!(!TaskType::Extract.needs_caption());
        assert!(TaskType::Lego.needs_base_model());
        assert!(!TaskType::Extract.takes_lyrics());
    }

    #[test]
    fn test_task_type_parse() {
        assert_eq!("Repaint".parse::<TaskType>(), Ok(TaskType::Repaint));
        assert!("remix".parse::<TaskType>().is_err());
        let json = serde_json::to_string(&TaskType::Text2music).unwrap();
        assert_eq!(json, "\"text2music\"");
    }

    #[test]
    fn test_non_auto() {
        assert_eq!(non_auto("AUTO"), None);
        assert_eq!(non_auto("  "), None);
        assert_eq!(non_auto(" C major "), Some("C major"));
    }
}

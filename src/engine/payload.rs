//! API task payload
//!
//! The JSON body `/release_task` takes in the keep-in-VRAM workflow. The
//! server does not understand "auto" for every field, so zero values are
//! replaced with its working defaults here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::types::request::{GenerationRequest, INSTRUMENTAL_LYRICS};
use crate::types::task::{normalize_infer_method, non_auto, INFER_METHOD_ODE};

const DEFAULT_VOCAL_LANGUAGE: &str = "en";
const DEFAULT_INFERENCE_STEPS: u32 = 8;
const DEFAULT_GUIDANCE_SCALE: f64 = 7.0;
const EMPTY_NEGATIVE_PROMPT: &str = "NO USER INPUT";

/// Body of a `/release_task` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub prompt: String,
    pub lyrics: String,
    pub thinking: bool,
    pub use_format: bool,
    pub model: Option<String>,
    pub bpm: Option<u32>,
    pub key_scale: String,
    pub time_signature: String,
    pub audio_duration: f64,
    pub vocal_language: String,
    pub inference_steps: u32,
    pub guidance_scale: f64,
    pub use_random_seed: bool,
    pub seed: i64,
    pub batch_size: u32,
    pub task_type: String,
    pub infer_method: String,
    pub shift: f64,
    pub audio_format: String,
    pub lm_model_path: Option<String>,
    pub lm_backend: String,
    pub lm_temperature: f64,
    pub lm_top_p: f64,
    pub lm_top_k: u32,
    pub lm_negative_prompt: String,
}

impl TaskPayload {
    pub fn from_request(request: &GenerationRequest) -> Self {
        let s = request.settings();
        let draft = request.draft();

        let lyrics = if draft.instrumental {
            INSTRUMENTAL_LYRICS.to_string()
        } else {
            draft.lyrics.trim().to_string()
        };
        let time_signature = if s.timesignature > 0 {
            s.timesignature.to_string()
        } else {
            String::new()
        };
        let infer_method = match normalize_infer_method(&s.infer_method) {
            m if m.is_empty() => INFER_METHOD_ODE.to_string(),
            m => m,
        };
        let negative = s.lm_negative_prompt.trim();

        Self {
            prompt: draft.caption.trim().to_string(),
            lyrics,
            thinking: s.thinking,
            use_format: false,
            model: non_empty(&s.main_model_path),
            bpm: (s.bpm > 0).then_some(s.bpm),
            key_scale: non_auto(&s.keyscale).unwrap_or_default().to_string(),
            time_signature,
            audio_duration: s.duration,
            vocal_language: non_auto(&s.vocal_language)
                .unwrap_or(DEFAULT_VOCAL_LANGUAGE)
                .to_string(),
            inference_steps: match s.inference_steps {
                0 => DEFAULT_INFERENCE_STEPS,
                n => n,
            },
            guidance_scale: if s.guidance_scale > 0.0 {
                s.guidance_scale
            } else {
                DEFAULT_GUIDANCE_SCALE
            },
            use_random_seed: s.seed_random,
            seed: s.seed,
            batch_size: s.batch_size,
            task_type: s.task_type.as_str().to_string(),
            infer_method,
            shift: s.shift,
            audio_format: s.audio_format.as_str().to_string(),
            lm_model_path: non_empty(&s.lm_model_path),
            lm_backend: s.backend.clone(),
            lm_temperature: s.effective_lm_temperature(),
            lm_top_p: s.effective_lm_top_p(),
            lm_top_k: s.lm_top_k,
            lm_negative_prompt: if negative.is_empty() {
                EMPTY_NEGATIVE_PROMPT.to_string()
            } else {
                negative.to_string()
            },
        }
    }

    /// JSON object stored in the queue file.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

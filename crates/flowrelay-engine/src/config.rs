use std::env;
use std::time::Duration;

use serde_json::{json, Value};

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-exp";
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const REQUEST_TIMEOUT_S_DEFAULT: u64 = 300;
const FILE_ACTIVE_POLLS_DEFAULT: u32 = 30;
const FILE_ACTIVE_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.8,
            top_k: 40,
            max_output_tokens: 2048,
        }
    }
}

impl GenerationConfig {
    pub fn to_value(&self) -> Value {
        json!({
            "temperature": self.temperature,
            "topP": self.top_p,
            "topK": self.top_k,
            "maxOutputTokens": self.max_output_tokens,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeminiConfig {
    pub model: String,
    pub api_base: String,
    pub upload_base: String,
    pub request_timeout: Duration,
    pub file_active_polls: u32,
    pub file_poll_interval: Duration,
    pub generation: GenerationConfig,
}

impl GeminiConfig {
    pub fn from_env(model: Option<&str>) -> Self {
        let api_base = non_empty_env("GEMINI_API_BASE")
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let upload_base = non_empty_env("GEMINI_UPLOAD_BASE")
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|| upload_base_for(&api_base));
        let request_timeout_s = env_u64("FLOWRELAY_REQUEST_TIMEOUT_S")
            .map(|value| value.clamp(15, 1800))
            .unwrap_or(REQUEST_TIMEOUT_S_DEFAULT);
        let file_active_polls = env_u64("FLOWRELAY_FILE_ACTIVE_POLLS")
            .map(|value| value.clamp(1, 300) as u32)
            .unwrap_or(FILE_ACTIVE_POLLS_DEFAULT);
        Self {
            model: model
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or(DEFAULT_MODEL)
                .to_string(),
            api_base,
            upload_base,
            request_timeout: Duration::from_secs(request_timeout_s),
            file_active_polls,
            file_poll_interval: Duration::from_millis(FILE_ACTIVE_POLL_INTERVAL_MS),
            generation: GenerationConfig::default(),
        }
    }
}

/// `https://host/v1beta` -> `https://host/upload/v1beta`.
pub fn upload_base_for(api_base: &str) -> String {
    if let Ok(mut url) = reqwest::Url::parse(api_base) {
        let path = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("/upload{path}"));
        return url.as_str().trim_end_matches('/').to_string();
    }
    format!("{}/upload", api_base.trim_end_matches('/'))
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    non_empty_env(key).and_then(|raw| raw.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{upload_base_for, GenerationConfig};

    #[test]
    fn upload_base_inserts_upload_segment() {
        assert_eq!(
            upload_base_for("https://generativelanguage.googleapis.com/v1beta"),
            "https://generativelanguage.googleapis.com/upload/v1beta"
        );
        assert_eq!(
            upload_base_for("http://127.0.0.1:9000/v1beta/"),
            "http://127.0.0.1:9000/upload/v1beta"
        );
    }

    #[test]
    fn generation_defaults_use_api_field_names() {
        assert_eq!(
            GenerationConfig::default().to_value(),
            json!({"temperature": 0.7, "topP": 0.8, "topK": 40, "maxOutputTokens": 2048})
        );
    }
}

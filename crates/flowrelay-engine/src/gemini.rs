use std::io::{BufRead, BufReader};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::{non_empty_env, GeminiConfig};
use crate::error::clip;
use crate::inference::{InferenceRequest, InferenceService};
use crate::media_cache::{RemoteHandle, UploadApi};

const STREAM_SEND_RETRIES: usize = 2;
const STREAM_RETRY_BACKOFF_S: f64 = 1.2;

/// Gemini `streamGenerateContent` plus the Files API used for attachments.
pub struct GeminiClient {
    config: GeminiConfig,
    api_key: Option<String>,
    http: HttpClient,
}

#[derive(Debug, Clone, PartialEq)]
struct RemoteFile {
    name: String,
    uri: String,
    mime_type: String,
    state: String,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig, api_key: Option<String>) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build Gemini HTTP client")?;
        Ok(Self {
            config,
            api_key,
            http,
        })
    }

    pub fn from_env(model: Option<&str>) -> Result<Self> {
        Self::new(GeminiConfig::from_env(model), Self::api_key_from_env())
    }

    pub fn api_key_from_env() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    fn require_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .context("GEMINI_API_KEY is not set")
    }

    fn stream_endpoint(&self) -> String {
        let trimmed = self.config.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:streamGenerateContent", self.config.api_base, model_path)
    }

    fn build_payload(&self, request: &InferenceRequest) -> Value {
        let mut parts = vec![json!({ "text": request.prompt })];
        if let Some(media) = request.media.as_ref() {
            parts.push(json!({
                "fileData": {
                    "mimeType": media.mime_type,
                    "fileUri": media.uri,
                }
            }));
        }
        json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": self.config.generation.to_value(),
        })
    }

    fn send_stream_request(&self, api_key: &str, payload: &Value) -> Result<HttpResponse> {
        let endpoint = self.stream_endpoint();
        for attempt in 0..=STREAM_SEND_RETRIES {
            let response = self
                .http
                .post(&endpoint)
                .query(&[("alt", "sse"), ("key", api_key)])
                .json(payload)
                .send();
            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    let retryable = raw.is_connect() || raw.is_timeout();
                    let err = anyhow::Error::new(raw)
                        .context(format!("Gemini request failed ({endpoint})"));
                    if !retryable || attempt >= STREAM_SEND_RETRIES {
                        return Err(err);
                    }
                    warn!(
                        attempt = attempt + 1,
                        max = STREAM_SEND_RETRIES,
                        "Gemini transport retry after transient request failure"
                    );
                    let delay_s = STREAM_RETRY_BACKOFF_S * (attempt as f64 + 1.0);
                    thread::sleep(Duration::from_secs_f64(delay_s));
                }
            }
        }
        bail!("Gemini request failed ({endpoint}): retries exhausted")
    }

    fn get_file(&self, name: &str) -> Result<RemoteFile> {
        let api_key = self.require_key()?;
        let response = self
            .http
            .get(format!("{}/{}", self.config.api_base, name.trim_start_matches('/')))
            .query(&[("key", api_key)])
            .send()
            .with_context(|| format!("Gemini file lookup failed ({name})"))?;
        let payload = json_body("Gemini file lookup", response)?;
        parse_remote_file(&payload)
    }

    fn start_upload(&self, api_key: &str, size: usize, mime_type: &str, display_name: &str) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/files", self.config.upload_base))
            .query(&[("key", api_key)])
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", size.to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&json!({ "file": { "display_name": display_name } }))
            .send()
            .context("Gemini upload start failed")?;
        let response = ensure_success("Gemini upload start", response)?;
        response
            .headers()
            .get("x-goog-upload-url")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .context("Gemini upload start returned no upload URL")
    }

    fn wait_until_active(&self, mut file: RemoteFile) -> Result<RemoteFile> {
        for _ in 0..self.config.file_active_polls {
            match file.state.as_str() {
                "PROCESSING" => {
                    debug!(file = %file.name, "waiting for uploaded file to become active");
                    thread::sleep(self.config.file_poll_interval);
                    file = self.get_file(&file.name)?;
                }
                "FAILED" => bail!("Gemini could not process uploaded file {}", file.name),
                _ => return Ok(file),
            }
        }
        if file.state == "PROCESSING" {
            bail!("uploaded file {} is still processing", file.name);
        }
        Ok(file)
    }
}

impl InferenceService for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn is_ready(&self) -> bool {
        self.api_key.is_some()
    }

    fn stream(&self, request: &InferenceRequest, on_chunk: &mut dyn FnMut(&str)) -> Result<()> {
        let api_key = self.require_key()?;
        let payload = self.build_payload(request);
        let response = self.send_stream_request(api_key, &payload)?;
        let response = ensure_success("Gemini request", response)?;
        read_sse_stream(BufReader::new(response), on_chunk)
    }
}

impl UploadApi for GeminiClient {
    fn upload(&self, bytes: &[u8], mime_type: &str, display_name: &str) -> Result<RemoteHandle> {
        let api_key = self.require_key()?;
        let upload_url = self.start_upload(api_key, bytes.len(), mime_type, display_name)?;
        let response = self
            .http
            .post(&upload_url)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .header(CONTENT_TYPE, mime_type)
            .body(bytes.to_vec())
            .send()
            .context("Gemini upload transfer failed")?;
        let payload = json_body("Gemini upload", response)?;
        let file = self.wait_until_active(parse_remote_file(&payload)?)?;
        info!(file = %file.name, mime_type = %file.mime_type, "Gemini file ready");
        Ok(RemoteHandle {
            name: file.name,
            uri: file.uri,
            mime_type: if file.mime_type.is_empty() {
                mime_type.to_string()
            } else {
                file.mime_type
            },
        })
    }

    fn resolve(&self, handle: &RemoteHandle) -> Result<()> {
        let file = self.get_file(&handle.name)?;
        if file.state == "FAILED" {
            bail!("remote file {} is in FAILED state", file.name);
        }
        Ok(())
    }
}

/// Reads `data:` lines of an SSE body and hands each text delta to `on_chunk`.
fn read_sse_stream<R: BufRead>(reader: R, on_chunk: &mut dyn FnMut(&str)) -> Result<()> {
    for line in reader.lines() {
        let line = line.context("Gemini stream read failed")?;
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        let payload: Value =
            serde_json::from_str(data).context("Gemini stream returned invalid JSON")?;
        if let Some(text) = extract_chunk_text(&payload)? {
            on_chunk(&text);
        }
    }
    Ok(())
}

fn extract_chunk_text(payload: &Value) -> Result<Option<String>> {
    if let Some(error) = payload.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown Gemini API error");
        bail!("Gemini stream error: {message}");
    }
    if let Some(reason) = payload
        .get("promptFeedback")
        .and_then(|feedback| feedback.get("blockReason"))
        .and_then(Value::as_str)
    {
        bail!("Gemini blocked the prompt ({reason})");
    }
    let parts = payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array);
    let Some(parts) = parts else {
        return Ok(None);
    };
    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        return Ok(None);
    }
    Ok(Some(text))
}

fn parse_remote_file(payload: &Value) -> Result<RemoteFile> {
    let file = payload.get("file").unwrap_or(payload);
    let field = |key: &str| {
        file.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let name = field("name");
    if name.is_empty() {
        bail!("Gemini file payload has no name");
    }
    Ok(RemoteFile {
        name,
        uri: field("uri"),
        mime_type: field("mimeType"),
        state: field("state"),
    })
}

/// Passes 2xx responses through; anything else becomes an error carrying the
/// status code and the start of the body.
fn ensure_success(what: &str, response: HttpResponse) -> Result<HttpResponse> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(anyhow!(
        "{what} failed with HTTP {}: {}",
        status.as_u16(),
        clip(body.trim(), 512)
    ))
}

fn json_body(what: &str, response: HttpResponse) -> Result<Value> {
    ensure_success(what, response)?
        .json::<Value>()
        .with_context(|| format!("{what} returned a body that is not JSON"))
}

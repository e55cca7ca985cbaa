use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::commands::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Image,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Image => "image",
        }
    }

    pub fn default_mime_type(self) -> &'static str {
        match self {
            Self::Audio => "audio/webm",
            Self::Image => "image/png",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "audio" => Some(Self::Audio),
            "image" => Some(Self::Image),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attachment as received: still in its base64 transport encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentPayload {
    pub encoded: String,
    pub kind: MediaKind,
    pub mime_type: Option<String>,
}

impl AttachmentPayload {
    pub fn mime_type(&self) -> &str {
        self.mime_type
            .as_deref()
            .unwrap_or_else(|| self.kind.default_mime_type())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditRequest {
    pub prompt: Option<String>,
    pub diagram_state: Value,
    pub attachment: Option<AttachmentPayload>,
}

impl EditRequest {
    pub fn text(prompt: impl Into<String>, diagram_state: Value) -> Self {
        Self {
            prompt: Some(prompt.into()),
            diagram_state,
            attachment: None,
        }
    }

    pub fn is_audio(&self) -> bool {
        self.attachment
            .as_ref()
            .map(|attachment| attachment.kind == MediaKind::Audio)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    StreamDiagramEdit(EditRequest),
    ClearHistory,
    Health,
}

/// Parses one `{"event": ..., "data": {...}}` frame from the client.
pub fn parse_inbound(raw: &str) -> Result<InboundMessage, String> {
    let parsed: Value =
        serde_json::from_str(raw).map_err(|err| format!("invalid JSON frame: {err}"))?;
    let Some(frame) = parsed.as_object() else {
        return Err("frame must be a JSON object".to_string());
    };
    let event = frame
        .get("event")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    let empty = Map::new();
    let data = frame
        .get("data")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    match event {
        "stream_diagram_edit" => parse_edit_request(data).map(InboundMessage::StreamDiagramEdit),
        "clear_history" => Ok(InboundMessage::ClearHistory),
        "health" => Ok(InboundMessage::Health),
        "" => Err("frame is missing `event`".to_string()),
        other => Err(format!("unknown event: {other}")),
    }
}

fn parse_edit_request(data: &Map<String, Value>) -> Result<EditRequest, String> {
    let prompt = data
        .get("prompt")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    let diagram_state = data
        .get("diagramState")
        .or_else(|| data.get("existingDiagram"))
        .cloned()
        .filter(|value| !value.is_null())
        .unwrap_or_else(|| json!({}));
    let attachment = parse_attachment(data)?;
    if prompt.is_none() && attachment.is_none() {
        return Err("stream_diagram_edit needs a prompt or an attachment".to_string());
    }
    Ok(EditRequest {
        prompt,
        diagram_state,
        attachment,
    })
}

fn parse_attachment(data: &Map<String, Value>) -> Result<Option<AttachmentPayload>, String> {
    if let Some(attachment) = data.get("attachment").filter(|value| !value.is_null()) {
        let Some(obj) = attachment.as_object() else {
            return Err("attachment must be an object".to_string());
        };
        let encoded = non_empty_str(obj.get("bytes").or_else(|| obj.get("data")))
            .ok_or_else(|| "attachment.bytes is required".to_string())?;
        let kind = obj
            .get("kind")
            .and_then(Value::as_str)
            .and_then(MediaKind::parse)
            .ok_or_else(|| "attachment.kind must be `audio` or `image`".to_string())?;
        return Ok(Some(AttachmentPayload {
            encoded,
            kind,
            mime_type: non_empty_str(obj.get("mimeType")),
        }));
    }

    // Voice takes precedence over the minimap snapshot when a client sends both.
    if let Some(encoded) = non_empty_str(data.get("audioData")) {
        return Ok(Some(AttachmentPayload {
            encoded,
            kind: MediaKind::Audio,
            mime_type: None,
        }));
    }
    if let Some(encoded) = non_empty_str(data.get("imageData")) {
        return Ok(Some(AttachmentPayload {
            encoded,
            kind: MediaKind::Image,
            mime_type: None,
        }));
    }
    Ok(None)
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub inference_configured: bool,
    pub cached_media: usize,
    pub history_length: usize,
}

/// Everything the relay sends back over the client channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Command(Command),
    Error { message: String },
    HistoryCleared { message: String },
    Health(HealthReport),
}

impl ClientEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Command(_) => "command",
            Self::Error { .. } => "error",
            Self::HistoryCleared { .. } => "history_cleared",
            Self::Health(_) => "health",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            Self::Command(command) => command.to_value(),
            Self::Error { message } | Self::HistoryCleared { message } => {
                json!({ "message": message })
            }
            Self::Health(report) => {
                let mut payload = serde_json::to_value(report).unwrap_or_else(|_| json!({}));
                if let Some(obj) = payload.as_object_mut() {
                    obj.insert("status".to_string(), json!("healthy"));
                }
                payload
            }
        }
    }

    pub fn to_frame(&self) -> Value {
        json!({
            "event": self.name(),
            "data": self.data(),
        })
    }

    /// True for events after which a session emits nothing further.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Command(command) => command.is_complete(),
            Self::Error { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::commands::Command;

    use super::{parse_inbound, ClientEvent, HealthReport, InboundMessage, MediaKind};

    #[test]
    fn parses_edit_with_attachment_object() {
        let raw = json!({
            "event": "stream_diagram_edit",
            "data": {
                "prompt": " add a cache ",
                "diagramState": {"nodes": [], "edges": []},
                "attachment": {"bytes": "aGVsbG8=", "kind": "image"}
            }
        })
        .to_string();
        let Ok(InboundMessage::StreamDiagramEdit(request)) = parse_inbound(&raw) else {
            panic!("expected edit request");
        };
        assert_eq!(request.prompt.as_deref(), Some("add a cache"));
        assert_eq!(request.diagram_state, json!({"nodes": [], "edges": []}));
        let attachment = request.attachment.unwrap_or_else(|| panic!("attachment"));
        assert_eq!(attachment.kind, MediaKind::Image);
        assert_eq!(attachment.mime_type(), "image/png");
    }

    #[test]
    fn legacy_fields_prefer_audio() {
        let raw = json!({
            "event": "stream_diagram_edit",
            "data": {
                "prompt": "",
                "existingDiagram": {"nodes": [1]},
                "imageData": "aW1n",
                "audioData": "YXVkaW8"
            }
        })
        .to_string();
        let Ok(InboundMessage::StreamDiagramEdit(request)) = parse_inbound(&raw) else {
            panic!("expected edit request");
        };
        assert!(request.prompt.is_none());
        assert!(request.is_audio());
        assert_eq!(request.diagram_state, json!({"nodes": [1]}));
        assert_eq!(
            request.attachment.map(|item| item.mime_type().to_string()),
            Some("audio/webm".to_string())
        );
    }

    #[test]
    fn edit_without_prompt_or_attachment_is_rejected() {
        let raw = json!({"event": "stream_diagram_edit", "data": {"prompt": "  "}}).to_string();
        assert!(parse_inbound(&raw).is_err());
    }

    #[test]
    fn control_events_and_unknown_events() {
        assert_eq!(
            parse_inbound(r#"{"event":"clear_history"}"#),
            Ok(InboundMessage::ClearHistory)
        );
        assert_eq!(
            parse_inbound(r#"{"event":"health","data":{}}"#),
            Ok(InboundMessage::Health)
        );
        assert_eq!(
            parse_inbound(r#"{"event":"dance"}"#),
            Err("unknown event: dance".to_string())
        );
        assert!(parse_inbound("not json").is_err());
    }

    #[test]
    fn frames_wrap_event_name_and_data() {
        let frame = ClientEvent::Command(Command::status("hi")).to_frame();
        assert_eq!(
            frame,
            json!({"event": "command", "data": {"type": "status", "data": {"message": "hi"}}})
        );
        let health = ClientEvent::Health(HealthReport {
            inference_configured: true,
            cached_media: 2,
            history_length: 3,
        })
        .to_frame();
        assert_eq!(health["data"]["status"], json!("healthy"));
        assert_eq!(health["data"]["cachedMedia"], json!(2));
        assert!(ClientEvent::error("boom").is_terminal());
        assert!(ClientEvent::Command(Command::complete("done")).is_terminal());
        assert!(!ClientEvent::Command(Command::status("busy")).is_terminal());
    }
}

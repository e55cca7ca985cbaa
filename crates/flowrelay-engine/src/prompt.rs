use flowrelay_contracts::commands::COMMAND_CATALOG;
use flowrelay_contracts::protocol::MediaKind;
use serde_json::Value;

const ROLE_TEXT: &str = "You are a diagram editing AI that responds with a series of commands to modify a ReactFlow diagram.";
const ROLE_AUDIO: &str = "Listen to this audio command and respond with a series of commands to modify a ReactFlow diagram.";
const FORMAT_RULE: &str = "You must respond ONLY with a series of JSON commands, one per line, no other text.";
const IMAGE_NOTE: &str = "The attached image is a snapshot of the current diagram; use it to judge layout and colors.";
const CLOSING: &str = "Respond with commands only, one JSON object per line:";

const GUIDELINES: &[&str] = &[
    "Start with a status message describing what you'll do",
    "Make changes step by step with status updates",
    "Use appropriate node types (input=start, output=end, process=action, decision=condition, etc.)",
    "Position new nodes logically (spread them out, avoid overlaps)",
    "Always end with a \"complete\" command",
    "Only modify what's requested, preserve other elements",
    "If the user asks to delete everything or clear the diagram, delete ALL nodes and edges",
];

pub struct PromptParts<'a> {
    pub context: &'a str,
    pub user_prompt: Option<&'a str>,
    pub diagram_state: &'a Value,
    pub media_kind: Option<MediaKind>,
}

pub fn build_prompt(parts: &PromptParts<'_>) -> String {
    let audio = parts.media_kind == Some(MediaKind::Audio);
    let diagram = serde_json::to_string(parts.diagram_state).unwrap_or_else(|_| "{}".to_string());

    let mut out = String::new();
    out.push_str(parts.context);
    out.push_str(if audio { ROLE_AUDIO } else { ROLE_TEXT });
    out.push('\n');
    out.push_str(FORMAT_RULE);
    out.push_str("\n\n");
    out.push_str(&format!("Current diagram: {diagram}\n\n"));
    if parts.media_kind == Some(MediaKind::Image) {
        out.push_str(IMAGE_NOTE);
        out.push_str("\n\n");
    }

    out.push_str("Available commands:\n");
    for (idx, spec) in COMMAND_CATALOG.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", idx + 1, spec.example));
    }
    out.push_str("\nGuidelines:\n");
    for line in GUIDELINES {
        out.push_str(&format!("- {line}\n"));
    }

    if let Some(request) = parts.user_prompt.filter(|value| !value.trim().is_empty()) {
        out.push_str(&format!("\nUser request: {}\n", request.trim()));
    }
    out.push('\n');
    out.push_str(CLOSING);
    out
}

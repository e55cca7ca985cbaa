const FENCE: &str = "```";

/// Trims a raw model line and peels an optional opening fence (bare or tagged
/// `json`, any case) and an optional closing fence.
pub fn normalize_line(line: &str) -> &str {
    let mut text = line.trim();
    if let Some(rest) = text.strip_prefix(FENCE) {
        text = strip_json_tag(rest).trim_start();
    }
    if let Some(rest) = text.strip_suffix(FENCE) {
        text = rest;
    }
    text.trim()
}

/// `{` ... `}` framing check applied before any JSON parsing.
pub fn has_object_envelope(text: &str) -> bool {
    text.starts_with('{') && text.ends_with('}')
}

fn strip_json_tag(text: &str) -> &str {
    match text.get(..4) {
        Some(tag) if tag.eq_ignore_ascii_case("json") => &text[4..],
        _ => text,
    }
}

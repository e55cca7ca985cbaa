mod normalize;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::commands::Command;

pub use normalize::{has_object_envelope, normalize_line};

/// Receives each command the decoder accepts, in source order.
pub trait CommandSink {
    fn emit(&mut self, command: Command);
}

impl<F: FnMut(Command)> CommandSink for F {
    fn emit(&mut self, command: Command) {
        self(command)
    }
}

/// Why a single line was dropped. Never fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("line is not a single JSON object: {0}")]
    MalformedEnvelope(String),
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("command object has no `type` field")]
    MissingType,
    #[error("`{kind}` command rejected: {reason}")]
    InvalidCommand { kind: String, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    pub lines: usize,
    pub forwarded: usize,
    pub skipped: usize,
    pub saw_complete: bool,
}

/// Decodes one normalized-or-raw line. `Ok(None)` means the line normalized
/// to nothing; `Err` is a skipped line worth a warning.
pub fn decode_line(line: &str) -> Result<Option<Command>, DecodeError> {
    let text = normalize_line(line);
    if text.is_empty() {
        return Ok(None);
    }
    if !has_object_envelope(text) {
        return Err(DecodeError::MalformedEnvelope(preview(text)));
    }
    let parsed: Value =
        serde_json::from_str(text).map_err(|err| DecodeError::InvalidJson(err.to_string()))?;
    let kind = match parsed.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(other) => other.to_string(),
        None => return Err(DecodeError::MissingType),
    };
    serde_json::from_value::<Command>(parsed)
        .map(Some)
        .map_err(|err| DecodeError::InvalidCommand {
            kind,
            reason: err.to_string(),
        })
}

/// Incremental line decoder for one streamed inference response.
///
/// Chunks are appended to a private buffer; every newline-terminated line is
/// decoded immediately and accepted commands go straight to the sink. The
/// unterminated tail waits for the next chunk or for [`StreamDecoder::finalize`].
pub struct StreamDecoder<S: CommandSink> {
    sink: S,
    buffer: String,
    session: String,
    stats: DecodeStats,
}

impl<S: CommandSink> StreamDecoder<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            buffer: String::new(),
            session: "-".to_string(),
            stats: DecodeStats::default(),
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = session.into();
        self
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }

    pub fn ingest(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.buffer.push_str(chunk);
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            self.process_line(&line[..newline]);
        }
    }

    /// Flushes the unterminated tail. Consumes the decoder so it runs once.
    pub fn finalize(mut self) -> DecodeStats {
        let tail = std::mem::take(&mut self.buffer);
        if !tail.trim().is_empty() {
            self.process_line(&tail);
        }
        debug!(
            session_id = %self.session,
            lines = self.stats.lines,
            forwarded = self.stats.forwarded,
            skipped = self.stats.skipped,
            "decoder finalized"
        );
        self.stats
    }

    fn process_line(&mut self, line: &str) {
        self.stats.lines += 1;
        match decode_line(line) {
            Ok(Some(command)) => {
                debug!(session_id = %self.session, kind = command.kind(), "forwarding command");
                self.stats.forwarded += 1;
                if command.is_complete() {
                    self.stats.saw_complete = true;
                }
                self.sink.emit(command);
            }
            Ok(None) => {}
            Err(err) => {
                self.stats.skipped += 1;
                warn!(session_id = %self.session, reason = %err, "skipping stream line");
            }
        }
    }
}

fn preview(text: &str) -> String {
    const MAX_CHARS: usize = 120;
    if text.chars().count() <= MAX_CHARS {
        return text.to_string();
    }
    text.chars().take(MAX_CHARS).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use crate::commands::{AddNodeData, Command, Extra, NodeType, Position};

    use super::{decode_line, DecodeError, DecodeStats, StreamDecoder};

    const TWO_LINES: &str = concat!(
        r#"{"type":"status","data":{"message":"hi"}}"#,
        "\n",
        r#"{"type":"add_node","data":{"id":"n1","nodeType":"process","position":{"x":0,"y":0},"label":"Start"}}"#,
        "\n",
    );

    fn decode_chunks(chunks: &[&str]) -> (Vec<Command>, DecodeStats) {
        let mut out: Vec<Command> = Vec::new();
        let mut decoder = StreamDecoder::new(|command: Command| out.push(command));
        for chunk in chunks {
            decoder.ingest(chunk);
        }
        let stats = decoder.finalize();
        (out, stats)
    }

    fn split_every(text: &str, step: usize) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        chars
            .chunks(step)
            .map(|piece| piece.iter().collect::<String>())
            .collect()
    }

    #[test]
    fn two_line_example_decodes_in_order() {
        let (commands, stats) = decode_chunks(&[TWO_LINES]);
        assert_eq!(
            commands,
            vec![
                Command::status("hi"),
                Command::AddNode(AddNodeData {
                    id: "n1".to_string(),
                    node_type: NodeType::Process,
                    position: Position { x: 0.0, y: 0.0 },
                    label: "Start".to_string(),
                    extra: Extra::new(),
                }),
            ]
        );
        assert_eq!(stats.skipped, 0);
        assert_eq!(stats.forwarded, 2);
        assert!(!stats.saw_complete);
    }

    #[test]
    fn chunk_boundaries_do_not_change_output() {
        let text = format!(
            "```json\n{TWO_LINES}{}\n\n{}```",
            r#"{"type":"add_edge","data":{"id":"e1","source":"n1","target":"n2","edgeType":"step"}}"#,
            r#"{"type":"complete","data":{"message":"done"}}"#,
        );
        let (whole, whole_stats) = decode_chunks(&[text.as_str()]);
        assert_eq!(whole.len(), 4);
        for step in [1, 2, 3, 7, 16, 61] {
            let pieces = split_every(&text, step);
            let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
            let (chunked, chunked_stats) = decode_chunks(&refs);
            assert_eq!(chunked, whole, "chunk size {step}");
            assert_eq!(chunked_stats, whole_stats, "chunk size {step}");
        }
    }

    #[test]
    fn fenced_line_matches_unfenced_line() -> anyhow::Result<()> {
        let line = r#"{"type":"delete_node","data":{"id":"n3"}}"#;
        let plain = decode_line(line)?;
        assert!(plain.is_some());
        assert_eq!(decode_line(&format!("```json{line}```"))?, plain);
        assert_eq!(decode_line(&format!("``` {line}"))?, plain);
        assert_eq!(decode_line(&format!("{line}```"))?, plain);
        Ok(())
    }

    #[test]
    fn missing_type_is_rejected() {
        assert_eq!(
            decode_line(r#"{"data":{"message":"hi"}}"#),
            Err(DecodeError::MissingType)
        );
        let (commands, stats) = decode_chunks(&["{\"data\":{}}\n"]);
        assert!(commands.is_empty());
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn malformed_line_does_not_block_following_lines() {
        let input = concat!(
            "{\"type\":\"status\",\"data\":{\"message\":\"one\"}\n",
            "Here are your commands:\n",
            "{\"type\": status}\n",
            "{\"type\":\"status\",\"data\":{\"message\":\"two\"}}\n",
        );
        let (commands, stats) = decode_chunks(&[input]);
        assert_eq!(commands, vec![Command::status("two")]);
        assert_eq!(stats.skipped, 3);
    }

    #[test]
    fn blank_lines_are_silent_but_commentary_is_skipped() {
        let (commands, stats) = decode_chunks(&["\n   \n```\n"]);
        assert!(commands.is_empty());
        assert_eq!(stats.skipped, 0);
        assert_eq!(stats.lines, 3);

        assert!(matches!(
            decode_line("# {\"type\":\"status\",\"data\":{\"message\":\"x\"}}"),
            Err(DecodeError::MalformedEnvelope(_))
        ));
        let (commands, stats) = decode_chunks(&["// thinking\n# step {}\n"]);
        assert!(commands.is_empty());
        assert_eq!(stats.skipped, 2);
    }

    #[test]
    fn forwarded_command_keeps_extra_fields_and_loose_type_case() -> anyhow::Result<()> {
        let line = r##"{"type":"add_node","data":{"id":"n1","nodeType":"Database","position":{"x":0,"y":0},"label":"DB","style":{"color":"#333"}}}"##;
        let Some(Command::AddNode(node)) = decode_line(line)? else {
            anyhow::bail!("expected add_node");
        };
        assert_eq!(node.node_type, NodeType::Database);
        assert_eq!(
            node.extra.get("style").and_then(|style| style.get("color")),
            Some(&serde_json::json!("#333"))
        );
        Ok(())
    }

    #[test]
    fn unknown_or_incomplete_commands_are_invalid() {
        assert!(matches!(
            decode_line(r#"{"type":"teleport","data":{"id":"x"}}"#),
            Err(DecodeError::InvalidCommand { kind, .. }) if kind == "teleport"
        ));
        assert!(matches!(
            decode_line(r#"{"type":"add_edge","data":{"id":"e1","source":"a"}}"#),
            Err(DecodeError::InvalidCommand { .. })
        ));
    }

    #[test]
    fn unterminated_tail_waits_for_finalize() {
        let mut out: Vec<Command> = Vec::new();
        let mut decoder = StreamDecoder::new(|command: Command| out.push(command));
        decoder.ingest(r#"{"type":"complete","data":{"message":"ok"}}"#);
        assert_eq!(decoder.stats().forwarded, 0);
        assert!(!decoder.pending().is_empty());
        let stats = decoder.finalize();
        assert_eq!(stats.forwarded, 1);
        assert!(stats.saw_complete);
        assert_eq!(out, vec![Command::complete("ok")]);
    }

    #[test]
    fn multibyte_text_split_across_chunks() {
        let line = "{\"type\":\"status\",\"data\":{\"message\":\"Größe → ✓\"}}\n";
        let pieces = split_every(line, 1);
        let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
        let (commands, _) = decode_chunks(&refs);
        assert_eq!(commands, vec![Command::status("Größe → ✓")]);
    }
}

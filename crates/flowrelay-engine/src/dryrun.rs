use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use flowrelay_contracts::commands::{
    AddEdgeData, AddNodeData, Command, EdgeType, Extra, NodeType, Position,
};
use sha2::{Digest, Sha256};

use crate::inference::{InferenceRequest, InferenceService};
use crate::media_cache::{RemoteHandle, UploadApi};

const MAX_STEPS: usize = 6;
const CHUNK_SIZES: [usize; 4] = [7, 13, 29, 3];
const VOICE_STEPS: [&str; 3] = ["Voice input", "Process", "Result"];

/// Offline inference: turns the request text into a small flow diagram and
/// streams it back in irregular chunks, fenced and with a stray prose line,
/// the way a real model answer tends to arrive.
#[derive(Debug, Default)]
pub struct DryrunInference;

impl DryrunInference {
    pub fn new() -> Self {
        Self
    }

    pub fn script(prompt: &str) -> String {
        let request = user_request(prompt);
        let steps = plan_steps(request.as_deref());
        let prefix = id_prefix(request.as_deref().unwrap_or("voice"));

        let mut commands = vec![Command::status(format!(
            "Building a {}-step flow",
            steps.len()
        ))];
        for (idx, label) in steps.iter().enumerate() {
            let node_type = if idx == 0 {
                NodeType::Input
            } else if idx + 1 == steps.len() {
                NodeType::Output
            } else {
                NodeType::Process
            };
            commands.push(Command::AddNode(AddNodeData {
                id: format!("{prefix}-{}", idx + 1),
                node_type,
                position: Position {
                    x: 250.0,
                    y: 100.0 + idx as f64 * 120.0,
                },
                label: label.clone(),
                extra: Extra::new(),
            }));
        }
        for idx in 1..steps.len() {
            commands.push(Command::AddEdge(AddEdgeData {
                id: format!("{prefix}-e{idx}"),
                source: format!("{prefix}-{idx}"),
                target: format!("{prefix}-{}", idx + 1),
                edge_type: EdgeType::Smoothstep,
                extra: Extra::new(),
            }));
        }
        commands.push(Command::complete("Dryrun diagram ready"));

        let mut out = String::from("```json\n");
        for command in &commands {
            if let Ok(line) = serde_json::to_string(command) {
                out.push_str(&line);
                out.push('\n');
            }
        }
        out.push_str("Here are the commands.\n```\n");
        out
    }
}

impl InferenceService for DryrunInference {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn stream(&self, request: &InferenceRequest, on_chunk: &mut dyn FnMut(&str)) -> Result<()> {
        let script = Self::script(&request.prompt);
        for chunk in chunk_on_char_boundaries(&script, &CHUNK_SIZES) {
            on_chunk(chunk);
        }
        Ok(())
    }
}

/// Upload store that never leaves the process.
#[derive(Debug, Default)]
pub struct DryrunUploads {
    counter: AtomicUsize,
}

impl DryrunUploads {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UploadApi for DryrunUploads {
    fn upload(&self, _bytes: &[u8], mime_type: &str, display_name: &str) -> Result<RemoteHandle> {
        let idx = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = format!("files/{display_name}-{idx}");
        Ok(RemoteHandle {
            uri: format!("dryrun://{name}"),
            name,
            mime_type: mime_type.to_string(),
        })
    }

    fn resolve(&self, _handle: &RemoteHandle) -> Result<()> {
        Ok(())
    }
}

fn user_request(prompt: &str) -> Option<String> {
    prompt
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix("User request:"))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn plan_steps(request: Option<&str>) -> Vec<String> {
    let Some(request) = request else {
        return VOICE_STEPS.iter().map(|step| step.to_string()).collect();
    };
    let normalized = request.replace("->", ",").replace(" then ", ",");
    let mut steps: Vec<String> = normalized
        .split(',')
        .map(str::trim)
        .filter(|step| !step.is_empty())
        .take(MAX_STEPS)
        .map(capitalize)
        .collect();
    match steps.len() {
        0 => VOICE_STEPS.iter().map(|step| step.to_string()).collect(),
        1 => {
            let only = steps.remove(0);
            vec!["Start".to_string(), only, "Done".to_string()]
        }
        _ => steps,
    }
}

fn capitalize(raw: &str) -> String {
    let mut chars = raw.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn id_prefix(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    format!("dry{}", hex::encode(&digest[..3]))
}

fn chunk_on_char_boundaries<'a>(text: &'a str, sizes: &[usize]) -> Vec<&'a str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut round = 0;
    while start < text.len() {
        let want = sizes.get(round % sizes.len().max(1)).copied().unwrap_or(16).max(1);
        let mut end = (start + want).min(text.len());
        while !text.is_char_boundary(end) {
            end += 1;
        }
        out.push(&text[start..end]);
        start = end;
        round += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use flowrelay_contracts::commands::{Command, NodeType};
    use flowrelay_contracts::decoder::StreamDecoder;

    use super::{chunk_on_char_boundaries, plan_steps, DryrunInference, DryrunUploads};
    use crate::inference::{InferenceRequest, InferenceService};
    use crate::media_cache::UploadApi;

    #[test]
    fn steps_split_on_separators() {
        assert_eq!(
            plan_steps(Some("login then verify token -> load dashboard")),
            vec!["Login", "Verify token", "Load dashboard"]
        );
        assert_eq!(plan_steps(Some("checkout")), vec!["Start", "Checkout", "Done"]);
        assert_eq!(plan_steps(None), vec!["Voice input", "Process", "Result"]);
        assert_eq!(plan_steps(Some("a,b,c,d,e,f,g,h")).len(), 6);
    }

    #[test]
    fn chunks_respect_multibyte_text() {
        let text = "ééééé→→→ok";
        let chunks = chunk_on_char_boundaries(text, &[3, 1]);
        assert_eq!(chunks.concat(), text);
        assert!(chunks.len() > 2);
    }

    #[test]
    fn streamed_script_decodes_to_a_connected_flow() -> anyhow::Result<()> {
        let mut commands: Vec<Command> = Vec::new();
        let mut decoder = StreamDecoder::new(|command: Command| commands.push(command));
        DryrunInference::new().stream(
            &InferenceRequest {
                prompt: "...\nUser request: fetch, transform, store\n".to_string(),
                media: None,
            },
            &mut |chunk| decoder.ingest(chunk),
        )?;
        let stats = decoder.finalize();

        assert!(stats.saw_complete);
        assert_eq!(stats.skipped, 1);
        let kinds: Vec<&str> = commands.iter().map(Command::kind).collect();
        assert_eq!(
            kinds,
            vec!["status", "add_node", "add_node", "add_node", "add_edge", "add_edge", "complete"]
        );
        match &commands[3] {
            Command::AddNode(node) => {
                assert_eq!(node.node_type, NodeType::Output);
                assert_eq!(node.label, "Store");
                assert_eq!(node.position.y, 340.0);
            }
            other => panic!("unexpected command {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn script_is_deterministic() {
        assert_eq!(
            DryrunInference::script("User request: a then b"),
            DryrunInference::script("User request: a then b")
        );
    }

    #[test]
    fn dryrun_uploads_hand_out_distinct_handles() -> anyhow::Result<()> {
        let uploads = DryrunUploads::new();
        let first = uploads.upload(b"x", "image/png", "image-abc")?;
        let second = uploads.upload(b"x", "image/png", "image-abc")?;
        assert_ne!(first.name, second.name);
        assert!(first.uri.starts_with("dryrun://files/"));
        uploads.resolve(&first)?;
        Ok(())
    }
}

pub mod attachment;
pub mod config;
pub mod dryrun;
pub mod error;
pub mod gemini;
pub mod inference;
pub mod media_cache;
pub mod prompt;

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use flowrelay_contracts::commands::Command;
use flowrelay_contracts::decoder::{DecodeStats, StreamDecoder};
use flowrelay_contracts::history::ContextManager;
use flowrelay_contracts::protocol::{ClientEvent, EditRequest, HealthReport};
use tracing::{error, info, warn};

pub use attachment::{decode_attachment, DecodedAttachment};
pub use config::{GeminiConfig, GenerationConfig, DEFAULT_MODEL};
pub use dryrun::{DryrunInference, DryrunUploads};
pub use error::RelayError;
pub use gemini::GeminiClient;
pub use inference::{InferenceRequest, InferenceService};
pub use media_cache::{ContentHash, MediaCacheEntry, MediaUploadCache, RemoteHandle, UploadApi};
pub use prompt::{build_prompt, PromptParts};

pub const COMPLETION_MESSAGE: &str = "All changes applied successfully!";
pub const HISTORY_CLEARED_MESSAGE: &str = "Conversation history cleared";

const STATUS_AUDIO: &str = "Processing voice command...";
const STATUS_TEXT: &str = "Analyzing your diagram...";
const PANIC_MESSAGE: &str = "internal error while processing request";

/// Shared state behind every client connection: one inference backend, one
/// upload cache and one conversation history for the whole process.
pub struct RelayEngine {
    inference: Arc<dyn InferenceService>,
    media: MediaUploadCache,
    history: ContextManager,
}

impl RelayEngine {
    pub fn new(inference: Arc<dyn InferenceService>, uploads: Arc<dyn UploadApi>) -> Self {
        Self {
            inference,
            media: MediaUploadCache::new(uploads),
            history: ContextManager::new(),
        }
    }

    pub fn dryrun() -> Self {
        Self::new(
            Arc::new(DryrunInference::new()),
            Arc::new(DryrunUploads::new()),
        )
    }

    pub fn gemini(client: GeminiClient) -> Self {
        let client = Arc::new(client);
        Self::new(client.clone(), client)
    }

    pub fn new_session_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn inference_name(&self) -> &str {
        self.inference.name()
    }

    pub fn history(&self) -> &ContextManager {
        &self.history
    }

    pub fn media(&self) -> &MediaUploadCache {
        &self.media
    }

    /// Runs one edit request to completion, emitting every client event in
    /// order. Failures are reported through `emit` as a final `error` event
    /// and also returned.
    pub fn run_edit(
        &self,
        session_id: &str,
        request: &EditRequest,
        mut emit: impl FnMut(ClientEvent),
    ) -> Result<DecodeStats, RelayError> {
        let result = self.try_run_edit(session_id, request, &mut emit);
        if let Err(err) = &result {
            warn!(session_id, kind = err.kind(), error = %err, "edit request failed");
            emit(ClientEvent::error(err.to_string()));
        }
        result
    }

    /// Runs [`RelayEngine::run_edit`] on its own thread so a slow model never
    /// blocks the connection that asked for it.
    pub fn spawn_edit<F>(
        self: &Arc<Self>,
        session_id: String,
        request: EditRequest,
        mut emit: F,
    ) -> io::Result<JoinHandle<()>>
    where
        F: FnMut(ClientEvent) + Send + 'static,
    {
        let engine = Arc::clone(self);
        let short: String = session_id.chars().take(8).collect();
        thread::Builder::new()
            .name(format!("flowrelay-edit-{short}"))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    engine.run_edit(&session_id, &request, &mut emit)
                }));
                if outcome.is_err() {
                    error!(session_id = %session_id, "edit worker panicked");
                    emit(ClientEvent::error(PANIC_MESSAGE));
                }
            })
    }

    pub fn clear_history(&self) -> ClientEvent {
        self.history.clear();
        let dropped = self.media.clear();
        info!(dropped_uploads = dropped, "conversation history cleared");
        ClientEvent::HistoryCleared {
            message: HISTORY_CLEARED_MESSAGE.to_string(),
        }
    }

    pub fn health(&self) -> ClientEvent {
        ClientEvent::Health(HealthReport {
            inference_configured: self.inference.is_ready(),
            cached_media: self.media.len(),
            history_length: self.history.len(),
        })
    }

    fn try_run_edit(
        &self,
        session_id: &str,
        request: &EditRequest,
        emit: &mut dyn FnMut(ClientEvent),
    ) -> Result<DecodeStats, RelayError> {
        if !self.inference.is_ready() {
            return Err(RelayError::NotConfigured);
        }
        let started = Instant::now();
        emit(ClientEvent::Command(Command::status(if request.is_audio() {
            STATUS_AUDIO
        } else {
            STATUS_TEXT
        })));

        let media = match request.attachment.as_ref() {
            Some(attachment) => {
                let decoded = decode_attachment(attachment)?;
                Some(
                    self.media
                        .get_or_upload(&decoded.bytes, attachment.kind, &decoded.mime_type)?,
                )
            }
            None => None,
        };

        let context = self.history.render_context();
        let prompt = build_prompt(&PromptParts {
            context: &context,
            user_prompt: request.prompt.as_deref(),
            diagram_state: &request.diagram_state,
            media_kind: request.attachment.as_ref().map(|attachment| attachment.kind),
        });
        let inference_request = InferenceRequest { prompt, media };

        // A streamed `complete` is held back so the session ends with exactly
        // one, after every other command and the history append.
        let mut full_text = String::new();
        let mut held_complete: Option<Command> = None;
        let mut decoder = StreamDecoder::new(|command: Command| {
            if command.is_complete() {
                held_complete = Some(command);
            } else {
                emit(ClientEvent::Command(command));
            }
        })
        .with_session(session_id);
        self.inference
            .stream(&inference_request, &mut |chunk: &str| {
                full_text.push_str(chunk);
                decoder.ingest(chunk);
            })
            .map_err(|err| RelayError::Service(error::flatten_error(&err, 512)))?;
        let stats = decoder.finalize();

        self.history.append(request.prompt.clone(), full_text.trim());

        let complete = held_complete.unwrap_or_else(|| Command::complete(COMPLETION_MESSAGE));
        emit(ClientEvent::Command(complete));
        info!(
            session_id,
            backend = self.inference.name(),
            forwarded = stats.forwarded,
            skipped = stats.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "edit request complete"
        );
        Ok(stats)
    }
}

use anyhow::Result;

use crate::media_cache::RemoteHandle;

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub prompt: String,
    pub media: Option<RemoteHandle>,
}

/// Generative backend that streams its answer as text pieces.
///
/// `on_chunk` is called once per piece in arrival order; returning `Err`
/// aborts the session.
pub trait InferenceService: Send + Sync {
    fn name(&self) -> &str;

    fn is_ready(&self) -> bool {
        true
    }

    fn stream(&self, request: &InferenceRequest, on_chunk: &mut dyn FnMut(&str)) -> Result<()>;
}

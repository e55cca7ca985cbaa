use thiserror::Error;

/// Request-level failures. `StaleHandle` is recovered inside the media cache;
/// the rest abort one session with an `error` event. Per-line decode problems
/// never reach this level (see `flowrelay_contracts::decoder::DecodeError`).
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("attachment upload failed: {0}")]
    Upload(String),
    #[error("cached upload {handle} no longer resolves: {reason}")]
    StaleHandle { handle: String, reason: String },
    #[error("unable to decode attachment data: {0}")]
    Encoding(String),
    #[error("inference request failed: {0}")]
    Service(String),
    #[error("inference service is not configured (set GEMINI_API_KEY or run with --dryrun)")]
    NotConfigured,
}

impl RelayError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Upload(_) => "upload",
            Self::StaleHandle { .. } => "stale_handle",
            Self::Encoding(_) => "encoding",
            Self::Service(_) => "service",
            Self::NotConfigured => "not_configured",
        }
    }
}

/// One-line rendering of an error and its sources, outermost first, with
/// repeated links collapsed. Used for text that ends up in client events.
pub(crate) fn flatten_error(err: &anyhow::Error, max_chars: usize) -> String {
    let mut links: Vec<String> = Vec::new();
    for link in err
        .chain()
        .map(|cause| cause.to_string().trim().to_string())
        .filter(|text| !text.is_empty())
    {
        if links.last() != Some(&link) {
            links.push(link);
        }
    }
    clip(&links.join(": "), max_chars)
}

pub(crate) fn clip(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &value[..cut]),
        None => value.to_string(),
    }
}

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flowrelay_contracts::protocol::AttachmentPayload;

use crate::error::RelayError;

/// Raw attachment bytes, decoded from the client's base64 transport form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAttachment {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

pub fn decode_attachment(payload: &AttachmentPayload) -> Result<DecodedAttachment, RelayError> {
    let (body, data_url_mime) = split_data_url(payload.encoded.trim());
    let cleaned: String = body.chars().filter(|ch| !ch.is_whitespace()).collect();
    if cleaned.is_empty() {
        return Err(RelayError::Encoding("attachment is empty".to_string()));
    }
    let padded = pad_base64(&cleaned);
    let bytes = BASE64
        .decode(padded.as_bytes())
        .map_err(|err| RelayError::Encoding(err.to_string()))?;
    let mime_type = payload
        .mime_type
        .clone()
        .or(data_url_mime)
        .unwrap_or_else(|| payload.kind.default_mime_type().to_string());
    Ok(DecodedAttachment { bytes, mime_type })
}

fn split_data_url(raw: &str) -> (&str, Option<String>) {
    let Some(rest) = raw.strip_prefix("data:") else {
        return (raw, None);
    };
    let Some((meta, body)) = rest.split_once(',') else {
        return (raw, None);
    };
    let mime = meta
        .split(';')
        .next()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    (body, mime)
}

// Browsers' MediaRecorder exports frequently drop trailing `=`.
fn pad_base64(raw: &str) -> String {
    let missing = raw.len() % 4;
    if missing == 0 {
        return raw.to_string();
    }
    let mut padded = raw.to_string();
    padded.push_str(&"=".repeat(4 - missing));
    padded
}

#[cfg(test)]
mod tests {
    use flowrelay_contracts::protocol::{AttachmentPayload, MediaKind};

    use super::decode_attachment;
    use crate::error::RelayError;

    fn payload(encoded: &str, kind: MediaKind) -> AttachmentPayload {
        AttachmentPayload {
            encoded: encoded.to_string(),
            kind,
            mime_type: None,
        }
    }

    #[test]
    fn decodes_padded_and_unpadded() -> anyhow::Result<()> {
        let padded = decode_attachment(&payload("aGVsbG8=", MediaKind::Audio))?;
        let unpadded = decode_attachment(&payload("aGVsbG8", MediaKind::Audio))?;
        assert_eq!(padded.bytes, b"hello");
        assert_eq!(unpadded, padded);
        assert_eq!(padded.mime_type, "audio/webm");
        Ok(())
    }

    #[test]
    fn data_url_prefix_supplies_mime() -> anyhow::Result<()> {
        let decoded = decode_attachment(&payload(
            "data:image/jpeg;base64,aGVsbG8=",
            MediaKind::Image,
        ))?;
        assert_eq!(decoded.bytes, b"hello");
        assert_eq!(decoded.mime_type, "image/jpeg");
        Ok(())
    }

    #[test]
    fn explicit_mime_wins() -> anyhow::Result<()> {
        let mut item = payload("aGk=", MediaKind::Audio);
        item.mime_type = Some("audio/wav".to_string());
        assert_eq!(decode_attachment(&item)?.mime_type, "audio/wav");
        Ok(())
    }

    #[test]
    fn garbage_is_an_encoding_error() {
        assert!(matches!(
            decode_attachment(&payload("!!!not base64!!!", MediaKind::Image)),
            Err(RelayError::Encoding(_))
        ));
        assert!(matches!(
            decode_attachment(&payload("   ", MediaKind::Image)),
            Err(RelayError::Encoding(_))
        ));
    }
}

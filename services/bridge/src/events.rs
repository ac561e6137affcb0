//! Codec for the telephony provider's media-stream event protocol.
//!
//! One JSON text message per event. Decoding is tolerant of protocol
//! extension: an unrecognized `event` value maps to [`StreamEvent::Unknown`]
//! instead of failing. Pure transforms, no side effects.

use base64::{Engine as _, engine::general_purpose};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed stream event: {0}")]
    MalformedEvent(String),
}

/// A decoded telephony event, consumed once.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start {
        stream_sid: Option<String>,
        tracks: Vec<String>,
    },
    /// Carries a base64-encoded audio payload.
    Media { payload: String },
    Stop,
    /// Acknowledgement of a marker previously written to the socket.
    Mark { name: String },
    Error {
        code: Option<String>,
        message: Option<String>,
    },
    Unknown(String),
}

#[derive(serde::Deserialize)]
struct RawEvent {
    event: String,
    #[serde(rename = "streamSid")]
    stream_sid: Option<String>,
    tracks: Option<Vec<String>>,
    media: Option<MediaBody>,
    mark: Option<MarkBody>,
    error: Option<ErrorBody>,
}

#[derive(serde::Deserialize)]
struct MediaBody {
    payload: String,
}

#[derive(serde::Deserialize)]
struct MarkBody {
    name: String,
}

#[derive(serde::Deserialize)]
struct ErrorBody {
    // Providers send numeric or string codes; both are kept as text.
    code: Option<serde_json::Value>,
    message: Option<String>,
}

/// Decodes one wire message into a [`StreamEvent`].
pub fn decode(raw: &str) -> Result<StreamEvent, CodecError> {
    let raw: RawEvent = serde_json::from_str(raw)
        .map_err(|e| CodecError::MalformedEvent(e.to_string()))?;
    let event = match raw.event.as_str() {
        "start" => StreamEvent::Start {
            stream_sid: raw.stream_sid,
            tracks: raw.tracks.unwrap_or_default(),
        },
        "media" => {
            let media = raw.media.ok_or_else(|| {
                CodecError::MalformedEvent("media event without media body".to_string())
            })?;
            StreamEvent::Media {
                payload: media.payload,
            }
        }
        "stop" => StreamEvent::Stop,
        "mark" => {
            let mark = raw.mark.ok_or_else(|| {
                CodecError::MalformedEvent("mark event without mark body".to_string())
            })?;
            StreamEvent::Mark { name: mark.name }
        }
        "error" => {
            let error = raw.error;
            StreamEvent::Error {
                code: error.as_ref().and_then(|e| e.code.as_ref()).map(|code| {
                    match code {
                        serde_json::Value::String(code) => code.clone(),
                        other => other.to_string(),
                    }
                }),
                message: error.and_then(|e| e.message),
            }
        }
        other => StreamEvent::Unknown(other.to_string()),
    };
    Ok(event)
}

/// Decodes the base64 audio payload of a `media` event into raw PCM bytes.
pub fn decode_media_payload(payload: &str) -> Result<Vec<u8>, CodecError> {
    general_purpose::STANDARD
        .decode(payload.as_bytes())
        .map_err(|e| CodecError::MalformedEvent(format!("invalid media payload: {e}")))
}

/// Produces a `media` wire message carrying the frame, base64-encoded.
pub fn encode_media(frame: &[u8]) -> String {
    serde_json::json!({
        "event": "media",
        "media": { "payload": general_purpose::STANDARD.encode(frame) },
    })
    .to_string()
}

/// Produces a `mark` wire message that the provider echoes back once all
/// preceding media has been played out.
pub fn encode_mark(name: &str) -> String {
    serde_json::json!({
        "event": "mark",
        "mark": { "name": name },
    })
    .to_string()
}

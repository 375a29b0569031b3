//! Built-in telemetry frame decoders.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use dslink_core::{
    config::DecoderKind,
    payload::TelemetryMessage,
    traits::{DecodeError, TelemetryDecoder},
};
use serde_json::{Value, json};

/// Header used by [`RawDecoder`].
pub const RAW_HEADER: &str = "RAW";

/// Relays each frame untouched, base64 encoded.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawDecoder;

impl TelemetryDecoder for RawDecoder {
    fn decode(&self, frame: &[u8]) -> Result<Vec<TelemetryMessage>, DecodeError> {
        if frame.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(vec![TelemetryMessage {
            header: RAW_HEADER.to_string(),
            data: json!({
                "len": frame.len(),
                "base64": BASE64.encode(frame),
            }),
        }])
    }
}

/// Accepts frames that are already `{header, data}` JSON, or arrays of them.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDecoder;

impl TelemetryDecoder for JsonDecoder {
    fn decode(&self, frame: &[u8]) -> Result<Vec<TelemetryMessage>, DecodeError> {
        if frame.is_empty() {
            return Err(DecodeError::Empty);
        }
        let value: Value =
            serde_json::from_slice(frame).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        match value {
            Value::Array(items) => items.into_iter().map(message_from_value).collect(),
            other => Ok(vec![message_from_value(other)?]),
        }
    }
}

fn message_from_value(value: Value) -> Result<TelemetryMessage, DecodeError> {
    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// Decoder for a configured kind.
#[must_use]
pub fn decoder_for(kind: DecoderKind) -> Arc<dyn TelemetryDecoder> {
    match kind {
        DecoderKind::Raw => Arc::new(RawDecoder),
        DecoderKind::Json => Arc::new(JsonDecoder),
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::assert_ok;

    use super::*;

    #[test]
    fn raw_wraps_frame() {
        let frame = [0xFE, 0x09, 0x00, 0x01];
        let messages = assert_ok!(RawDecoder.decode(&frame));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].header, "RAW");
        assert_eq!(messages[0].data["len"], 4);
        assert_eq!(
            BASE64
                .decode(messages[0].data["base64"].as_str().unwrap())
                .unwrap(),
            frame
        );
    }

    #[test]
    fn empty_frame_is_rejected() {
        assert!(matches!(RawDecoder.decode(&[]), Err(DecodeError::Empty)));
        assert!(matches!(JsonDecoder.decode(&[]), Err(DecodeError::Empty)));
    }

    #[test]
    fn json_single_and_batch() {
        let one = assert_ok!(JsonDecoder.decode(br#"{"header":"ATTITUDE","data":{"roll":0.1}}"#));
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].header, "ATTITUDE");

        let many = assert_ok!(JsonDecoder.decode(
            br#"[{"header":"HEARTBEAT","data":{}},{"header":"GPS_RAW_INT","data":{"fix_type":3}}]"#
        ));
        assert_eq!(many.len(), 2);
        assert_eq!(many[1].data["fix_type"], 3);
    }

    #[test]
    fn json_rejects_garbage() {
        assert!(matches!(
            JsonDecoder.decode(b"\xFE\x09"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            JsonDecoder.decode(br#"{"data":1}"#),
            Err(DecodeError::Malformed(_))
        ));
    }
}

// Wire codecs for hub datagrams
//
// Every datagram body is one serialized `Value` (always a list at the top
// level) followed by a `\r\n` terminator. MessagePack is the compact binary
// codec, JSON the textual one; the first byte of a frame tells them apart.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Trailing bytes appended to every frame.
pub const FRAME_TERMINATOR: &[u8] = b"\r\n";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("MessagePack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Unrecognized frame marker 0x{0:02x}")]
    UnknownMarker(u8),
}

/// Serializer used on one client channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// MessagePack (binary, compact)
    MsgPack,
    /// JSON (textual)
    Json,
}

impl Default for Codec {
    fn default() -> Self {
        Self::MsgPack
    }
}

impl Codec {
    pub fn name(&self) -> &'static str {
        match self {
            Codec::MsgPack => "msgpack",
            Codec::Json => "json",
        }
    }

    /// Identify the codec of a frame from its first byte.
    ///
    /// Top-level messages are always lists, so a JSON frame starts with `[`
    /// (possibly after whitespace) and a MessagePack frame with an array
    /// marker (fixarray, array16 or array32).
    pub fn detect(frame: &[u8]) -> Result<Self, CodecError> {
        let first = *frame
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .ok_or(CodecError::EmptyFrame)?;
        match first {
            b'[' => Ok(Codec::Json),
            0x90..=0x9f | 0xdc | 0xdd => Ok(Codec::MsgPack),
            other => Err(CodecError::UnknownMarker(other)),
        }
    }

    /// Serialize a message and append the frame terminator.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        let mut frame = match self {
            Codec::MsgPack => rmp_serde::to_vec(value)?,
            Codec::Json => serde_json::to_vec(value)?,
        };
        frame.extend_from_slice(FRAME_TERMINATOR);
        Ok(frame)
    }

    /// Decode a frame, tolerating a missing terminator.
    pub fn decode(&self, frame: &[u8]) -> Result<Value, CodecError> {
        let body = frame.strip_suffix(FRAME_TERMINATOR).unwrap_or(frame);
        if body.is_empty() {
            return Err(CodecError::EmptyFrame);
        }
        match self {
            Codec::MsgPack => Ok(rmp_serde::from_slice(body)?),
            Codec::Json => Ok(serde_json::from_slice(body)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple;

    #[test]
    fn test_detect_codec() {
        let msg = tuple!["GET_EVENTS"];
        let packed = Codec::MsgPack.encode(&msg).unwrap();
        let text = Codec::Json.encode(&msg).unwrap();
        assert_eq!(Codec::detect(&packed).unwrap(), Codec::MsgPack);
        assert_eq!(Codec::detect(&text).unwrap(), Codec::Json);
        assert!(matches!(
            Codec::detect(b"\x01abc"),
            Err(CodecError::UnknownMarker(0x01))
        ));
        assert!(matches!(Codec::detect(b""), Err(CodecError::EmptyFrame)));
    }

    #[test]
    fn test_frames_carry_terminator() {
        let frame = Codec::Json.encode(&tuple!["RPC", "getTime"]).unwrap();
        assert!(frame.ends_with(FRAME_TERMINATOR));
        let back = Codec::Json.decode(&frame).unwrap();
        assert_eq!(back, tuple!["RPC", "getTime"]);
    }

    #[test]
    fn test_nested_round_trip_both_codecs() {
        let mut kwargs = std::collections::BTreeMap::new();
        kwargs.insert("enabled".to_string(), Value::Bool(false));
        let msg = tuple![
            "RPC",
            "enableEventReporting",
            tuple!["mouse"],
            Value::Map(kwargs),
            -17i64,
            0.25f64
        ];
        for codec in [Codec::MsgPack, Codec::Json] {
            let frame = codec.encode(&msg).unwrap();
            assert_eq!(codec.decode(&frame).unwrap(), msg, "{}", codec.name());
        }
    }
}

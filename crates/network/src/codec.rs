//! Message encoding and decoding for network transport.
//!
//! # Wire Format
//!
//! ```text
//! [version: u8][payload: SBOR-encoded message]
//! ```
//!
//! - Version is currently `1`
//! - Payload is the SBOR encoding of [`RpcRequest`], [`RpcResponse`] or
//!   [`BroadcastMessage`]
//!
//! Block bytes inside the envelopes are NOT SBOR: they are the canonical
//! block form (header ∥ payload-length ∥ payload) that ids and signatures
//! are derived from.

use crate::adapter::{BroadcastMessage, RpcRequest, RpcResponse};
use thiserror::Error;

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("Message too short")]
    MessageTooShort,

    #[error("SBOR decode error: {0}")]
    SborDecode(String),

    #[error("SBOR encode error: {0}")]
    SborEncode(String),
}

fn encode<T: sbor::prelude::BasicEncode>(value: &T) -> Result<Vec<u8>, CodecError> {
    let payload =
        sbor::basic_encode(value).map_err(|e| CodecError::SborEncode(format!("{e:?}")))?;
    let mut bytes = Vec::with_capacity(1 + payload.len());
    bytes.push(WIRE_VERSION);
    bytes.extend(payload);
    Ok(bytes)
}

fn decode<T: sbor::prelude::BasicDecode>(data: &[u8]) -> Result<T, CodecError> {
    if data.is_empty() {
        return Err(CodecError::MessageTooShort);
    }
    let version = data[0];
    if version != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }
    sbor::basic_decode(&data[1..]).map_err(|e| CodecError::SborDecode(format!("{e:?}")))
}

pub fn encode_request(request: &RpcRequest) -> Result<Vec<u8>, CodecError> {
    encode(request)
}

pub fn decode_request(data: &[u8]) -> Result<RpcRequest, CodecError> {
    decode(data)
}

pub fn encode_response(response: &RpcResponse) -> Result<Vec<u8>, CodecError> {
    encode(response)
}

pub fn decode_response(data: &[u8]) -> Result<RpcResponse, CodecError> {
    decode(data)
}

pub fn encode_broadcast(message: &BroadcastMessage) -> Result<Vec<u8>, CodecError> {
    encode(message)
}

pub fn decode_broadcast(data: &[u8]) -> Result<BroadcastMessage, CodecError> {
    decode(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_messages::{GetHighestCommonBlockRequest, NodeInfoAnnouncement};
    use meridian_types::Hash;

    #[test]
    fn request_roundtrip() {
        let request = RpcRequest::GetHighestCommonBlock(GetHighestCommonBlockRequest {
            ids: vec![Hash::digest(b"a"), Hash::digest(b"b")],
        });
        let bytes = encode_request(&request).unwrap();
        assert_eq!(bytes[0], WIRE_VERSION);
        assert_eq!(decode_request(&bytes).unwrap(), request);
    }

    #[test]
    fn broadcast_roundtrip() {
        let message = BroadcastMessage::NodeInfo(NodeInfoAnnouncement {
            height: 7,
            max_height_prevoted: 5,
            last_block_id: Hash::digest(b"tip"),
            block_version: 2,
        });
        let bytes = encode_broadcast(&message).unwrap();
        assert_eq!(decode_broadcast(&bytes).unwrap(), message);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let bytes = vec![99, 1, 2, 3];
        assert!(matches!(
            decode_broadcast(&bytes),
            Err(CodecError::UnknownVersion(99))
        ));
    }

    #[test]
    fn empty_message_is_rejected() {
        assert!(matches!(
            decode_request(&[]),
            Err(CodecError::MessageTooShort)
        ));
    }

    #[test]
    fn garbage_payload_is_rejected() {
        let bytes = vec![WIRE_VERSION, 0xFF, 0xFF, 0xFF];
        assert!(matches!(
            decode_broadcast(&bytes),
            Err(CodecError::SborDecode(_))
        ));
    }
}

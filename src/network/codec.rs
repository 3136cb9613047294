//! Centralizes the bincode configuration so every peer frames messages the
//! same way.
//!
//! # Examples
//!
//! ```
//! use lockstep_resync::network::codec::{decode_message, encode_message};
//! use lockstep_resync::{MessageKind, SyncMessage};
//!
//! let bytes = encode_message(&SyncMessage::RequestSync).expect("encoding should succeed");
//! let decoded = decode_message(MessageKind::RequestSync, &bytes).expect("decoding should succeed");
//! assert_eq!(decoded, SyncMessage::RequestSync);
//!
//! // Announcing the wrong kind is a protocol violation.
//! assert!(decode_message(MessageKind::UnlockGame, &bytes).is_err());
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

use crate::error::ProtocolViolationKind;
use crate::network::messages::{MessageKind, SyncMessage};
use crate::SyncError;

// standard() with fixed-int encoding: integers always take their full width,
// which keeps message sizes independent of the values.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// What the codec was doing when an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding a sync message.
    EncodeMessage,
    /// Decoding a sync message.
    DecodeMessage,
    /// A generic encoding operation.
    Encode,
    /// A generic decoding operation.
    Decode,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeMessage => write!(f, "encoding sync message"),
            Self::DecodeMessage => write!(f, "decoding sync message"),
            Self::Encode => write!(f, "encoding"),
            Self::Decode => write!(f, "decoding"),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// Bincode's errors expose no structured failure reason, so the message is kept
/// as the formatted string.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The decoding operation failed.
    DecodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// Bytes were left over after decoding a complete message.
    TrailingBytes {
        /// Number of bytes not consumed.
        remaining: usize,
    },
}

impl CodecError {
    /// Creates a new encode error with the given message and operation.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error with the given message and operation.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
            Self::TrailingBytes { remaining } => {
                write!(f, "{remaining} trailing bytes after message")
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a new `Vec<u8>`.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::Encode))
}

/// Decodes a value from a byte slice.
///
/// Returns the decoded value and the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::Decode))
}

/// Encodes a sync message for the wire.
pub fn encode_message(message: &SyncMessage) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(message, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::EncodeMessage))
}

/// Decodes a sync message announced as `declared`.
///
/// # Errors
///
/// - [`SyncError::Codec`] if the bytes are not a complete, well-formed message.
/// - [`SyncError::ProtocolViolation`] if the decoded message is of a different
///   kind than announced.
pub fn decode_message(declared: MessageKind, bytes: &[u8]) -> Result<SyncMessage, SyncError> {
    let (message, read): (SyncMessage, usize) =
        bincode::serde::decode_from_slice(bytes, config())
            .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::DecodeMessage))?;
    if read != bytes.len() {
        return Err(CodecError::TrailingBytes {
            remaining: bytes.len() - read,
        }
        .into());
    }
    let decoded = message.kind();
    if decoded != declared {
        return Err(ProtocolViolationKind::KindMismatch { declared, decoded }.into());
    }
    Ok(message)
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::{Fingerprint, SyncId, Tick};

    fn broadcast() -> SyncMessage {
        SyncMessage::SyncCheckBroadcast {
            sync_id: SyncId::new(5),
            tick: Tick::new(100),
            fingerprint: Fingerprint::of_bytes(b"state").unwrap(),
            complete: false,
        }
    }

    #[test]
    fn test_message_round_trip() {
        let bytes = encode_message(&broadcast()).unwrap();
        let decoded = decode_message(MessageKind::SyncCheckBroadcast, &bytes).unwrap();
        assert_eq!(decoded, broadcast());
    }

    #[test]
    fn test_ack_with_evidence_round_trip() {
        let ack = SyncMessage::SyncCheckAck {
            sync_id: SyncId::new(2),
            agreed: false,
            evidence: Some(vec![1, 2, 3]),
        };
        let bytes = encode_message(&ack).unwrap();
        assert_eq!(
            decode_message(MessageKind::SyncCheckAck, &bytes).unwrap(),
            ack
        );
    }

    #[test]
    fn test_kind_mismatch_is_protocol_violation() {
        let bytes = encode_message(&SyncMessage::UnlockGame).unwrap();
        let err = decode_message(MessageKind::SyncData, &bytes).unwrap_err();
        assert_eq!(
            err,
            SyncError::ProtocolViolation {
                kind: ProtocolViolationKind::KindMismatch {
                    declared: MessageKind::SyncData,
                    decoded: MessageKind::UnlockGame,
                }
            }
        );
    }

    #[test]
    fn test_game_kind_never_decodes() {
        let bytes = encode_message(&SyncMessage::RequestSync).unwrap();
        assert!(decode_message(MessageKind::Game(1), &bytes).is_err());
    }

    #[test]
    fn test_truncated_payload_is_codec_error() {
        let bytes = encode_message(&broadcast()).unwrap();
        let err = decode_message(MessageKind::SyncCheckBroadcast, &bytes[..bytes.len() - 3])
            .unwrap_err();
        assert!(matches!(err, SyncError::Codec { .. }));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode_message(&SyncMessage::RequestSync).unwrap();
        bytes.push(0);
        let err = decode_message(MessageKind::RequestSync, &bytes).unwrap_err();
        assert_eq!(
            err,
            SyncError::Codec {
                source: CodecError::TrailingBytes { remaining: 1 }
            }
        );
    }

    #[test]
    fn test_encoding_is_deterministic() {
        assert_eq!(
            encode_message(&broadcast()).unwrap(),
            encode_message(&broadcast()).unwrap()
        );
    }

    #[test]
    fn test_fixed_int_encoding() {
        let bytes = encode(&7u32).unwrap();
        assert_eq!(bytes.len(), 4);
        let (value, read): (u32, _) = decode(&bytes).unwrap();
        assert_eq!((value, read), (7, 4));
    }

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::decode("oops", CodecOperation::DecodeMessage);
        assert!(err.to_string().contains("decoding sync message"));
        assert!(CodecError::TrailingBytes { remaining: 2 }
            .to_string()
            .contains("2 trailing"));
    }
}

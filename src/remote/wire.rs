//! Fixed control payloads and the framed object-transfer message.

use bytes::Bytes;
use crc32c::crc32c;
use thiserror::Error;

use crate::codec::{EncodedObject, WireError, decode_object, encode_object};
use crate::core::{InstanceId, Limits, ObjectId};

/// Bare handle triple on the wire: `(instance, object, tokens)`, LE.
pub const HANDLE_WIRE_LEN: usize = 24;

/// Decrement active-message payload: `(object, tokens)`, LE.
pub const DECREMENT_WIRE_LEN: usize = 16;

const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: max {max} got {got}")]
    FrameTooLarge { max: usize, got: usize },

    #[error("frame truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("frame crc mismatch: expected {expected:#010x} got {got:#010x}")]
    CrcMismatch { expected: u32, got: u32 },

    #[error("malformed control payload: {reason}")]
    Malformed { reason: String },
}

/// Fields of a handle as transferred between instances.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandleParts {
    pub instance: InstanceId,
    pub object: ObjectId,
    pub tokens: u64,
}

pub fn encode_handle(parts: &HandleParts) -> [u8; HANDLE_WIRE_LEN] {
    let mut buf = [0u8; HANDLE_WIRE_LEN];
    buf[0..8].copy_from_slice(&parts.instance.get().to_le_bytes());
    buf[8..16].copy_from_slice(&parts.object.get().to_le_bytes());
    buf[16..24].copy_from_slice(&parts.tokens.to_le_bytes());
    buf
}

pub fn decode_handle(bytes: &[u8]) -> Result<HandleParts, FrameError> {
    if bytes.len() != HANDLE_WIRE_LEN {
        return Err(FrameError::Malformed {
            reason: format!("handle payload is {} bytes, expected {HANDLE_WIRE_LEN}", bytes.len()),
        });
    }
    Ok(HandleParts {
        instance: InstanceId::new(u64::from_le_bytes(bytes[0..8].try_into().expect("len checked"))),
        object: ObjectId::new(u64::from_le_bytes(bytes[8..16].try_into().expect("len checked"))),
        tokens: u64::from_le_bytes(bytes[16..24].try_into().expect("len checked")),
    })
}

pub fn encode_decrement(object: ObjectId, tokens: u64) -> [u8; DECREMENT_WIRE_LEN] {
    let mut buf = [0u8; DECREMENT_WIRE_LEN];
    buf[0..8].copy_from_slice(&object.get().to_le_bytes());
    buf[8..16].copy_from_slice(&tokens.to_le_bytes());
    buf
}

pub fn decode_decrement(bytes: &[u8]) -> Result<(ObjectId, u64), FrameError> {
    if bytes.len() != DECREMENT_WIRE_LEN {
        return Err(FrameError::Malformed {
            reason: format!(
                "decrement payload is {} bytes, expected {DECREMENT_WIRE_LEN}",
                bytes.len()
            ),
        });
    }
    let object = ObjectId::new(u64::from_le_bytes(bytes[0..8].try_into().expect("len checked")));
    let tokens = u64::from_le_bytes(bytes[8..16].try_into().expect("len checked"));
    Ok((object, tokens))
}

/// Frame a handle plus the object layout for a tagged send:
/// `[len u32][crc32c u32][handle 24B][object cbor]`.
pub fn encode_transfer(
    parts: &HandleParts,
    object: &EncodedObject,
    max_frame_bytes: usize,
) -> Result<Bytes, TransferError> {
    let object_bytes = encode_object(object)?;
    let body_len = HANDLE_WIRE_LEN + object_bytes.len();
    if body_len > max_frame_bytes {
        return Err(FrameError::FrameTooLarge {
            max: max_frame_bytes,
            got: body_len,
        }
        .into());
    }

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body_len);
    buf.extend_from_slice(&(body_len as u32).to_le_bytes());
    let mut body = Vec::with_capacity(body_len);
    body.extend_from_slice(&encode_handle(parts));
    body.extend_from_slice(&object_bytes);
    buf.extend_from_slice(&crc32c(&body).to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(Bytes::from(buf))
}

pub fn decode_transfer(
    bytes: &[u8],
    limits: &Limits,
) -> Result<(HandleParts, EncodedObject), TransferError> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(FrameError::Truncated {
            need: FRAME_HEADER_LEN,
            got: bytes.len(),
        }
        .into());
    }
    let body_len = u32::from_le_bytes(bytes[0..4].try_into().expect("len checked")) as usize;
    if body_len > limits.max_frame_bytes {
        return Err(FrameError::FrameTooLarge {
            max: limits.max_frame_bytes,
            got: body_len,
        }
        .into());
    }
    let expected_crc = u32::from_le_bytes(bytes[4..8].try_into().expect("len checked"));
    let body = &bytes[FRAME_HEADER_LEN..];
    if body.len() != body_len {
        return Err(FrameError::Truncated {
            need: body_len,
            got: body.len(),
        }
        .into());
    }
    let actual_crc = crc32c(body);
    if actual_crc != expected_crc {
        return Err(FrameError::CrcMismatch {
            expected: expected_crc,
            got: actual_crc,
        }
        .into());
    }
    if body.len() < HANDLE_WIRE_LEN {
        return Err(FrameError::Truncated {
            need: HANDLE_WIRE_LEN,
            got: body.len(),
        }
        .into());
    }

    let parts = decode_handle(&body[..HANDLE_WIRE_LEN])?;
    let object = decode_object(&body[HANDLE_WIRE_LEN..], limits)?;
    Ok((parts, object))
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{EncodingOptions, encode};
    use crate::memory::BlockProvider;
    use crate::test_harness::LoopbackFabric;

    #[test]
    fn handle_and_decrement_payloads_are_fixed_size() {
        let parts = HandleParts {
            instance: InstanceId::new(11),
            object: ObjectId::new(22),
            tokens: 3,
        };
        let encoded = encode_handle(&parts);
        assert_eq!(encoded.len(), 24);
        assert_eq!(decode_handle(&encoded).unwrap(), parts);

        let payload = encode_decrement(ObjectId::new(5), 2);
        assert_eq!(payload.len(), 16);
        assert_eq!(decode_decrement(&payload).unwrap(), (ObjectId::new(5), 2));

        assert!(decode_decrement(&payload[..12]).is_err());
    }

    #[test]
    fn transfer_round_trips_and_detects_corruption() {
        let provider = BlockProvider::new(LoopbackFabric::new().create_worker());
        let object = encode(
            &(7u32, "hello".to_string()),
            InstanceId::new(1),
            &provider,
            EncodingOptions::default(),
        )
        .unwrap();
        let parts = HandleParts {
            instance: InstanceId::new(1),
            object: ObjectId::new(1),
            tokens: 1,
        };
        let limits = Limits::default();

        let frame = encode_transfer(&parts, &object, limits.max_frame_bytes).unwrap();
        let (decoded_parts, decoded_object) = decode_transfer(&frame, &limits).unwrap();
        assert_eq!(decoded_parts, parts);
        assert_eq!(decoded_object.descriptors(), object.descriptors());

        let mut corrupted = frame.to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;
        let err = decode_transfer(&corrupted, &limits).unwrap_err();
        assert!(matches!(err, TransferError::Frame(FrameError::CrcMismatch { .. })));
    }
}

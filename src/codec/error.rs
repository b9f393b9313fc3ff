//! Codec error taxonomy.

use thiserror::Error;

use crate::core::TypeFingerprint;
use crate::data_plane::DataPlaneError;
use crate::memory::MemoryError;

use super::wire::WireError;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("no protocol usable for this encoding (expected {expected})")]
    UnknownType { expected: &'static str },

    #[error("type fingerprint mismatch at context {context}: expected {expected}, got {got}")]
    TypeMismatch {
        context: u32,
        expected: TypeFingerprint,
        got: TypeFingerprint,
    },

    #[error("unbalanced encode contexts: {depth} left open at top-level return")]
    UnbalancedContext { depth: usize },

    #[error("descriptor cursor out of range: read {at} of {len}")]
    ShortRead { at: usize, len: usize },

    #[error("destination too small: need {need} bytes, have {have}")]
    ShortWrite { need: usize, have: usize },

    #[error("no context for nested value: cursor {at}, contexts {len}")]
    MissingContext { at: usize, len: usize },

    #[error("unexpected {found} descriptor at index {at}, expected {expected}")]
    UnexpectedDescriptor {
        at: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("scalar payload width mismatch: expected {expected} bytes, got {got}")]
    ScalarWidth { expected: usize, got: usize },

    #[error("string payload is not valid utf-8")]
    InvalidUtf8,

    #[error("remote descriptor references a region this object does not bind")]
    UnknownRegion,

    #[error("encoded object invariant violated: {reason}")]
    InvalidObject { reason: String },

    #[error("meta encode: {0}")]
    MetaEncode(String),

    #[error("meta decode: {0}")]
    Meta(#[from] minicbor::decode::Error),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Fabric(#[from] DataPlaneError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

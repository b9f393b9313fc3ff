//! Decode limits enforced on wire payloads.

use serde::{Deserialize, Serialize};

/// Upper bounds applied while decoding untrusted wire payloads.
///
/// Every hand-written decoder threads these through so a malformed or
/// hostile peer cannot force unbounded allocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Maximum descriptors in a single encoded object.
    pub max_descriptors: usize,
    /// Maximum contexts in a single encoded object.
    pub max_contexts: usize,
    /// Maximum arena bytes carried inline in an encoded object.
    pub max_arena_bytes: usize,
    /// Maximum framed transfer message size.
    pub max_frame_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_descriptors: 64 * 1024,
            max_contexts: 16 * 1024,
            max_arena_bytes: 64 * 1024 * 1024,
            max_frame_bytes: 128 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_non_zero() {
        let limits = Limits::default();
        assert!(limits.max_descriptors > 0);
        assert!(limits.max_contexts > 0);
        assert!(limits.max_arena_bytes > 0);
        assert!(limits.max_frame_bytes > 0);
    }
}

//! Shared-ownership memory blocks and views.

use bytes::{Bytes, BytesMut};

use crate::core::MemoryKind;

/// A refcounted block of memory with a kind.
///
/// Shared ownership is what makes the producer-keep-alive contract safe:
/// an encoded object that refers to a block pins it through a clone, so
/// registered ranges stay valid until the stored object is released.
#[derive(Clone, Debug)]
pub struct MemoryBlock {
    bytes: Bytes,
    kind: MemoryKind,
}

impl MemoryBlock {
    pub fn from_bytes(bytes: impl Into<Bytes>, kind: MemoryKind) -> Self {
        Self {
            bytes: bytes.into(),
            kind,
        }
    }

    /// Allocate a zero-filled block of the requested kind.
    pub fn zeroed(len: usize, kind: MemoryKind) -> Self {
        let mut buf = BytesMut::with_capacity(len);
        buf.resize(len, 0);
        Self {
            bytes: buf.freeze(),
            kind,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// View over the whole block.
    pub fn view(&self) -> BlockView {
        BlockView {
            bytes: self.bytes.clone(),
            kind: self.kind,
        }
    }

    /// View over a sub-range, or `None` if out of bounds.
    pub fn view_range(&self, offset: usize, len: usize) -> Option<BlockView> {
        if offset.checked_add(len)? > self.bytes.len() {
            return None;
        }
        Some(BlockView {
            bytes: self.bytes.slice(offset..offset + len),
            kind: self.kind,
        })
    }
}

/// A view into a memory block.
///
/// Slicing preserves the underlying allocation, so `addr()` reflects the
/// real address range and the registration cache can key on it.
#[derive(Clone, Debug)]
pub struct BlockView {
    bytes: Bytes,
    kind: MemoryKind,
}

impl BlockView {
    pub fn new(bytes: impl Into<Bytes>, kind: MemoryKind) -> Self {
        Self {
            bytes: bytes.into(),
            kind,
        }
    }

    pub fn host(bytes: impl Into<Bytes>) -> Self {
        Self::new(bytes, MemoryKind::Host)
    }

    pub fn addr(&self) -> usize {
        self.bytes.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn slice(&self, offset: usize, len: usize) -> Option<BlockView> {
        if offset.checked_add(len)? > self.bytes.len() {
            return None;
        }
        Some(BlockView {
            bytes: self.bytes.slice(offset..offset + len),
            kind: self.kind,
        })
    }
}

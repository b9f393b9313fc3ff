//! Encoded objects: the storage behind one serialized value.

use bytes::{Bytes, BytesMut};

use crate::core::{InstanceId, TypeFingerprint};
use crate::memory::Registration;

use super::descriptor::{Context, Descriptor, RemoteBuffer};
use super::error::CodecError;

/// The complete serialization of one value.
///
/// Append-only during encode, immutable after `ObjectBuilder::finish`.
/// Region bindings keep every registration a remote-buffer descriptor
/// points into alive, so the producer can satisfy pulls without
/// re-lookup.
pub struct EncodedObject {
    instance: InstanceId,
    descriptors: Vec<Descriptor>,
    contexts: Vec<Context>,
    arena: Bytes,
    bindings: Vec<Registration>,
}

impl EncodedObject {
    /// Rebuild from wire parts on the consuming side. The receiver holds
    /// no producer registrations, so the bindings list is empty and
    /// remote descriptors resolve through a pull source instead.
    pub(crate) fn from_wire_parts(
        instance: InstanceId,
        descriptors: Vec<Descriptor>,
        contexts: Vec<Context>,
        arena: Bytes,
    ) -> Self {
        Self {
            instance,
            descriptors,
            contexts,
            arena,
            bindings: Vec::new(),
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn descriptor_count(&self) -> usize {
        self.descriptors.len()
    }

    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn arena(&self) -> &Bytes {
        &self.arena
    }

    /// Fingerprint of the context at `index`.
    pub fn fingerprint_of(&self, index: u32) -> Option<TypeFingerprint> {
        self.contexts.get(index as usize).map(|ctx| ctx.fingerprint)
    }

    /// Parent of the context at `index`; `None` for roots.
    pub fn parent_of(&self, index: u32) -> Option<Option<u32>> {
        self.contexts.get(index as usize).map(|ctx| ctx.parent)
    }

    /// Descriptor span of the context at `index`.
    pub fn descriptor_range_of(&self, index: u32) -> Option<(u32, u32)> {
        self.contexts
            .get(index as usize)
            .map(|ctx| (ctx.start, ctx.end))
    }

    /// Slice of the arena backing an eager/meta/local descriptor.
    pub fn arena_slice(&self, offset: u64, len: u64) -> Option<Bytes> {
        let offset = usize::try_from(offset).ok()?;
        let len = usize::try_from(len).ok()?;
        if offset.checked_add(len)? > self.arena.len() {
            return None;
        }
        Some(self.arena.slice(offset..offset + len))
    }

    /// Resolve a remote-buffer descriptor against this object's own
    /// bindings. Succeeds only on the producing side.
    pub fn resolve_remote(&self, remote: &RemoteBuffer) -> Option<Bytes> {
        let binding = self
            .bindings
            .iter()
            .find(|registration| *registration.cookie() == remote.cookie)?;
        binding.read(remote.offset, remote.len)
    }

    pub(crate) fn bindings(&self) -> &[Registration] {
        &self.bindings
    }

    /// Check the structural invariants of the context forest.
    pub fn verify(&self) -> Result<(), CodecError> {
        let descriptor_count = self.descriptors.len() as u32;

        for (index, ctx) in self.contexts.iter().enumerate() {
            if let Some(parent) = ctx.parent {
                if parent as usize >= index {
                    return Err(CodecError::InvalidObject {
                        reason: format!("context {index} has non-prior parent {parent}"),
                    });
                }
                let parent_ctx = &self.contexts[parent as usize];
                if ctx.start < parent_ctx.start || ctx.end > parent_ctx.end {
                    return Err(CodecError::InvalidObject {
                        reason: format!(
                            "context {index} range [{}, {}) escapes parent [{}, {})",
                            ctx.start, ctx.end, parent_ctx.start, parent_ctx.end
                        ),
                    });
                }
            }
            if ctx.start > ctx.end || ctx.end > descriptor_count {
                return Err(CodecError::InvalidObject {
                    reason: format!(
                        "context {index} range [{}, {}) exceeds {descriptor_count} descriptors",
                        ctx.start, ctx.end
                    ),
                });
            }
        }

        // Sibling ranges must be disjoint, and root ranges must cover the
        // descriptor sequence exactly.
        let mut root_cursor = 0u32;
        for (index, ctx) in self.contexts.iter().enumerate() {
            if ctx.parent.is_none() {
                if ctx.start != root_cursor {
                    return Err(CodecError::InvalidObject {
                        reason: format!(
                            "root context {index} starts at {} but {} expected",
                            ctx.start, root_cursor
                        ),
                    });
                }
                root_cursor = ctx.end;
            }
        }
        if !self.contexts.is_empty() && root_cursor != descriptor_count {
            return Err(CodecError::InvalidObject {
                reason: format!(
                    "root contexts cover {root_cursor} of {descriptor_count} descriptors"
                ),
            });
        }

        for (index, ctx) in self.contexts.iter().enumerate() {
            let mut child_cursor = None;
            for (child_index, child) in self.contexts.iter().enumerate().skip(index + 1) {
                if child.parent != Some(index as u32) {
                    continue;
                }
                if let Some(cursor) = child_cursor
                    && child.start < cursor
                {
                    return Err(CodecError::InvalidObject {
                        reason: format!(
                            "context {child_index} overlaps an earlier sibling of {index}"
                        ),
                    });
                }
                child_cursor = Some(child.end);
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for EncodedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedObject")
            .field("instance", &self.instance)
            .field("descriptors", &self.descriptors.len())
            .field("contexts", &self.contexts.len())
            .field("arena_bytes", &self.arena.len())
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

/// Mutable storage used only while an encode is in flight.
pub struct ObjectBuilder {
    instance: InstanceId,
    descriptors: Vec<Descriptor>,
    contexts: Vec<Context>,
    stack: Vec<u32>,
    arena: BytesMut,
    bindings: Vec<Registration>,
}

/// Token returned by `push_context`; the matching pop must present it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextToken {
    index: u32,
}

impl ObjectBuilder {
    pub fn new(instance: InstanceId) -> Self {
        Self {
            instance,
            descriptors: Vec::new(),
            contexts: Vec::new(),
            stack: Vec::new(),
            arena: BytesMut::new(),
            bindings: Vec::new(),
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn push_context(&mut self, fingerprint: TypeFingerprint) -> ContextToken {
        let index = self.contexts.len() as u32;
        let parent = self.stack.last().copied();
        self.contexts.push(Context {
            fingerprint,
            parent,
            start: self.descriptors.len() as u32,
            end: self.descriptors.len() as u32,
        });
        self.stack.push(index);
        ContextToken { index }
    }

    /// Close the most recent open context. A mismatched token is a
    /// protocol-author bug and fails the encode.
    pub fn pop_context(&mut self, token: ContextToken) -> Result<(), CodecError> {
        match self.stack.pop() {
            Some(index) if index == token.index => {
                self.contexts[index as usize].end = self.descriptors.len() as u32;
                Ok(())
            }
            other => {
                if let Some(index) = other {
                    self.stack.push(index);
                }
                Err(CodecError::UnbalancedContext {
                    depth: self.stack.len(),
                })
            }
        }
    }

    pub fn push_descriptor(&mut self, descriptor: Descriptor) -> u64 {
        let index = self.descriptors.len() as u64;
        self.descriptors.push(descriptor);
        index
    }

    /// Copy bytes into the arena, returning their `(offset, len)`.
    pub fn append_arena(&mut self, bytes: &[u8]) -> (u64, u64) {
        let offset = self.arena.len() as u64;
        self.arena.extend_from_slice(bytes);
        (offset, bytes.len() as u64)
    }

    /// Reserve a zero-filled arena range, returning its offset.
    pub fn reserve_arena(&mut self, len: usize) -> u64 {
        let offset = self.arena.len();
        self.arena.resize(offset + len, 0);
        offset as u64
    }

    /// Write into a previously reserved arena range.
    pub fn write_arena(
        &mut self,
        base: u64,
        range_len: u64,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), CodecError> {
        let need = offset + bytes.len();
        if need as u64 > range_len {
            return Err(CodecError::ShortWrite {
                need,
                have: range_len as usize,
            });
        }
        let start = base as usize + offset;
        self.arena[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn push_binding(&mut self, registration: Registration) {
        self.bindings.push(registration);
    }

    pub fn descriptor(&self, index: u64) -> Option<&Descriptor> {
        self.descriptors.get(index as usize)
    }

    /// Seal the encoding. Any context left open means the protocol
    /// returned without popping: the partially built object is dropped
    /// (releasing its registrations) and `UnbalancedContext` is raised.
    pub fn finish(self) -> Result<EncodedObject, CodecError> {
        if !self.stack.is_empty() {
            return Err(CodecError::UnbalancedContext {
                depth: self.stack.len(),
            });
        }
        Ok(EncodedObject {
            instance: self.instance,
            descriptors: self.descriptors,
            contexts: self.contexts,
            arena: self.arena.freeze(),
            bindings: self.bindings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TypeFingerprint;

    fn fp(name: &str) -> TypeFingerprint {
        TypeFingerprint::derive(name, 1)
    }

    #[test]
    fn nested_contexts_record_parent_and_ranges() {
        let mut builder = ObjectBuilder::new(InstanceId::new(1));
        let outer = builder.push_context(fp("outer"));
        let (offset, len) = builder.append_arena(b"a");
        builder.push_descriptor(Descriptor::Eager { offset, len });

        let inner = builder.push_context(fp("inner"));
        let (offset, len) = builder.append_arena(b"bb");
        builder.push_descriptor(Descriptor::Eager { offset, len });
        builder.pop_context(inner).unwrap();

        let (offset, len) = builder.append_arena(b"ccc");
        builder.push_descriptor(Descriptor::Eager { offset, len });
        builder.pop_context(outer).unwrap();

        let object = builder.finish().unwrap();
        object.verify().unwrap();

        assert_eq!(object.context_count(), 2);
        assert_eq!(object.parent_of(0), Some(None));
        assert_eq!(object.parent_of(1), Some(Some(0)));
        assert_eq!(object.descriptor_range_of(0), Some((0, 3)));
        assert_eq!(object.descriptor_range_of(1), Some((1, 2)));
        assert_eq!(object.fingerprint_of(1), Some(fp("inner")));
    }

    #[test]
    fn unbalanced_stack_fails_finish() {
        let mut builder = ObjectBuilder::new(InstanceId::new(1));
        let _open = builder.push_context(fp("leaky"));
        let err = builder.finish().unwrap_err();
        assert!(matches!(err, CodecError::UnbalancedContext { depth: 1 }));
    }

    #[test]
    fn mismatched_pop_is_rejected() {
        let mut builder = ObjectBuilder::new(InstanceId::new(1));
        let outer = builder.push_context(fp("outer"));
        let _inner = builder.push_context(fp("inner"));
        let err = builder.pop_context(outer).unwrap_err();
        assert!(matches!(err, CodecError::UnbalancedContext { .. }));
    }

    #[test]
    fn verify_rejects_uncovered_descriptors() {
        let mut builder = ObjectBuilder::new(InstanceId::new(1));
        let ctx = builder.push_context(fp("root"));
        builder.pop_context(ctx).unwrap();
        // Descriptor outside any context range.
        let (offset, len) = builder.append_arena(b"stray");
        builder.push_descriptor(Descriptor::Eager { offset, len });
        let object = builder.finish().unwrap();
        assert!(object.verify().is_err());
    }

    #[test]
    fn reserved_arena_range_is_writable() {
        let mut builder = ObjectBuilder::new(InstanceId::new(1));
        let ctx = builder.push_context(fp("root"));
        let base = builder.reserve_arena(4);
        builder.push_descriptor(Descriptor::Local { offset: base, len: 4 });
        builder.write_arena(base, 4, 1, b"xy").unwrap();
        assert!(builder.write_arena(base, 4, 3, b"zz").is_err());
        builder.pop_context(ctx).unwrap();

        let object = builder.finish().unwrap();
        assert_eq!(object.arena_slice(base, 4).unwrap().as_ref(), b"\0xy\0");
    }
}

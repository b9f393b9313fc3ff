//! Decoding: the dual capability surface, walking descriptors in encode
//! order.

use std::marker::PhantomData;

use bytes::Bytes;

use crate::core::{MemoryKind, TypeFingerprint};
use crate::memory::MemoryBlock;

use super::descriptor::{Descriptor, RemoteBuffer};
use super::error::CodecError;
use super::object::EncodedObject;
use super::protocol::Codable;

/// Resolves remote-buffer descriptors to payload bytes.
///
/// On the producing side the object's own bindings satisfy reads
/// in-process; on the consuming side a pull source issues one-sided gets
/// through the data plane and blocks the calling task until they land.
pub trait PayloadSource {
    fn fetch(&self, remote: &RemoteBuffer) -> Result<Bytes, CodecError>;

    fn fetch_into(&self, remote: &RemoteBuffer, dst: &mut [u8]) -> Result<(), CodecError> {
        let bytes = self.fetch(remote)?;
        if dst.len() != bytes.len() {
            return Err(CodecError::ShortWrite {
                need: bytes.len(),
                have: dst.len(),
            });
        }
        dst.copy_from_slice(&bytes);
        Ok(())
    }
}

/// Producer-side source: remote descriptors resolve against the object's
/// own region bindings.
pub struct LocalPayloadSource<'a> {
    object: &'a EncodedObject,
}

impl<'a> LocalPayloadSource<'a> {
    pub fn new(object: &'a EncodedObject) -> Self {
        Self { object }
    }
}

impl PayloadSource for LocalPayloadSource<'_> {
    fn fetch(&self, remote: &RemoteBuffer) -> Result<Bytes, CodecError> {
        self.object
            .resolve_remote(remote)
            .ok_or(CodecError::UnknownRegion)
    }
}

#[derive(Default)]
struct DecodeState {
    context_cursor: usize,
    descriptor_cursor: usize,
}

/// Decode the value an encoded object was built from. Objects are
/// immutable, so repeated decodes yield equal values.
pub fn decode<T: Codable>(
    object: &EncodedObject,
    source: &dyn PayloadSource,
) -> Result<T, CodecError> {
    if object.contexts().is_empty() {
        return Err(CodecError::UnknownType {
            expected: T::TYPE_NAME,
        });
    }
    let mut state = DecodeState::default();
    let mut decoder = Decoder::<T> {
        object,
        source,
        state: &mut state,
        _marker: PhantomData,
    };
    decoder.deserialize()
}

/// Decode on the producing side, without a data plane.
pub fn decode_local<T: Codable>(object: &EncodedObject) -> Result<T, CodecError> {
    let source = LocalPayloadSource::new(object);
    decode(object, &source)
}

/// Typed cursor over an encoded object handed to a protocol's `decode`.
pub struct Decoder<'a, T: Codable> {
    object: &'a EncodedObject,
    source: &'a dyn PayloadSource,
    state: &'a mut DecodeState,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: Codable> Decoder<'a, T> {
    pub(crate) fn deserialize(&mut self) -> Result<T, CodecError> {
        let index = self.state.context_cursor;
        let Some(ctx) = self.object.contexts().get(index).copied() else {
            return Err(CodecError::MissingContext {
                at: index,
                len: self.object.context_count(),
            });
        };

        let expected = T::fingerprint();
        if ctx.fingerprint != expected {
            return Err(CodecError::TypeMismatch {
                context: index as u32,
                expected,
                got: ctx.fingerprint,
            });
        }
        if self.state.descriptor_cursor != ctx.start as usize {
            return Err(CodecError::InvalidObject {
                reason: format!(
                    "context {index} starts at {} but cursor is at {}",
                    ctx.start, self.state.descriptor_cursor
                ),
            });
        }

        self.state.context_cursor += 1;
        let value = T::decode(self)?;

        if self.state.descriptor_cursor != ctx.end as usize {
            return Err(CodecError::InvalidObject {
                reason: format!(
                    "context {index} left cursor at {} instead of {}",
                    self.state.descriptor_cursor, ctx.end
                ),
            });
        }
        Ok(value)
    }

    fn next_descriptor(&mut self) -> Result<(usize, Descriptor), CodecError> {
        let at = self.state.descriptor_cursor;
        let Some(descriptor) = self.object.descriptors().get(at) else {
            return Err(CodecError::ShortRead {
                at,
                len: self.object.descriptor_count(),
            });
        };
        self.state.descriptor_cursor += 1;
        Ok((at, descriptor.clone()))
    }

    fn arena_payload(&self, offset: u64, len: u64) -> Result<Bytes, CodecError> {
        self.object
            .arena_slice(offset, len)
            .ok_or(CodecError::InvalidObject {
                reason: format!("arena range [{offset}, +{len}) out of bounds"),
            })
    }

    /// Length of the descriptor at the cursor, without consuming it.
    /// Lets protocols preallocate a destination before `read_remote_into`.
    pub fn next_len(&self) -> Result<u64, CodecError> {
        let at = self.state.descriptor_cursor;
        self.object
            .descriptors()
            .get(at)
            .map(Descriptor::len)
            .ok_or(CodecError::ShortRead {
                at,
                len: self.object.descriptor_count(),
            })
    }

    /// Read an inline descriptor.
    pub fn read_eager(&mut self) -> Result<Bytes, CodecError> {
        match self.next_descriptor()? {
            (_, Descriptor::Eager { offset, len }) => self.arena_payload(offset, len),
            (at, other) => Err(CodecError::UnexpectedDescriptor {
                at,
                expected: "eager",
                found: other.kind_str(),
            }),
        }
    }

    /// Read an owned local buffer.
    pub fn read_local(&mut self) -> Result<Bytes, CodecError> {
        match self.next_descriptor()? {
            (_, Descriptor::Local { offset, len }) => self.arena_payload(offset, len),
            (at, other) => Err(CodecError::UnexpectedDescriptor {
                at,
                expected: "local",
                found: other.kind_str(),
            }),
        }
    }

    /// Read a structured metadata blob.
    pub fn read_meta<M>(&mut self) -> Result<M, CodecError>
    where
        M: for<'b> minicbor::Decode<'b, ()>,
    {
        match self.next_descriptor()? {
            (_, Descriptor::Meta { offset, len }) => {
                let payload = self.arena_payload(offset, len)?;
                Ok(minicbor::decode(payload.as_ref())?)
            }
            (at, other) => Err(CodecError::UnexpectedDescriptor {
                at,
                expected: "meta",
                found: other.kind_str(),
            }),
        }
    }

    /// Pull a remote descriptor's payload into `dst`. Suspends the
    /// calling task until the one-sided read completes.
    pub fn read_remote_into(&mut self, dst: &mut [u8]) -> Result<(), CodecError> {
        match self.next_descriptor()? {
            (_, Descriptor::Remote(remote)) => self.source.fetch_into(&remote, dst),
            (at, other) => Err(CodecError::UnexpectedDescriptor {
                at,
                expected: "remote",
                found: other.kind_str(),
            }),
        }
    }

    /// Read whichever buffer descriptor is next: inline and local
    /// payloads come from the arena, remote payloads are pulled.
    pub fn read_buffer(&mut self) -> Result<Bytes, CodecError> {
        match self.next_descriptor()? {
            (_, Descriptor::Eager { offset, len }) | (_, Descriptor::Local { offset, len }) => {
                self.arena_payload(offset, len)
            }
            (_, Descriptor::Remote(remote)) => self.source.fetch(&remote),
            (at, other) => Err(CodecError::UnexpectedDescriptor {
                at,
                expected: "buffer",
                found: other.kind_str(),
            }),
        }
    }

    /// Like `read_buffer`, preserving the memory kind of remote
    /// descriptors.
    pub fn read_block(&mut self) -> Result<MemoryBlock, CodecError> {
        match self.next_descriptor()? {
            (_, Descriptor::Eager { offset, len }) | (_, Descriptor::Local { offset, len }) => {
                let payload = self.arena_payload(offset, len)?;
                Ok(MemoryBlock::from_bytes(payload, MemoryKind::Host))
            }
            (_, Descriptor::Remote(remote)) => {
                let payload = self.source.fetch(&remote)?;
                Ok(MemoryBlock::from_bytes(payload, remote.kind))
            }
            (at, other) => Err(CodecError::UnexpectedDescriptor {
                at,
                expected: "buffer",
                found: other.kind_str(),
            }),
        }
    }

    /// Enter the next context explicitly, checking its fingerprint. Dual
    /// of `Encoder::push_context`. Returns the context index to present
    /// to `leave_context`.
    pub fn enter_context(&mut self, fingerprint: TypeFingerprint) -> Result<u32, CodecError> {
        let index = self.state.context_cursor;
        let Some(ctx) = self.object.contexts().get(index).copied() else {
            return Err(CodecError::MissingContext {
                at: index,
                len: self.object.context_count(),
            });
        };
        if ctx.fingerprint != fingerprint {
            return Err(CodecError::TypeMismatch {
                context: index as u32,
                expected: fingerprint,
                got: ctx.fingerprint,
            });
        }
        self.state.context_cursor += 1;
        Ok(index as u32)
    }

    /// Leave an explicitly entered context, checking that its descriptor
    /// span was fully consumed.
    pub fn leave_context(&mut self, index: u32) -> Result<(), CodecError> {
        let Some(ctx) = self.object.contexts().get(index as usize).copied() else {
            return Err(CodecError::MissingContext {
                at: index as usize,
                len: self.object.context_count(),
            });
        };
        if self.state.descriptor_cursor != ctx.end as usize {
            return Err(CodecError::InvalidObject {
                reason: format!(
                    "context {index} left cursor at {} instead of {}",
                    self.state.descriptor_cursor, ctx.end
                ),
            });
        }
        Ok(())
    }

    /// Rebind to a nested value's type and decode its context.
    pub fn decode_nested<U: Codable>(&mut self) -> Result<U, CodecError> {
        let mut nested = Decoder::<U> {
            object: self.object,
            source: self.source,
            state: &mut *self.state,
            _marker: PhantomData,
        };
        nested.deserialize()
    }
}

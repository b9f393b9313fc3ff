//! Encoding: the capability surface protocols write through.

use std::marker::PhantomData;

use crate::core::{InstanceId, TypeFingerprint};
use crate::memory::{BlockProvider, BlockView};

use super::descriptor::{Descriptor, RemoteBuffer};
use super::error::CodecError;
use super::object::{ContextToken, EncodedObject, ObjectBuilder};
use super::protocol::Codable;

pub const DEFAULT_EAGER_THRESHOLD: usize = 1024;

/// Per-encode-call options.
#[derive(Clone, Debug)]
pub struct EncodingOptions {
    /// Buffers at or below this size are copied inline.
    pub eager_threshold: usize,
    /// Bypass the threshold and the registration cache: every buffer
    /// becomes a remote descriptor backed by a fresh registration. The
    /// encoded object then pins that memory for the stored object's
    /// lifetime.
    pub force_register: bool,
}

impl Default for EncodingOptions {
    fn default() -> Self {
        Self {
            eager_threshold: DEFAULT_EAGER_THRESHOLD,
            force_register: false,
        }
    }
}

/// Serialize `value` into a fresh encoded object.
///
/// The context stack must be balanced when the top-level protocol
/// returns; otherwise the partially built object is discarded (its
/// registrations released on drop) and `UnbalancedContext` is raised.
pub fn encode<T: Codable>(
    value: &T,
    instance: InstanceId,
    provider: &BlockProvider,
    options: EncodingOptions,
) -> Result<EncodedObject, CodecError> {
    let mut builder = ObjectBuilder::new(instance);
    let mut encoder = Encoder::<T> {
        builder: &mut builder,
        provider,
        options: &options,
        _marker: PhantomData,
    };
    encoder.serialize(value)?;
    builder.finish()
}

/// Typed view over the object builder handed to a protocol's `encode`.
///
/// The encoder never suspends; every operation appends to the in-flight
/// object synchronously.
pub struct Encoder<'a, T: Codable> {
    builder: &'a mut ObjectBuilder,
    provider: &'a BlockProvider,
    options: &'a EncodingOptions,
    _marker: PhantomData<fn(&T)>,
}

impl<'a, T: Codable> Encoder<'a, T> {
    pub(crate) fn serialize(&mut self, value: &T) -> Result<(), CodecError> {
        let token = self.builder.push_context(T::fingerprint());
        value.encode(self)?;
        self.builder.pop_context(token)
    }

    /// Open a nested context explicitly. Every descriptor written until
    /// the matching `pop_context` is attributed to it. Protocols that
    /// nest via `encode_nested` never need this.
    pub fn push_context(&mut self, fingerprint: TypeFingerprint) -> ContextToken {
        self.builder.push_context(fingerprint)
    }

    /// Close an explicitly opened context; must match the most recent
    /// push.
    pub fn pop_context(&mut self, token: ContextToken) -> Result<(), CodecError> {
        self.builder.pop_context(token)
    }

    pub fn options(&self) -> &EncodingOptions {
        self.options
    }

    /// Copy bytes inline into the arena.
    pub fn write_eager(&mut self, bytes: &[u8]) -> Result<u64, CodecError> {
        let (offset, len) = self.builder.append_arena(bytes);
        Ok(self.builder.push_descriptor(Descriptor::Eager { offset, len }))
    }

    /// Record a remote-buffer descriptor for `view`, registering it (or
    /// reusing a cached registration unless `force_register`).
    pub fn write_remote(
        &mut self,
        view: &BlockView,
        force_register: bool,
    ) -> Result<u64, CodecError> {
        let registration = self.provider.register(view, force_register)?;
        let offset = registration.offset_of(view)?;
        let descriptor = Descriptor::Remote(RemoteBuffer {
            instance: self.builder.instance(),
            cookie: registration.cookie().clone(),
            offset,
            len: view.len() as u64,
            kind: view.kind(),
        });
        self.builder.push_binding(registration);
        Ok(self.builder.push_descriptor(descriptor))
    }

    /// Threshold policy: inline at or below `eager_threshold`, remote
    /// above it; `force_register` always takes the remote path.
    pub fn write_buffer(&mut self, view: &BlockView) -> Result<u64, CodecError> {
        if !self.options.force_register && view.len() <= self.options.eager_threshold {
            self.write_eager(view.bytes())
        } else {
            self.write_remote(view, self.options.force_register)
        }
    }

    /// Append a structured metadata blob.
    pub fn write_meta<M: minicbor::Encode<()>>(&mut self, meta: &M) -> Result<u64, CodecError> {
        let encoded = minicbor::to_vec(meta)
            .map_err(|err| CodecError::MetaEncode(err.to_string()))?;
        let (offset, len) = self.builder.append_arena(&encoded);
        Ok(self.builder.push_descriptor(Descriptor::Meta { offset, len }))
    }

    /// Reserve an owned local buffer in the arena, to be filled with
    /// `copy_to_buffer`. Used when the object lives locally only.
    pub fn create_buffer(&mut self, len: usize) -> Result<u64, CodecError> {
        let offset = self.builder.reserve_arena(len);
        Ok(self.builder.push_descriptor(Descriptor::Local {
            offset,
            len: len as u64,
        }))
    }

    /// Fill part of a buffer created with `create_buffer`.
    pub fn copy_to_buffer(
        &mut self,
        index: u64,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), CodecError> {
        let (base, len) = match self.builder.descriptor(index) {
            Some(Descriptor::Local { offset, len }) => (*offset, *len),
            Some(other) => {
                return Err(CodecError::UnexpectedDescriptor {
                    at: index as usize,
                    expected: "local",
                    found: other.kind_str(),
                });
            }
            None => {
                return Err(CodecError::ShortRead {
                    at: index as usize,
                    len: 0,
                });
            }
        };
        self.builder.write_arena(base, len, offset, bytes)
    }

    /// Rebind to a nested value's type, sharing the same underlying
    /// object, and encode it in its own context.
    pub fn encode_nested<U: Codable>(&mut self, value: &U) -> Result<(), CodecError> {
        let mut nested = Encoder::<U> {
            builder: self.builder,
            provider: self.provider,
            options: self.options,
            _marker: PhantomData,
        };
        nested.serialize(value)
    }
}

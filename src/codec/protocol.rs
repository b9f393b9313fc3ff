//! The per-type protocol trait and implementations for common types.

use bytes::Bytes;

use crate::core::{MemoryKind, TypeFingerprint};
use crate::memory::{BlockView, MemoryBlock};

use super::decode::Decoder;
use super::encode::Encoder;
use super::error::CodecError;

/// Per-type serialization protocol.
///
/// Selection is static: the trait bound replaces the source language's
/// runtime type dispatch, so an unregistered type is a compile error.
/// Fingerprints are content hashes of `(TYPE_NAME, LAYOUT_VERSION)`;
/// generic containers must override `fingerprint` to mix in their
/// element types.
pub trait Codable: Sized {
    const TYPE_NAME: &'static str;
    const LAYOUT_VERSION: u32 = 1;

    fn fingerprint() -> TypeFingerprint {
        TypeFingerprint::derive(Self::TYPE_NAME, Self::LAYOUT_VERSION)
    }

    fn encode(&self, encoder: &mut Encoder<'_, Self>) -> Result<(), CodecError>;

    fn decode(decoder: &mut Decoder<'_, Self>) -> Result<Self, CodecError>;
}

macro_rules! scalar_codable {
    ($ty:ty, $name:literal) => {
        impl Codable for $ty {
            const TYPE_NAME: &'static str = $name;

            fn encode(&self, encoder: &mut Encoder<'_, Self>) -> Result<(), CodecError> {
                encoder.write_eager(&self.to_le_bytes())?;
                Ok(())
            }

            fn decode(decoder: &mut Decoder<'_, Self>) -> Result<Self, CodecError> {
                let raw = decoder.read_eager()?;
                let arr: [u8; size_of::<$ty>()] =
                    raw.as_ref().try_into().map_err(|_| CodecError::ScalarWidth {
                        expected: size_of::<$ty>(),
                        got: raw.len(),
                    })?;
                Ok(<$ty>::from_le_bytes(arr))
            }
        }
    };
}

scalar_codable!(u16, "u16");
scalar_codable!(u32, "u32");
scalar_codable!(u64, "u64");
scalar_codable!(i32, "i32");
scalar_codable!(i64, "i64");
scalar_codable!(f32, "f32");
scalar_codable!(f64, "f64");

impl Codable for bool {
    const TYPE_NAME: &'static str = "bool";

    fn encode(&self, encoder: &mut Encoder<'_, Self>) -> Result<(), CodecError> {
        encoder.write_eager(&[*self as u8])?;
        Ok(())
    }

    fn decode(decoder: &mut Decoder<'_, Self>) -> Result<Self, CodecError> {
        let raw = decoder.read_eager()?;
        match raw.as_ref() {
            [0] => Ok(false),
            [1] => Ok(true),
            other => Err(CodecError::ScalarWidth {
                expected: 1,
                got: other.len(),
            }),
        }
    }
}

impl Codable for String {
    const TYPE_NAME: &'static str = "string";

    fn encode(&self, encoder: &mut Encoder<'_, Self>) -> Result<(), CodecError> {
        let view = BlockView::host(Bytes::copy_from_slice(self.as_bytes()));
        encoder.write_buffer(&view)?;
        Ok(())
    }

    fn decode(decoder: &mut Decoder<'_, Self>) -> Result<Self, CodecError> {
        let payload = decoder.read_buffer()?;
        String::from_utf8(payload.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}

impl Codable for Bytes {
    const TYPE_NAME: &'static str = "bytes";

    fn encode(&self, encoder: &mut Encoder<'_, Self>) -> Result<(), CodecError> {
        encoder.write_buffer(&BlockView::host(self.clone()))?;
        Ok(())
    }

    fn decode(decoder: &mut Decoder<'_, Self>) -> Result<Self, CodecError> {
        decoder.read_buffer()
    }
}

impl Codable for MemoryBlock {
    const TYPE_NAME: &'static str = "memory_block";

    fn encode(&self, encoder: &mut Encoder<'_, Self>) -> Result<(), CodecError> {
        match self.kind() {
            // Device memory is never inlined; it stays put and is pulled.
            MemoryKind::Device => {
                encoder.write_remote(&self.view(), encoder.options().force_register)?;
            }
            MemoryKind::Host => {
                encoder.write_buffer(&self.view())?;
            }
        }
        Ok(())
    }

    fn decode(decoder: &mut Decoder<'_, Self>) -> Result<Self, CodecError> {
        decoder.read_block()
    }
}

impl<T: Codable> Codable for Vec<T> {
    const TYPE_NAME: &'static str = "vec";

    fn fingerprint() -> TypeFingerprint {
        TypeFingerprint::derive(Self::TYPE_NAME, Self::LAYOUT_VERSION).combine(T::fingerprint())
    }

    fn encode(&self, encoder: &mut Encoder<'_, Self>) -> Result<(), CodecError> {
        encoder.write_meta(&(self.len() as u64))?;
        for item in self {
            encoder.encode_nested(item)?;
        }
        Ok(())
    }

    fn decode(decoder: &mut Decoder<'_, Self>) -> Result<Self, CodecError> {
        let len: u64 = decoder.read_meta()?;
        let mut items = Vec::with_capacity(len.min(1024) as usize);
        for _ in 0..len {
            items.push(decoder.decode_nested()?);
        }
        Ok(items)
    }
}

impl<T: Codable> Codable for Option<T> {
    const TYPE_NAME: &'static str = "option";

    fn fingerprint() -> TypeFingerprint {
        TypeFingerprint::derive(Self::TYPE_NAME, Self::LAYOUT_VERSION).combine(T::fingerprint())
    }

    fn encode(&self, encoder: &mut Encoder<'_, Self>) -> Result<(), CodecError> {
        encoder.write_meta(&self.is_some())?;
        if let Some(value) = self {
            encoder.encode_nested(value)?;
        }
        Ok(())
    }

    fn decode(decoder: &mut Decoder<'_, Self>) -> Result<Self, CodecError> {
        let present: bool = decoder.read_meta()?;
        if present {
            Ok(Some(decoder.decode_nested()?))
        } else {
            Ok(None)
        }
    }
}

impl<A: Codable, B: Codable> Codable for (A, B) {
    const TYPE_NAME: &'static str = "tuple2";

    fn fingerprint() -> TypeFingerprint {
        TypeFingerprint::derive(Self::TYPE_NAME, Self::LAYOUT_VERSION)
            .combine(A::fingerprint())
            .combine(B::fingerprint())
    }

    fn encode(&self, encoder: &mut Encoder<'_, Self>) -> Result<(), CodecError> {
        encoder.encode_nested(&self.0)?;
        encoder.encode_nested(&self.1)
    }

    fn decode(decoder: &mut Decoder<'_, Self>) -> Result<Self, CodecError> {
        let first = decoder.decode_nested()?;
        let second = decoder.decode_nested()?;
        Ok((first, second))
    }
}

//! Wire form of encoded objects (CBOR, stable string keys).

use std::convert::Infallible;

use bytes::Bytes;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::core::{InstanceId, Limits, MemoryKind, RegionCookie, TypeFingerprint};

use super::descriptor::{Context, Descriptor, RemoteBuffer};
use super::object::EncodedObject;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("decode limit exceeded: {0}")]
    DecodeLimit(&'static str),

    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("trailing bytes after message body")]
    TrailingBytes,

    #[error("cbor encode: {0}")]
    CborEncode(#[from] minicbor::encode::Error<Infallible>),

    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

pub fn encode_object(object: &EncodedObject) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);

    enc.map(4)?;
    enc.str("instance")?;
    enc.u64(object.instance().get())?;

    enc.str("descriptors")?;
    enc.array(object.descriptor_count() as u64)?;
    for descriptor in object.descriptors() {
        encode_descriptor(&mut enc, descriptor)?;
    }

    enc.str("contexts")?;
    enc.array(object.context_count() as u64)?;
    for context in object.contexts() {
        encode_context(&mut enc, context)?;
    }

    enc.str("arena")?;
    enc.bytes(object.arena())?;

    Ok(buf)
}

pub fn decode_object(bytes: &[u8], limits: &Limits) -> Result<EncodedObject, WireError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec)?;

    let mut instance = None;
    let mut descriptors = None;
    let mut contexts = None;
    let mut arena = None;

    for _ in 0..map_len {
        let key = dec.str()?;
        match key {
            "instance" => instance = Some(InstanceId::new(dec.u64()?)),
            "descriptors" => descriptors = Some(decode_descriptors(&mut dec, limits)?),
            "contexts" => contexts = Some(decode_contexts(&mut dec, limits)?),
            "arena" => {
                let raw = dec.bytes()?;
                if raw.len() > limits.max_arena_bytes {
                    return Err(WireError::DecodeLimit("max_arena_bytes"));
                }
                arena = Some(Bytes::copy_from_slice(raw));
            }
            _ => dec.skip()?,
        }
    }

    if dec.datatype().is_ok() {
        return Err(WireError::TrailingBytes);
    }

    let object = EncodedObject::from_wire_parts(
        instance.ok_or(WireError::MissingField("instance"))?,
        descriptors.ok_or(WireError::MissingField("descriptors"))?,
        contexts.ok_or(WireError::MissingField("contexts"))?,
        arena.ok_or(WireError::MissingField("arena"))?,
    );
    object.verify().map_err(|err| WireError::InvalidField {
        field: "contexts",
        reason: err.to_string(),
    })?;
    Ok(object)
}

fn encode_descriptor(
    enc: &mut Encoder<&mut Vec<u8>>,
    descriptor: &Descriptor,
) -> Result<(), WireError> {
    match descriptor {
        Descriptor::Eager { offset, len }
        | Descriptor::Meta { offset, len }
        | Descriptor::Local { offset, len } => {
            enc.map(3)?;
            enc.str("kind")?;
            enc.str(descriptor.kind_str())?;
            enc.str("offset")?;
            enc.u64(*offset)?;
            enc.str("len")?;
            enc.u64(*len)?;
        }
        Descriptor::Remote(remote) => {
            enc.map(6)?;
            enc.str("kind")?;
            enc.str("remote")?;
            enc.str("instance")?;
            enc.u64(remote.instance.get())?;
            enc.str("cookie")?;
            enc.bytes(remote.cookie.as_bytes())?;
            enc.str("offset")?;
            enc.u64(remote.offset)?;
            enc.str("len")?;
            enc.u64(remote.len)?;
            enc.str("mem")?;
            enc.u8(remote.kind.as_u8())?;
        }
    }
    Ok(())
}

fn decode_descriptors(
    dec: &mut Decoder,
    limits: &Limits,
) -> Result<Vec<Descriptor>, WireError> {
    let len = decode_array_len(dec)?;
    if len as usize > limits.max_descriptors {
        return Err(WireError::DecodeLimit("max_descriptors"));
    }
    let mut descriptors = Vec::with_capacity(len as usize);
    for _ in 0..len {
        descriptors.push(decode_descriptor(dec)?);
    }
    Ok(descriptors)
}

fn decode_descriptor(dec: &mut Decoder) -> Result<Descriptor, WireError> {
    let map_len = decode_map_len(dec)?;

    let mut kind = None;
    let mut instance = None;
    let mut cookie = None;
    let mut offset = None;
    let mut len = None;
    let mut mem = None;

    for _ in 0..map_len {
        let key = dec.str()?;
        match key {
            "kind" => kind = Some(dec.str()?.to_string()),
            "instance" => instance = Some(InstanceId::new(dec.u64()?)),
            "cookie" => cookie = Some(RegionCookie::new(Bytes::copy_from_slice(dec.bytes()?))),
            "offset" => offset = Some(dec.u64()?),
            "len" => len = Some(dec.u64()?),
            "mem" => mem = Some(dec.u8()?),
            _ => dec.skip()?,
        }
    }

    let kind = kind.ok_or(WireError::MissingField("kind"))?;
    let offset = offset.ok_or(WireError::MissingField("offset"))?;
    let len = len.ok_or(WireError::MissingField("len"))?;

    match kind.as_str() {
        "eager" => Ok(Descriptor::Eager { offset, len }),
        "meta" => Ok(Descriptor::Meta { offset, len }),
        "local" => Ok(Descriptor::Local { offset, len }),
        "remote" => {
            let mem = mem.ok_or(WireError::MissingField("mem"))?;
            Ok(Descriptor::Remote(RemoteBuffer {
                instance: instance.ok_or(WireError::MissingField("instance"))?,
                cookie: cookie.ok_or(WireError::MissingField("cookie"))?,
                offset,
                len,
                kind: MemoryKind::from_u8(mem).ok_or(WireError::InvalidField {
                    field: "mem",
                    reason: format!("unknown memory kind {mem}"),
                })?,
            }))
        }
        other => Err(WireError::InvalidField {
            field: "kind",
            reason: format!("unknown descriptor kind {other:?}"),
        }),
    }
}

fn encode_context(enc: &mut Encoder<&mut Vec<u8>>, context: &Context) -> Result<(), WireError> {
    let len = if context.parent.is_some() { 4 } else { 3 };
    enc.map(len)?;
    enc.str("fp")?;
    enc.u64(context.fingerprint.get())?;
    if let Some(parent) = context.parent {
        enc.str("parent")?;
        enc.u32(parent)?;
    }
    enc.str("start")?;
    enc.u32(context.start)?;
    enc.str("end")?;
    enc.u32(context.end)?;
    Ok(())
}

fn decode_contexts(dec: &mut Decoder, limits: &Limits) -> Result<Vec<Context>, WireError> {
    let len = decode_array_len(dec)?;
    if len as usize > limits.max_contexts {
        return Err(WireError::DecodeLimit("max_contexts"));
    }
    let mut contexts = Vec::with_capacity(len as usize);
    for _ in 0..len {
        contexts.push(decode_context(dec)?);
    }
    Ok(contexts)
}

fn decode_context(dec: &mut Decoder) -> Result<Context, WireError> {
    let map_len = decode_map_len(dec)?;

    let mut fingerprint = None;
    let mut parent = None;
    let mut start = None;
    let mut end = None;

    for _ in 0..map_len {
        let key = dec.str()?;
        match key {
            "fp" => fingerprint = Some(TypeFingerprint::from_raw(dec.u64()?)),
            "parent" => parent = Some(dec.u32()?),
            "start" => start = Some(dec.u32()?),
            "end" => end = Some(dec.u32()?),
            _ => dec.skip()?,
        }
    }

    Ok(Context {
        fingerprint: fingerprint.ok_or(WireError::MissingField("fp"))?,
        parent,
        start: start.ok_or(WireError::MissingField("start"))?,
        end: end.ok_or(WireError::MissingField("end"))?,
    })
}

fn decode_map_len(dec: &mut Decoder) -> Result<u64, WireError> {
    dec.map()?.ok_or(WireError::IndefiniteLength)
}

fn decode_array_len(dec: &mut Decoder) -> Result<u64, WireError> {
    dec.array()?.ok_or(WireError::IndefiniteLength)
}

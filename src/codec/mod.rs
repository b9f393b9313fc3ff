//! Codec: typed values to descriptor sequences and back.

mod decode;
mod descriptor;
mod encode;
mod error;
mod object;
mod protocol;
mod wire;

pub use decode::{Decoder, LocalPayloadSource, PayloadSource, decode, decode_local};
pub use descriptor::{Context, Descriptor, RemoteBuffer};
pub use encode::{DEFAULT_EAGER_THRESHOLD, Encoder, EncodingOptions, encode};
pub use error::CodecError;
pub use object::{ContextToken, EncodedObject, ObjectBuilder};
pub use protocol::Codable;
pub use wire::{WireError, decode_object, encode_object};

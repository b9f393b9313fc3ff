#![forbid(unsafe_code)]

//! weft: the remote-object plane of a distributed dataflow runtime.
//!
//! Typed values are serialized into relocatable descriptor sequences,
//! registered in a local table with reference-counted ownership,
//! referenced by peers across a zero-copy fabric, and reclaimed when
//! every remote borrow has been released.

pub mod codec;
pub mod config;
pub mod core;
pub mod data_plane;
pub mod error;
pub mod memory;
pub mod remote;
pub mod runtime;
pub mod telemetry;
pub mod test_harness;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working set at the crate root for convenience.
pub use crate::codec::{
    Codable, CodecError, Context, Decoder, Descriptor, EncodedObject, Encoder, EncodingOptions,
    LocalPayloadSource, PayloadSource, RemoteBuffer, decode, decode_local, decode_object, encode,
    encode_object,
};
pub use crate::config::Config;
pub use crate::core::{
    InstanceId, Limits, MemoryKind, ObjectId, RegionCookie, TypeFingerprint, WorkerAddress,
};
pub use crate::data_plane::{
    DataPlane, DataPlaneError, FabricEndpoint, FabricWorker, Request, RequestState,
};
pub use crate::memory::{BlockProvider, BlockView, MemoryBlock, MemoryError, Registration};
pub use crate::remote::{
    Manager, ManagerConfig, ManagerError, PullPayloadSource, RemoteDescriptor,
};
pub use crate::runtime::Runtime;

//! Core identity types and shared limits.

mod identity;
mod limits;

pub use identity::{
    InstanceId, MemoryKind, ObjectId, RegionCookie, TypeFingerprint, WorkerAddress,
};
pub use limits::Limits;

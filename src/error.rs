use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::data_plane::DataPlaneError;
use crate::memory::MemoryError;
use crate::remote::ManagerError;

/// Crate-level convenience error.
///
/// A thin wrapper over the per-capability errors; callers that care match
/// on the inner kinds.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    DataPlane(#[from] DataPlaneError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

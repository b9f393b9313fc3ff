//! Remote descriptors: handles, stored objects, and the manager.

mod handle;
mod manager;
mod pull;
mod storage;
mod wire;

pub use handle::RemoteDescriptor;
pub use manager::{Manager, ManagerConfig, ManagerError};
pub use pull::PullPayloadSource;
pub use storage::{DecrementOutcome, StoredObject};
pub use wire::{
    DECREMENT_WIRE_LEN, FrameError, HANDLE_WIRE_LEN, HandleParts, TransferError, decode_decrement,
    decode_handle, decode_transfer, encode_decrement, encode_handle, encode_transfer,
};

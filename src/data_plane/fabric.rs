//! Fabric capability traits.
//!
//! The data plane's sole external dependency. A fabric supplies tagged
//! send/receive with 64-bit tag matching, one-sided gets against
//! registered regions, active messages dispatched by id, and a progress
//! function that advances all in-flight operations. Completions must
//! never fire inline from the posting call; they fire exactly once, from
//! `progress`.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::core::{RegionCookie, WorkerAddress};
use crate::memory::BlockView;

/// Identifier of a posted fabric operation, usable for cancellation.
pub type OpId = u64;

/// Completion for operations that produce no payload.
pub type SendCompletion = Box<dyn FnOnce(Result<(), DataPlaneError>) + Send>;

/// Completion for operations that deliver bytes (receives, one-sided gets).
pub type DataCompletion = Box<dyn FnOnce(Result<Bytes, DataPlaneError>) + Send>;

/// Active-message handler. Runs on the progress thread: it must not block
/// on application locks or allocate unboundedly. The second argument is
/// the sender's worker address when the fabric can attribute it.
pub type ActiveMessageHandler = Box<dyn Fn(Bytes, Option<WorkerAddress>) + Send + Sync>;

/// Transport-level failures surfaced by the data plane.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DataPlaneError {
    #[error("fabric {op} failed: {reason}")]
    Fabric { op: &'static str, reason: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("peer {peer} is gone")]
    PeerGone { peer: WorkerAddress },

    #[error("unknown peer address {peer}")]
    UnknownPeer { peer: WorkerAddress },

    #[error("data plane is not running")]
    NotRunning,
}

/// A connection to one peer worker. Endpoints are created once per peer
/// and shared.
pub trait FabricEndpoint: Send + Sync {
    fn peer_address(&self) -> &WorkerAddress;
}

/// The progress-driven fabric worker.
///
/// `progress` returns the number of completions and deliveries performed;
/// it is the only place completions run, and the data plane serializes
/// calls to it.
pub trait FabricWorker: Send + Sync {
    /// Address other workers use to reach this one.
    fn address(&self) -> WorkerAddress;

    fn create_endpoint(
        &self,
        peer: &WorkerAddress,
    ) -> Result<Arc<dyn FabricEndpoint>, DataPlaneError>;

    /// Register a memory range for one-sided access. The returned cookie
    /// is opaque and transferable to peers inside remote-buffer
    /// descriptors.
    fn register_memory(&self, view: &BlockView) -> Result<RegionCookie, DataPlaneError>;

    fn deregister_memory(&self, cookie: &RegionCookie);

    fn send_tagged(
        &self,
        endpoint: &dyn FabricEndpoint,
        payload: Bytes,
        tag: u64,
        done: SendCompletion,
    ) -> OpId;

    /// Post a receive matching `(incoming_tag & mask) == (tag & mask)`.
    fn receive_tagged(&self, tag: u64, mask: u64, done: DataCompletion) -> OpId;

    /// One-sided read of `[offset, offset + len)` within the region the
    /// peer registered under `cookie`.
    fn rma_get(
        &self,
        endpoint: &dyn FabricEndpoint,
        cookie: &RegionCookie,
        offset: u64,
        len: u64,
        done: DataCompletion,
    ) -> OpId;

    fn send_active_message(
        &self,
        endpoint: &dyn FabricEndpoint,
        id: u32,
        payload: Bytes,
        done: SendCompletion,
    ) -> OpId;

    fn register_active_message(&self, id: u32, handler: ActiveMessageHandler);

    fn detach_active_message(&self, id: u32);

    /// Abort a pending operation. Returns false if the operation already
    /// completed; its completion still fires exactly once either way.
    fn cancel(&self, op: OpId) -> bool;

    /// Advance all in-flight operations, firing completions. Returns the
    /// amount of work done; 0 means idle.
    fn progress(&self) -> usize;
}

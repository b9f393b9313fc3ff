//! Data plane: fabric capability traits, requests, and the progress loop.

mod fabric;
mod request;
mod transient;
mod worker;

pub use fabric::{
    ActiveMessageHandler, DataCompletion, DataPlaneError, FabricEndpoint, FabricWorker, OpId,
    SendCompletion,
};
pub use request::{Request, RequestState};
pub use transient::{TransientBuffer, TransientPool};
pub use worker::DataPlane;

//! Consumer-side payload source: one-sided pulls from the producer.

use std::sync::Arc;

use bytes::Bytes;

use crate::codec::{CodecError, PayloadSource, RemoteBuffer};
use crate::data_plane::{DataPlane, DataPlaneError, FabricEndpoint};

/// Resolves remote-buffer descriptors by issuing RMA gets against the
/// producer's registered memory. `fetch` suspends the calling task until
/// the progress thread signals completion.
pub struct PullPayloadSource {
    data_plane: DataPlane,
    endpoint: Arc<dyn FabricEndpoint>,
}

impl PullPayloadSource {
    pub fn new(data_plane: DataPlane, endpoint: Arc<dyn FabricEndpoint>) -> Self {
        Self {
            data_plane,
            endpoint,
        }
    }

    fn pull(&self, remote: &RemoteBuffer) -> Result<Bytes, CodecError> {
        let request = self.data_plane.get_async(
            &self.endpoint,
            &remote.cookie,
            remote.offset,
            remote.len,
        );
        let payload = request.wait().map_err(CodecError::Fabric)?;
        payload.ok_or(CodecError::Fabric(DataPlaneError::Fabric {
            op: "rma_get",
            reason: "completion delivered no payload".into(),
        }))
    }
}

impl PayloadSource for PullPayloadSource {
    fn fetch(&self, remote: &RemoteBuffer) -> Result<Bytes, CodecError> {
        let payload = self.pull(remote)?;
        // No destination view was known at post time: stage through the
        // transient pool when a buffer is free and the payload fits.
        let pool = self.data_plane.transient_pool();
        if payload.len() <= pool.buffer_size()
            && let Some(mut staging) = pool.checkout()
        {
            return Ok(staging.stage(&payload));
        }
        Ok(payload)
    }

    fn fetch_into(&self, remote: &RemoteBuffer, dst: &mut [u8]) -> Result<(), CodecError> {
        if dst.len() != remote.len as usize {
            return Err(CodecError::ShortWrite {
                need: remote.len as usize,
                have: dst.len(),
            });
        }
        let payload = self.pull(remote)?;
        dst.copy_from_slice(&payload);
        Ok(())
    }
}

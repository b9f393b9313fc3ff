//! Service lifecycle glue: wiring the provider, data plane, and manager.

use std::sync::Arc;

use bytes::Bytes;

use crate::codec::{Codable, EncodedObject, encode};
use crate::config::Config;
use crate::core::{InstanceId, WorkerAddress};
use crate::data_plane::{DataPlane, FabricWorker, Request};
use crate::memory::BlockProvider;
use crate::remote::{Manager, ManagerConfig, RemoteDescriptor};
use crate::{Error, Result};

/// One instance of the remote-object plane over an injected fabric.
///
/// Start order matters: the data plane's progress loop comes up before
/// the manager registers its active-message handler. Shutdown reverses
/// it: the manager runs its mandated drain sequence first, then the
/// progress loop stops.
pub struct Runtime {
    config: Config,
    instance_id: InstanceId,
    provider: BlockProvider,
    data_plane: DataPlane,
    manager: Manager,
}

impl Runtime {
    pub fn build(config: Config, instance_id: InstanceId, worker: Arc<dyn FabricWorker>) -> Self {
        let provider = BlockProvider::new(Arc::clone(&worker));
        let data_plane = DataPlane::new(
            worker,
            config.transient_pool_size,
            config.transient_pool_count,
        );
        let manager = Manager::new(
            ManagerConfig {
                instance_id,
                active_message_id: config.active_message_id,
                decrement_channel_capacity: config.decrement_channel_capacity,
                limits: config.limits.clone(),
            },
            data_plane.clone(),
        );
        Self {
            config,
            instance_id,
            provider,
            data_plane,
            manager,
        }
    }

    pub fn start(&self) {
        self.data_plane.start();
        self.manager.start();
        tracing::info!(instance = %self.instance_id, address = %self.address(), "runtime started");
    }

    pub fn shutdown(&self) {
        self.manager.shutdown();
        self.data_plane.stop();
        tracing::info!(instance = %self.instance_id, "runtime stopped");
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn address(&self) -> WorkerAddress {
        self.data_plane.address()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn provider(&self) -> &BlockProvider {
        &self.provider
    }

    pub fn data_plane(&self) -> &DataPlane {
        &self.data_plane
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    pub fn add_peer(&self, instance: InstanceId, address: &WorkerAddress) -> Result<()> {
        self.manager.add_peer(instance, address).map_err(Error::from)
    }

    /// Serialize a value with this runtime's provider and threshold.
    pub fn encode_value<T: Codable>(&self, value: &T) -> Result<EncodedObject> {
        encode(
            value,
            self.instance_id,
            &self.provider,
            self.config.encoding_options(),
        )
        .map_err(Error::from)
    }

    /// Encode and publish in one step.
    pub fn publish_value<T: Codable>(
        &self,
        value: &T,
        initial_tokens: u64,
    ) -> Result<RemoteDescriptor> {
        let object = self.encode_value(value)?;
        self.manager
            .publish(object, initial_tokens)
            .map_err(Error::from)
    }

    /// Export a handle to `peer` and post the framed transfer on `tag`.
    pub fn send_transfer(
        &self,
        handle: RemoteDescriptor,
        peer: InstanceId,
        tag: u64,
    ) -> Result<Arc<Request>> {
        let frame = self.manager.export_transfer(handle, peer)?;
        let endpoint = self.manager.peer_endpoint(peer)?;
        Ok(self.data_plane.send_async(&endpoint, frame, tag))
    }

    /// Receive one transfer frame on `tag` (exact match) and import it.
    /// Blocks the calling task until the frame arrives.
    pub fn receive_transfer(
        &self,
        tag: u64,
    ) -> Result<(RemoteDescriptor, Arc<EncodedObject>)> {
        let request = self.data_plane.receive_async(tag, u64::MAX);
        let payload: Bytes = request.wait().map_err(Error::from)?.unwrap_or_default();
        self.manager.import_transfer(&payload).map_err(Error::from)
    }
}

//! Remote-descriptor manager: ownership, token counts, and reclamation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, TrySendError};
use thiserror::Error;

use crate::codec::EncodedObject;
use crate::core::{InstanceId, Limits, ObjectId, WorkerAddress};
use crate::data_plane::{DataPlane, DataPlaneError, FabricEndpoint};

use super::handle::{HandleReleaser, RemoteDescriptor};
use super::pull::PullPayloadSource;
use super::storage::{DecrementOutcome, StoredObject};
use super::wire::{self, TransferError};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("object {object} not found")]
    NotFound { object: ObjectId },

    #[error("decrement of {requested} exceeds {held} outstanding tokens for {object}")]
    OverRelease {
        object: ObjectId,
        held: u64,
        requested: u64,
    },

    #[error("publish requires at least one token")]
    InvalidTokenCount,

    #[error("manager is shutting down")]
    ShuttingDown,

    #[error("no endpoint registered for peer instance {peer}")]
    UnknownPeerInstance { peer: InstanceId },

    #[error("handle names instance {instance}, not this one")]
    ForeignHandle { instance: InstanceId },

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    DataPlane(#[from] DataPlaneError),
}

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub instance_id: InstanceId,
    /// Active-message id used for decrements; must match across peers.
    pub active_message_id: u32,
    pub decrement_channel_capacity: usize,
    pub limits: Limits,
}

struct DecrementMessage {
    object: ObjectId,
    tokens: u64,
    origin_addr: Option<WorkerAddress>,
}

#[derive(Default)]
struct PeerRegistry {
    by_instance: BTreeMap<InstanceId, Arc<dyn FabricEndpoint>>,
    by_address: BTreeMap<WorkerAddress, InstanceId>,
}

struct ManagerState {
    stored: BTreeMap<ObjectId, StoredObject>,
    next_object_id: u64,
}

/// Owns stored encoded objects, mints handles, and processes global
/// reference-count decrements.
///
/// Active messages delivered on the fabric progress thread are never
/// processed inline: the handler forwards them through a bounded channel
/// to a dedicated decrement task, so the progress thread never blocks on
/// the manager lock.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    instance_id: InstanceId,
    active_message_id: u32,
    decrement_channel_capacity: usize,
    limits: Limits,
    data_plane: DataPlane,
    state: Mutex<ManagerState>,
    peers: Mutex<PeerRegistry>,
    decrement_tx: Mutex<Option<Sender<DecrementMessage>>>,
    handler: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl Manager {
    pub fn new(config: ManagerConfig, data_plane: DataPlane) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                instance_id: config.instance_id,
                active_message_id: config.active_message_id,
                decrement_channel_capacity: config.decrement_channel_capacity,
                limits: config.limits,
                data_plane,
                state: Mutex::new(ManagerState {
                    stored: BTreeMap::new(),
                    next_object_id: 1,
                }),
                peers: Mutex::new(PeerRegistry::default()),
                decrement_tx: Mutex::new(None),
                handler: Mutex::new(None),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.inner.instance_id
    }

    /// Number of live stored objects.
    pub fn size(&self) -> usize {
        self.inner.state.lock().expect("manager state poisoned").stored.len()
    }

    pub fn limits(&self) -> &Limits {
        &self.inner.limits
    }

    /// Register the decrement active-message handler and spawn the
    /// decrement handler task. Idempotent.
    pub fn start(&self) {
        let mut handler = self.inner.handler.lock().expect("manager handler poisoned");
        if handler.is_some() {
            return;
        }

        let (tx, rx): (Sender<DecrementMessage>, Receiver<DecrementMessage>) =
            crossbeam::channel::bounded(self.inner.decrement_channel_capacity);
        *self.inner.decrement_tx.lock().expect("decrement tx poisoned") = Some(tx.clone());

        // The active-message handler runs on the progress thread: it only
        // parses 16 bytes and posts to the channel.
        self.inner.data_plane.register_active_message(
            self.inner.active_message_id,
            Box::new(move |payload, sender| {
                let (object, tokens) = match wire::decode_decrement(&payload) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        tracing::warn!("malformed decrement active message: {err}");
                        return;
                    }
                };
                match tx.try_send(DecrementMessage {
                    object,
                    tokens,
                    origin_addr: sender,
                }) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(
                            object = %object,
                            tokens,
                            "decrement channel full; dropping decrement"
                        );
                    }
                    Err(TrySendError::Disconnected(_)) => {}
                }
            }),
        );

        let inner = Arc::clone(&self.inner);
        *handler = Some(
            std::thread::Builder::new()
                .name("weft-decrement".into())
                .spawn(move || {
                    for message in rx.iter() {
                        inner.handle_decrement_message(message);
                    }
                })
                .expect("spawn decrement handler"),
        );
        tracing::debug!(instance = %self.inner.instance_id, "remote descriptor manager started");
    }

    /// Shutdown sequence (mandatory order): detach the active-message
    /// handler, close the decrement channel, join the handler task, then
    /// force-release anything still stored.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);

        self.inner
            .data_plane
            .detach_active_message(self.inner.active_message_id);

        self.inner
            .decrement_tx
            .lock()
            .expect("decrement tx poisoned")
            .take();

        let handler = self.inner.handler.lock().expect("manager handler poisoned").take();
        if let Some(handler) = handler {
            let _ = handler.join();
        }

        let mut state = self.inner.state.lock().expect("manager state poisoned");
        if !state.stored.is_empty() {
            tracing::warn!(
                instance = %self.inner.instance_id,
                remaining = state.stored.len(),
                "stored objects outstanding at shutdown; releasing forcibly"
            );
            state.stored.clear();
        }
    }

    /// Make `peer` reachable for decrement traffic and pulls.
    pub fn add_peer(
        &self,
        peer: InstanceId,
        address: &WorkerAddress,
    ) -> Result<(), ManagerError> {
        let endpoint = self.inner.data_plane.endpoint(address)?;
        let mut peers = self.inner.peers.lock().expect("peer registry poisoned");
        peers.by_instance.insert(peer, endpoint);
        peers.by_address.insert(address.clone(), peer);
        Ok(())
    }

    /// Take ownership of an encoded object and mint its first handle.
    pub fn publish(
        &self,
        object: EncodedObject,
        initial_tokens: u64,
    ) -> Result<RemoteDescriptor, ManagerError> {
        if initial_tokens == 0 {
            return Err(ManagerError::InvalidTokenCount);
        }
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(ManagerError::ShuttingDown);
        }

        let object_id = {
            let mut state = self.inner.state.lock().expect("manager state poisoned");
            let object_id = ObjectId::new(state.next_object_id);
            state.next_object_id += 1;
            state
                .stored
                .insert(object_id, StoredObject::new(Arc::new(object), initial_tokens));
            object_id
        };
        tracing::debug!(object = %object_id, tokens = initial_tokens, "published encoded object");

        Ok(RemoteDescriptor::new(
            self.inner.instance_id,
            object_id,
            initial_tokens,
            Arc::clone(&self.inner) as Arc<dyn HandleReleaser>,
        ))
    }

    /// Encoding of a stored object, for local decode paths and for
    /// serving remote pulls.
    pub fn lookup(&self, object: ObjectId) -> Result<Arc<EncodedObject>, ManagerError> {
        let state = self.inner.state.lock().expect("manager state poisoned");
        state
            .stored
            .get(&object)
            .map(|stored| Arc::clone(stored.object()))
            .ok_or(ManagerError::NotFound { object })
    }

    /// Apply a decrement now, on the caller's thread.
    pub fn decrement(
        &self,
        object: ObjectId,
        tokens: u64,
        origin: Option<InstanceId>,
    ) -> Result<(), ManagerError> {
        self.inner.apply_decrement(object, tokens, origin).map(|_| ())
    }

    /// Release a handle explicitly. Equivalent to dropping it.
    pub fn release_handle(&self, handle: RemoteDescriptor) {
        handle.release();
    }

    /// Move a handle's tokens onto the wire for `peer`: records the
    /// export in the object's per-peer ledger and returns the framed
    /// transfer message (handle + object layout).
    ///
    /// On failure the accounting is untouched: the handle is consumed
    /// and releases its tokens normally, so the total and the ledger
    /// stay consistent.
    pub fn export_transfer(
        &self,
        handle: RemoteDescriptor,
        peer: InstanceId,
    ) -> Result<Bytes, ManagerError> {
        if handle.instance() != self.inner.instance_id {
            return Err(ManagerError::ForeignHandle {
                instance: handle.instance(),
            });
        }
        let parts = handle.parts();
        let layout = self.lookup(parts.object)?;

        // Encode before touching the ledger. A frame over the size
        // limit must not leave `peer` credited with tokens the dropped
        // handle then releases locally.
        let frame = wire::encode_transfer(&parts, &layout, self.inner.limits.max_frame_bytes)?;

        {
            let mut state = self.inner.state.lock().expect("manager state poisoned");
            let Some(stored) = state.stored.get_mut(&parts.object) else {
                return Err(ManagerError::NotFound {
                    object: parts.object,
                });
            };
            stored.record_export(peer, parts.tokens);
        }
        handle.forget();
        Ok(frame)
    }

    /// Forward a handle received from elsewhere. The object layout must
    /// accompany it, since only the producer stores it. The producer's
    /// ledger still attributes these tokens to this instance.
    pub fn reexport_transfer(
        &self,
        handle: RemoteDescriptor,
        layout: &EncodedObject,
    ) -> Result<Bytes, ManagerError> {
        let parts = handle.parts();
        let frame = wire::encode_transfer(&parts, layout, self.inner.limits.max_frame_bytes)?;
        handle.forget();
        Ok(frame)
    }

    /// Receive a transfer message: yields a live handle (its drop will
    /// notify the producer) and the object layout for decoding.
    pub fn import_transfer(
        &self,
        frame: &[u8],
    ) -> Result<(RemoteDescriptor, Arc<EncodedObject>), ManagerError> {
        let (parts, object) = wire::decode_transfer(frame, &self.inner.limits)?;
        let handle = RemoteDescriptor::new(
            parts.instance,
            parts.object,
            parts.tokens,
            Arc::clone(&self.inner) as Arc<dyn HandleReleaser>,
        );
        Ok((handle, Arc::new(object)))
    }

    /// Endpoint registered for `peer`.
    pub fn peer_endpoint(
        &self,
        peer: InstanceId,
    ) -> Result<Arc<dyn FabricEndpoint>, ManagerError> {
        let peers = self.inner.peers.lock().expect("peer registry poisoned");
        peers
            .by_instance
            .get(&peer)
            .cloned()
            .ok_or(ManagerError::UnknownPeerInstance { peer })
    }

    /// Payload source pulling from `producer`'s registered memory.
    pub fn pull_source(&self, producer: InstanceId) -> Result<PullPayloadSource, ManagerError> {
        let endpoint = {
            let peers = self.inner.peers.lock().expect("peer registry poisoned");
            peers.by_instance.get(&producer).cloned()
        };
        let endpoint = endpoint.ok_or(ManagerError::UnknownPeerInstance { peer: producer })?;
        Ok(PullPayloadSource::new(self.inner.data_plane.clone(), endpoint))
    }

    /// A peer died: release every token its ledger entries still hold.
    /// Returns the number of objects erased.
    pub fn peer_gone(&self, peer: InstanceId) -> usize {
        let mut erased = 0;
        let mut state = self.inner.state.lock().expect("manager state poisoned");
        let ids: Vec<ObjectId> = state.stored.keys().copied().collect();
        for id in ids {
            let Some(stored) = state.stored.get_mut(&id) else {
                continue;
            };
            let tokens = stored.take_ledger(peer);
            if tokens == 0 {
                continue;
            }
            tracing::warn!(
                object = %id,
                %peer,
                tokens,
                "releasing tokens held by dead peer"
            );
            match stored.apply_decrement(tokens, None) {
                DecrementOutcome::Remaining(_) => {}
                DecrementOutcome::Released => {
                    state.stored.remove(&id);
                    erased += 1;
                }
                DecrementOutcome::OverRelease { held, requested } => {
                    tracing::error!(
                        object = %id,
                        held,
                        requested,
                        "ledger exceeded outstanding tokens; erasing object"
                    );
                    state.stored.remove(&id);
                    erased += 1;
                }
            }
        }
        erased
    }
}

impl ManagerInner {
    fn handle_decrement_message(&self, message: DecrementMessage) {
        let origin = message.origin_addr.and_then(|addr| {
            self.peers
                .lock()
                .expect("peer registry poisoned")
                .by_address
                .get(&addr)
                .copied()
        });
        if let Err(err) = self.apply_decrement(message.object, message.tokens, origin) {
            tracing::error!(
                object = %message.object,
                tokens = message.tokens,
                "decrement failed: {err}"
            );
        }
    }

    fn apply_decrement(
        &self,
        object: ObjectId,
        tokens: u64,
        origin: Option<InstanceId>,
    ) -> Result<u64, ManagerError> {
        let mut state = self.state.lock().expect("manager state poisoned");
        let Some(stored) = state.stored.get_mut(&object) else {
            // An id we assigned but no longer store was released or
            // poisoned. Ids are never reused, so it stays that way:
            // every further decrement lands here and fails.
            if (1..state.next_object_id).contains(&object.get()) {
                return Err(ManagerError::OverRelease {
                    object,
                    held: 0,
                    requested: tokens,
                });
            }
            return Err(ManagerError::NotFound { object });
        };

        match stored.apply_decrement(tokens, origin) {
            DecrementOutcome::Remaining(remaining) => Ok(remaining),
            DecrementOutcome::Released => {
                state.stored.remove(&object);
                tracing::debug!(object = %object, "token count reached zero; object erased");
                Ok(0)
            }
            // Poisoning: the storage is force-released, and the
            // never-reused id keeps rejecting lookups and decrements.
            DecrementOutcome::OverRelease { held, requested } => {
                state.stored.remove(&object);
                Err(ManagerError::OverRelease {
                    object,
                    held,
                    requested,
                })
            }
        }
    }
}

impl HandleReleaser for ManagerInner {
    fn route_release(&self, instance: InstanceId, object: ObjectId, tokens: u64) {
        if instance == self.instance_id {
            let tx = self
                .decrement_tx
                .lock()
                .expect("decrement tx poisoned")
                .clone();
            match tx {
                Some(tx) => match tx.try_send(DecrementMessage {
                    object,
                    tokens,
                    origin_addr: None,
                }) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(
                            object = %object,
                            tokens,
                            "decrement channel full; dropping local release"
                        );
                    }
                    Err(TrySendError::Disconnected(_)) => {}
                },
                // Not started: apply inline rather than lose the tokens.
                None => {
                    if self.shutdown.load(Ordering::Acquire) {
                        tracing::debug!(object = %object, "release after shutdown ignored");
                    } else if let Err(err) = self.apply_decrement(object, tokens, None) {
                        tracing::error!(object = %object, "inline release failed: {err}");
                    }
                }
            }
            return;
        }

        let endpoint = {
            let peers = self.peers.lock().expect("peer registry poisoned");
            peers.by_instance.get(&instance).cloned()
        };
        let Some(endpoint) = endpoint else {
            tracing::warn!(%instance, object = %object, "no endpoint for owner; dropping release");
            return;
        };
        let payload = Bytes::copy_from_slice(&wire::encode_decrement(object, tokens));
        self.data_plane.worker().send_active_message(
            endpoint.as_ref(),
            self.active_message_id,
            payload,
            Box::new(move |result| {
                // Internal decrement traffic is fire-and-forget; a dead
                // owner reclaims through its peer-gone path.
                if let Err(err) = result {
                    tracing::warn!(object = %object, "decrement active message failed: {err}");
                }
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{EncodingOptions, encode};
    use crate::data_plane::FabricWorker;
    use crate::memory::BlockProvider;
    use crate::test_harness::LoopbackFabric;

    fn manager() -> (Manager, BlockProvider) {
        let fabric = LoopbackFabric::new();
        let worker = fabric.create_worker();
        let provider = BlockProvider::new(Arc::clone(&worker) as Arc<dyn FabricWorker>);
        let data_plane = DataPlane::new(worker, 1024, 2);
        let manager = Manager::new(
            ManagerConfig {
                instance_id: InstanceId::new(1),
                active_message_id: 0x4454,
                decrement_channel_capacity: 16,
                limits: Limits::default(),
            },
            data_plane,
        );
        (manager, provider)
    }

    fn publish_value(manager: &Manager, provider: &BlockProvider, tokens: u64) -> RemoteDescriptor {
        let object = encode(
            &42u32,
            manager.instance_id(),
            provider,
            EncodingOptions::default(),
        )
        .unwrap();
        manager.publish(object, tokens).unwrap()
    }

    #[test]
    fn publish_lookup_release_cycle() {
        let (manager, provider) = manager();
        let handle = publish_value(&manager, &provider, 1);
        let object_id = handle.object();

        assert_eq!(manager.size(), 1);
        assert!(manager.lookup(object_id).is_ok());

        drop(handle);
        assert_eq!(manager.size(), 0);
        assert!(matches!(
            manager.lookup(object_id),
            Err(ManagerError::NotFound { .. })
        ));
    }

    #[test]
    fn publish_with_zero_tokens_is_rejected() {
        let (manager, provider) = manager();
        let object = encode(
            &1u32,
            manager.instance_id(),
            &provider,
            EncodingOptions::default(),
        )
        .unwrap();
        assert!(matches!(
            manager.publish(object, 0),
            Err(ManagerError::InvalidTokenCount)
        ));
    }

    #[test]
    fn over_release_poisons_the_id() {
        let (manager, provider) = manager();
        let handle = publish_value(&manager, &provider, 1);
        let object_id = handle.object();

        manager.decrement(object_id, 1, None).unwrap();
        let err = manager.decrement(object_id, 1, None).unwrap_err();
        assert!(matches!(err, ManagerError::OverRelease { .. }));
        assert!(matches!(
            manager.lookup(object_id),
            Err(ManagerError::NotFound { .. })
        ));

        handle.forget();
    }

    #[test]
    fn decrement_of_never_published_id_is_not_found() {
        let (manager, _provider) = manager();
        assert!(matches!(
            manager.decrement(ObjectId::new(99), 1, None),
            Err(ManagerError::NotFound { .. })
        ));
    }

    #[test]
    fn oversized_decrement_poisons_and_erases() {
        let (manager, provider) = manager();
        let handle = publish_value(&manager, &provider, 2);
        let object_id = handle.object();

        let err = manager.decrement(object_id, 3, None).unwrap_err();
        assert!(matches!(
            err,
            ManagerError::OverRelease {
                held: 2,
                requested: 3,
                ..
            }
        ));
        assert_eq!(manager.size(), 0);
        handle.forget();
    }

    #[test]
    fn shutdown_forces_release_of_leftovers() {
        let (manager, provider) = manager();
        let handle = publish_value(&manager, &provider, 2);
        handle.forget();

        manager.start();
        assert_eq!(manager.size(), 1);
        manager.shutdown();
        assert_eq!(manager.size(), 0);

        let object = encode(
            &1u32,
            manager.instance_id(),
            &provider,
            EncodingOptions::default(),
        )
        .unwrap();
        assert!(matches!(
            manager.publish(object, 1),
            Err(ManagerError::ShuttingDown)
        ));
    }

    #[test]
    fn failed_export_leaves_accounting_consistent() {
        use super::super::wire::FrameError;

        let fabric = LoopbackFabric::new();
        let worker = fabric.create_worker();
        let provider = BlockProvider::new(Arc::clone(&worker) as Arc<dyn FabricWorker>);
        let data_plane = DataPlane::new(worker, 1024, 2);
        let manager = Manager::new(
            ManagerConfig {
                instance_id: InstanceId::new(1),
                active_message_id: 0x4454,
                decrement_channel_capacity: 16,
                limits: Limits {
                    // Far below any real transfer frame.
                    max_frame_bytes: 16,
                    ..Limits::default()
                },
            },
            data_plane,
        );

        let mut handle = publish_value(&manager, &provider, 2);
        let object_id = handle.object();
        let peer = InstanceId::new(2);

        let split = handle.split(1).unwrap();
        let err = manager.export_transfer(split, peer).unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Transfer(TransferError::Frame(FrameError::FrameTooLarge { .. }))
        ));

        // The split token was released on the error path; the ledger
        // never credited the peer, so nothing phantom remains.
        assert_eq!(manager.size(), 1);
        assert_eq!(manager.peer_gone(peer), 0);
        assert!(manager.lookup(object_id).is_ok());

        // The remaining token still accounts for the object exactly.
        drop(handle);
        assert_eq!(manager.size(), 0);
    }

    #[test]
    fn export_records_ledger_and_disarms_handle() {
        let (manager, provider) = manager();
        let handle = publish_value(&manager, &provider, 3);
        let object_id = handle.object();
        let peer = InstanceId::new(2);

        let frame = manager.export_transfer(handle, peer).unwrap();
        assert!(!frame.is_empty());
        // Tokens moved to the wire, nothing released.
        assert_eq!(manager.size(), 1);

        let released = manager.peer_gone(peer);
        assert_eq!(released, 1);
        assert!(matches!(
            manager.lookup(object_id),
            Err(ManagerError::NotFound { .. })
        ));
    }
}

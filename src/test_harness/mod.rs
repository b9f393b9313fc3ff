//! In-process loopback fabric for tests.
//!
//! Implements the full fabric capability set over shared memory: tagged
//! send/receive with mask matching, one-sided gets against registered
//! regions, active messages with sender attribution, and cancellation.
//! Completions never fire inline from a posting call; they are queued and
//! run only from `progress`, matching the no-immediate-completion
//! contract real fabrics are configured for. Delivery per peer is FIFO.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::core::{RegionCookie, WorkerAddress};
use crate::data_plane::{
    ActiveMessageHandler, DataCompletion, DataPlaneError, FabricEndpoint, FabricWorker, OpId,
    SendCompletion,
};
use crate::memory::BlockView;

/// A process-local fabric; every worker created from the same fabric can
/// reach the others by address.
#[derive(Clone)]
pub struct LoopbackFabric {
    shared: Arc<FabricShared>,
}

struct FabricShared {
    workers: Mutex<BTreeMap<WorkerAddress, Arc<WorkerState>>>,
    next_worker: AtomicU64,
    next_cookie: AtomicU64,
    next_op: AtomicU64,
}

struct WorkerState {
    address: WorkerAddress,
    alive: AtomicBool,
    inner: Mutex<WorkerInner>,
    am_handlers: Mutex<BTreeMap<u32, ActiveMessageHandler>>,
}

#[derive(Default)]
struct WorkerInner {
    ready: VecDeque<ReadyOp>,
    unmatched_sends: VecDeque<StashedSend>,
    posted_recvs: Vec<PostedRecv>,
    regions: BTreeMap<RegionCookie, Bytes>,
}

enum ReadyOp {
    Send {
        done: SendCompletion,
        result: Result<(), DataPlaneError>,
    },
    Data {
        done: DataCompletion,
        result: Result<Bytes, DataPlaneError>,
    },
    ActiveMessage {
        id: u32,
        payload: Bytes,
        sender: WorkerAddress,
    },
}

struct StashedSend {
    tag: u64,
    payload: Bytes,
}

struct PostedRecv {
    op: OpId,
    tag: u64,
    mask: u64,
    done: DataCompletion,
}

impl LoopbackFabric {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(FabricShared {
                workers: Mutex::new(BTreeMap::new()),
                next_worker: AtomicU64::new(1),
                next_cookie: AtomicU64::new(1),
                next_op: AtomicU64::new(1),
            }),
        }
    }

    pub fn create_worker(&self) -> Arc<LoopbackWorker> {
        let id = self.shared.next_worker.fetch_add(1, Ordering::Relaxed);
        let address = WorkerAddress::new(format!("loopback-{id}"));
        let state = Arc::new(WorkerState {
            address: address.clone(),
            alive: AtomicBool::new(true),
            inner: Mutex::new(WorkerInner::default()),
            am_handlers: Mutex::new(BTreeMap::new()),
        });
        self.shared
            .workers
            .lock()
            .expect("fabric workers poisoned")
            .insert(address, Arc::clone(&state));
        Arc::new(LoopbackWorker {
            shared: Arc::clone(&self.shared),
            state,
        })
    }

    /// Simulate a peer crash: the worker stops accepting traffic and its
    /// registered memory disappears. Subsequent operations targeting it
    /// fail with `PeerGone`.
    pub fn kill(&self, address: &WorkerAddress) {
        let workers = self.shared.workers.lock().expect("fabric workers poisoned");
        if let Some(state) = workers.get(address) {
            state.alive.store(false, Ordering::Release);
            let mut inner = state.inner.lock().expect("worker inner poisoned");
            inner.ready.clear();
            inner.unmatched_sends.clear();
            inner.posted_recvs.clear();
            inner.regions.clear();
        }
    }
}

struct LoopbackEndpoint {
    peer: WorkerAddress,
}

impl FabricEndpoint for LoopbackEndpoint {
    fn peer_address(&self) -> &WorkerAddress {
        &self.peer
    }
}

pub struct LoopbackWorker {
    shared: Arc<FabricShared>,
    state: Arc<WorkerState>,
}

impl LoopbackWorker {
    fn next_op(&self) -> OpId {
        self.shared.next_op.fetch_add(1, Ordering::Relaxed)
    }

    fn peer(&self, address: &WorkerAddress) -> Option<Arc<WorkerState>> {
        let workers = self.shared.workers.lock().expect("fabric workers poisoned");
        workers
            .get(address)
            .filter(|state| state.alive.load(Ordering::Acquire))
            .cloned()
    }

    fn push_ready(&self, op: ReadyOp) {
        self.state
            .inner
            .lock()
            .expect("worker inner poisoned")
            .ready
            .push_back(op);
    }
}

impl FabricWorker for LoopbackWorker {
    fn address(&self) -> WorkerAddress {
        self.state.address.clone()
    }

    fn create_endpoint(
        &self,
        peer: &WorkerAddress,
    ) -> Result<Arc<dyn FabricEndpoint>, DataPlaneError> {
        let workers = self.shared.workers.lock().expect("fabric workers poisoned");
        if !workers.contains_key(peer) {
            return Err(DataPlaneError::UnknownPeer { peer: peer.clone() });
        }
        Ok(Arc::new(LoopbackEndpoint { peer: peer.clone() }))
    }

    fn register_memory(&self, view: &BlockView) -> Result<RegionCookie, DataPlaneError> {
        let raw = self.shared.next_cookie.fetch_add(1, Ordering::Relaxed);
        let cookie = RegionCookie::new(Bytes::copy_from_slice(&raw.to_le_bytes()));
        self.state
            .inner
            .lock()
            .expect("worker inner poisoned")
            .regions
            .insert(cookie.clone(), view.bytes().clone());
        Ok(cookie)
    }

    fn deregister_memory(&self, cookie: &RegionCookie) {
        self.state
            .inner
            .lock()
            .expect("worker inner poisoned")
            .regions
            .remove(cookie);
    }

    fn send_tagged(
        &self,
        endpoint: &dyn FabricEndpoint,
        payload: Bytes,
        tag: u64,
        done: SendCompletion,
    ) -> OpId {
        let op = self.next_op();
        let Some(peer) = self.peer(endpoint.peer_address()) else {
            self.push_ready(ReadyOp::Send {
                done,
                result: Err(DataPlaneError::PeerGone {
                    peer: endpoint.peer_address().clone(),
                }),
            });
            return op;
        };

        {
            let mut peer_inner = peer.inner.lock().expect("worker inner poisoned");
            let matched = peer_inner
                .posted_recvs
                .iter()
                .position(|recv| (tag & recv.mask) == (recv.tag & recv.mask));
            match matched {
                Some(index) => {
                    let recv = peer_inner.posted_recvs.remove(index);
                    peer_inner.ready.push_back(ReadyOp::Data {
                        done: recv.done,
                        result: Ok(payload),
                    });
                }
                None => peer_inner
                    .unmatched_sends
                    .push_back(StashedSend { tag, payload }),
            }
        }

        self.push_ready(ReadyOp::Send {
            done,
            result: Ok(()),
        });
        op
    }

    fn receive_tagged(&self, tag: u64, mask: u64, done: DataCompletion) -> OpId {
        let op = self.next_op();
        let mut inner = self.state.inner.lock().expect("worker inner poisoned");
        let matched = inner
            .unmatched_sends
            .iter()
            .position(|send| (send.tag & mask) == (tag & mask));
        match matched {
            Some(index) => {
                let send = inner.unmatched_sends.remove(index).expect("index in range");
                inner.ready.push_back(ReadyOp::Data {
                    done,
                    result: Ok(send.payload),
                });
            }
            None => inner.posted_recvs.push(PostedRecv {
                op,
                tag,
                mask,
                done,
            }),
        }
        op
    }

    fn rma_get(
        &self,
        endpoint: &dyn FabricEndpoint,
        cookie: &RegionCookie,
        offset: u64,
        len: u64,
        done: DataCompletion,
    ) -> OpId {
        let op = self.next_op();
        let result = match self.peer(endpoint.peer_address()) {
            None => Err(DataPlaneError::PeerGone {
                peer: endpoint.peer_address().clone(),
            }),
            Some(peer) => {
                let inner = peer.inner.lock().expect("worker inner poisoned");
                match inner.regions.get(cookie) {
                    None => Err(DataPlaneError::Fabric {
                        op: "rma_get",
                        reason: "unknown region cookie".into(),
                    }),
                    Some(region) => {
                        let start = offset as usize;
                        let end = start.checked_add(len as usize);
                        match end {
                            Some(end) if end <= region.len() => Ok(region.slice(start..end)),
                            _ => Err(DataPlaneError::Fabric {
                                op: "rma_get",
                                reason: format!(
                                    "range [{offset}, +{len}) outside region of {} bytes",
                                    region.len()
                                ),
                            }),
                        }
                    }
                }
            }
        };
        self.push_ready(ReadyOp::Data { done, result });
        op
    }

    fn send_active_message(
        &self,
        endpoint: &dyn FabricEndpoint,
        id: u32,
        payload: Bytes,
        done: SendCompletion,
    ) -> OpId {
        let op = self.next_op();
        let Some(peer) = self.peer(endpoint.peer_address()) else {
            self.push_ready(ReadyOp::Send {
                done,
                result: Err(DataPlaneError::PeerGone {
                    peer: endpoint.peer_address().clone(),
                }),
            });
            return op;
        };

        peer.inner
            .lock()
            .expect("worker inner poisoned")
            .ready
            .push_back(ReadyOp::ActiveMessage {
                id,
                payload,
                sender: self.state.address.clone(),
            });
        self.push_ready(ReadyOp::Send {
            done,
            result: Ok(()),
        });
        op
    }

    fn register_active_message(&self, id: u32, handler: ActiveMessageHandler) {
        self.state
            .am_handlers
            .lock()
            .expect("am handlers poisoned")
            .insert(id, handler);
    }

    fn detach_active_message(&self, id: u32) {
        self.state
            .am_handlers
            .lock()
            .expect("am handlers poisoned")
            .remove(&id);
    }

    fn cancel(&self, op: OpId) -> bool {
        let mut inner = self.state.inner.lock().expect("worker inner poisoned");
        let Some(index) = inner.posted_recvs.iter().position(|recv| recv.op == op) else {
            return false;
        };
        let recv = inner.posted_recvs.remove(index);
        inner.ready.push_back(ReadyOp::Data {
            done: recv.done,
            result: Err(DataPlaneError::Cancelled),
        });
        true
    }

    fn progress(&self) -> usize {
        if !self.state.alive.load(Ordering::Acquire) {
            return 0;
        }
        let batch: Vec<ReadyOp> = {
            let mut inner = self.state.inner.lock().expect("worker inner poisoned");
            inner.ready.drain(..).collect()
        };
        let count = batch.len();
        for ready in batch {
            match ready {
                ReadyOp::Send { done, result } => done(result),
                ReadyOp::Data { done, result } => done(result),
                ReadyOp::ActiveMessage {
                    id,
                    payload,
                    sender,
                } => {
                    let handlers = self.state.am_handlers.lock().expect("am handlers poisoned");
                    match handlers.get(&id) {
                        Some(handler) => handler(payload, Some(sender)),
                        None => {
                            tracing::debug!(id, "active message with no registered handler")
                        }
                    }
                }
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn active_messages_deliver_in_fifo_order_with_sender() {
        let fabric = LoopbackFabric::new();
        let a = fabric.create_worker();
        let b = fabric.create_worker();

        let seen: Arc<StdMutex<Vec<(Bytes, Option<WorkerAddress>)>>> =
            Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        b.register_active_message(
            7,
            Box::new(move |payload, sender| {
                sink.lock().unwrap().push((payload, sender));
            }),
        );

        let ep = a.create_endpoint(&b.address()).unwrap();
        for index in 0..3u8 {
            a.send_active_message(
                ep.as_ref(),
                7,
                Bytes::copy_from_slice(&[index]),
                Box::new(|result| result.unwrap()),
            );
        }
        while a.progress() > 0 {}
        while b.progress() > 0 {}

        let sender_addr = a.address();
        let seen = seen.lock().unwrap();
        let payloads: Vec<u8> = seen.iter().map(|(payload, _)| payload[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2]);
        assert!(seen.iter().all(|(_, sender)| sender.as_ref() == Some(&sender_addr)));
    }

    #[test]
    fn rma_get_reads_registered_region() {
        let fabric = LoopbackFabric::new();
        let a = fabric.create_worker();
        let b = fabric.create_worker();

        let block = crate::memory::MemoryBlock::from_bytes(
            Bytes::from_static(b"0123456789"),
            crate::core::MemoryKind::Host,
        );
        let cookie = b.register_memory(&block.view()).unwrap();

        let ep = a.create_endpoint(&b.address()).unwrap();
        let result: Arc<StdMutex<Option<Result<Bytes, DataPlaneError>>>> =
            Arc::new(StdMutex::new(None));
        let sink = Arc::clone(&result);
        a.rma_get(
            ep.as_ref(),
            &cookie,
            2,
            4,
            Box::new(move |res| {
                *sink.lock().unwrap() = Some(res);
            }),
        );
        while a.progress() > 0 {}

        let got = result.lock().unwrap().take().unwrap().unwrap();
        assert_eq!(got, Bytes::from_static(b"2345"));
    }

    #[test]
    fn killed_peer_surfaces_peer_gone() {
        let fabric = LoopbackFabric::new();
        let a = fabric.create_worker();
        let b = fabric.create_worker();
        let ep = a.create_endpoint(&b.address()).unwrap();
        fabric.kill(&b.address());

        let result: Arc<StdMutex<Option<Result<(), DataPlaneError>>>> =
            Arc::new(StdMutex::new(None));
        let sink = Arc::clone(&result);
        a.send_tagged(
            ep.as_ref(),
            Bytes::from_static(b"void"),
            1,
            Box::new(move |res| {
                *sink.lock().unwrap() = Some(res);
            }),
        );
        while a.progress() > 0 {}

        assert!(matches!(
            result.lock().unwrap().take().unwrap(),
            Err(DataPlaneError::PeerGone { .. })
        ));
    }

    #[test]
    fn completions_fire_only_from_progress() {
        let fabric = LoopbackFabric::new();
        let a = fabric.create_worker();
        let b = fabric.create_worker();
        let ep = a.create_endpoint(&b.address()).unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        a.send_tagged(
            ep.as_ref(),
            Bytes::from_static(b"x"),
            1,
            Box::new(move |_| flag.store(true, Ordering::Release)),
        );
        assert!(!fired.load(Ordering::Acquire), "no immediate completion");
        while a.progress() > 0 {}
        assert!(fired.load(Ordering::Acquire));
    }
}

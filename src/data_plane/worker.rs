//! Data plane: progress loop and async operation surface over a fabric.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;

use crate::core::{RegionCookie, WorkerAddress};

use super::fabric::{ActiveMessageHandler, DataPlaneError, FabricEndpoint, FabricWorker};
use super::request::Request;
use super::transient::TransientPool;

const IDLE_BACKOFF: Duration = Duration::from_micros(50);

/// Wraps the injected fabric worker with endpoint caching, a progress
/// thread, and request-producing async operations.
///
/// The fabric's progress function is single-threaded by contract; every
/// caller goes through the progress gate, with the progress thread as the
/// primary driver. `flush` and `progress_now` interleave through the same
/// gate, so the contract holds even while the thread runs.
#[derive(Clone)]
pub struct DataPlane {
    inner: Arc<DataPlaneInner>,
}

struct DataPlaneInner {
    worker: Arc<dyn FabricWorker>,
    endpoints: Mutex<BTreeMap<WorkerAddress, Arc<dyn FabricEndpoint>>>,
    transient: TransientPool,
    progress_gate: Mutex<()>,
    shutdown: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DataPlane {
    pub fn new(
        worker: Arc<dyn FabricWorker>,
        transient_pool_size: usize,
        transient_pool_count: usize,
    ) -> Self {
        Self {
            inner: Arc::new(DataPlaneInner {
                worker,
                endpoints: Mutex::new(BTreeMap::new()),
                transient: TransientPool::new(transient_pool_size, transient_pool_count),
                progress_gate: Mutex::new(()),
                shutdown: AtomicBool::new(false),
                thread: Mutex::new(None),
            }),
        }
    }

    pub fn address(&self) -> WorkerAddress {
        self.inner.worker.address()
    }

    pub fn worker(&self) -> &Arc<dyn FabricWorker> {
        &self.inner.worker
    }

    pub fn transient_pool(&self) -> &TransientPool {
        &self.inner.transient
    }

    /// Spawn the progress thread. Idempotent.
    pub fn start(&self) {
        let mut thread = self.inner.thread.lock().expect("data plane thread poisoned");
        if thread.is_some() {
            return;
        }
        self.inner.shutdown.store(false, Ordering::Release);
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("weft-progress".into())
            .spawn(move || {
                while !inner.shutdown.load(Ordering::Acquire) {
                    if inner.progress_once() == 0 {
                        std::thread::sleep(IDLE_BACKOFF);
                    }
                }
            })
            .expect("spawn progress thread");
        *thread = Some(handle);
        tracing::debug!(address = %self.address(), "data plane progress thread started");
    }

    /// Stop and join the progress thread.
    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let handle = self.inner.thread.lock().expect("data plane thread poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
            tracing::debug!(address = %self.address(), "data plane progress thread stopped");
        }
    }

    /// Endpoint for `peer`, creating and caching it on first use.
    pub fn endpoint(
        &self,
        peer: &WorkerAddress,
    ) -> Result<Arc<dyn FabricEndpoint>, DataPlaneError> {
        let mut endpoints = self.inner.endpoints.lock().expect("endpoint cache poisoned");
        if let Some(endpoint) = endpoints.get(peer) {
            return Ok(Arc::clone(endpoint));
        }
        let endpoint = self.inner.worker.create_endpoint(peer)?;
        endpoints.insert(peer.clone(), Arc::clone(&endpoint));
        Ok(endpoint)
    }

    /// Drive the fabric once; returns the work-done count.
    pub fn progress_now(&self) -> usize {
        self.inner.progress_once()
    }

    /// Progress until the fabric reports idle. Returns the total work
    /// done, 0 on an already-idle worker.
    pub fn flush(&self) -> usize {
        let mut total = 0;
        loop {
            let done = self.inner.progress_once();
            if done == 0 {
                return total;
            }
            total += done;
        }
    }

    /// Post a tagged send. The payload is owned by the fabric until the
    /// completion fires.
    pub fn send_async(
        &self,
        endpoint: &Arc<dyn FabricEndpoint>,
        payload: Bytes,
        tag: u64,
    ) -> Arc<Request> {
        let request = Request::new();
        request.mark_running();
        let holder = Arc::clone(&request);
        let op = self.inner.worker.send_tagged(
            endpoint.as_ref(),
            payload,
            tag,
            Box::new(move |result| holder.complete(result.map(|()| None))),
        );
        self.attach_cancel(&request, op);
        request
    }

    /// Post a tagged receive matching `(tag, mask)`. The delivered bytes
    /// come back through `Request::wait`.
    pub fn receive_async(&self, tag: u64, mask: u64) -> Arc<Request> {
        let request = Request::new();
        request.mark_running();
        let holder = Arc::clone(&request);
        let op = self.inner.worker.receive_tagged(
            tag,
            mask,
            Box::new(move |result| holder.complete(result.map(Some))),
        );
        self.attach_cancel(&request, op);
        request
    }

    /// One-sided read against a peer's registered region.
    pub fn get_async(
        &self,
        endpoint: &Arc<dyn FabricEndpoint>,
        cookie: &RegionCookie,
        offset: u64,
        len: u64,
    ) -> Arc<Request> {
        let request = Request::new();
        request.mark_running();
        let holder = Arc::clone(&request);
        let op = self.inner.worker.rma_get(
            endpoint.as_ref(),
            cookie,
            offset,
            len,
            Box::new(move |result| holder.complete(result.map(Some))),
        );
        self.attach_cancel(&request, op);
        request
    }

    /// Post an active message to a peer.
    pub fn send_active_message(
        &self,
        endpoint: &Arc<dyn FabricEndpoint>,
        id: u32,
        payload: Bytes,
    ) -> Arc<Request> {
        let request = Request::new();
        request.mark_running();
        let holder = Arc::clone(&request);
        let op = self.inner.worker.send_active_message(
            endpoint.as_ref(),
            id,
            payload,
            Box::new(move |result| holder.complete(result.map(|()| None))),
        );
        self.attach_cancel(&request, op);
        request
    }

    pub fn register_active_message(&self, id: u32, handler: ActiveMessageHandler) {
        self.inner.worker.register_active_message(id, handler);
    }

    pub fn detach_active_message(&self, id: u32) {
        self.inner.worker.detach_active_message(id);
    }

    fn attach_cancel(&self, request: &Arc<Request>, op: super::fabric::OpId) {
        let worker = Arc::clone(&self.inner.worker);
        request.set_cancel_hook(Box::new(move || worker.cancel(op)));
    }
}

impl DataPlaneInner {
    fn progress_once(&self) -> usize {
        let _gate = self.progress_gate.lock().expect("progress gate poisoned");
        self.worker.progress()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_plane::RequestState;
    use crate::test_harness::LoopbackFabric;

    fn pair() -> (DataPlane, DataPlane) {
        let fabric = LoopbackFabric::new();
        let a = DataPlane::new(fabric.create_worker(), 1024, 2);
        let b = DataPlane::new(fabric.create_worker(), 1024, 2);
        (a, b)
    }

    #[test]
    fn tagged_send_receive_matches_on_masked_tag() {
        let (a, b) = pair();
        let ep = a.endpoint(&b.address()).unwrap();

        let recv = b.receive_async(0x10, 0xF0);
        let send = a.send_async(&ep, Bytes::from_static(b"tagged"), 0x17);

        a.flush();
        b.flush();

        assert_eq!(send.state(), RequestState::Completed);
        assert_eq!(recv.wait().unwrap().unwrap(), Bytes::from_static(b"tagged"));
    }

    #[test]
    fn flush_is_idempotent_when_idle() {
        let (a, _b) = pair();
        assert_eq!(a.flush(), 0);
        assert_eq!(a.flush(), 0);
    }

    #[test]
    fn cancel_pending_receive() {
        let (_a, b) = pair();
        let recv = b.receive_async(1, u64::MAX);
        recv.cancel();
        b.flush();
        assert_eq!(recv.state(), RequestState::Cancelled);
        assert_eq!(recv.wait(), Err(DataPlaneError::Cancelled));
    }

    #[test]
    fn endpoints_are_cached_per_peer() {
        let (a, b) = pair();
        let first = a.endpoint(&b.address()).unwrap();
        let second = a.endpoint(&b.address()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn progress_thread_completes_requests() {
        let (a, b) = pair();
        a.start();
        b.start();

        let ep = a.endpoint(&b.address()).unwrap();
        let recv = b.receive_async(7, u64::MAX);
        let send = a.send_async(&ep, Bytes::from_static(b"bg"), 7);

        assert_eq!(recv.wait().unwrap().unwrap(), Bytes::from_static(b"bg"));
        assert!(send.wait().is_ok());

        a.stop();
        b.stop();
    }
}

//! Memory block provider: allocation plus a refcounted registration cache.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;

use crate::core::{MemoryKind, RegionCookie};
use crate::data_plane::{DataPlaneError, FabricWorker};

use super::block::{BlockView, MemoryBlock};

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("fabric registration failed for {kind:?} range of {len} bytes")]
    RegistrationFailed {
        kind: MemoryKind,
        len: usize,
        #[source]
        source: DataPlaneError,
    },

    #[error("view of {len} bytes at {addr:#x} is not covered by registration {cookie:?}")]
    ViewOutsideRegion {
        addr: usize,
        len: usize,
        cookie: RegionCookie,
    },
}

/// Allocates memory blocks and registers memory ranges with the fabric.
///
/// Registrations are deduplicated by `(kind, address range)` and strictly
/// refcounted: a view inside an already-registered range reuses the cached
/// cookie, and the fabric-level registration is dropped only when the last
/// `Registration` guard goes away. There is no LRU.
#[derive(Clone)]
pub struct BlockProvider {
    inner: Arc<ProviderInner>,
}

struct ProviderInner {
    worker: Arc<dyn FabricWorker>,
    cache: Mutex<Vec<CacheEntry>>,
}

struct CacheEntry {
    kind: MemoryKind,
    start: usize,
    len: usize,
    cookie: RegionCookie,
    refs: usize,
    /// Pins the registered allocation for the registration's lifetime.
    region: Bytes,
}

impl BlockProvider {
    pub fn new(worker: Arc<dyn FabricWorker>) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                worker,
                cache: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Allocate a zero-filled block of the requested kind.
    pub fn allocate(&self, len: usize, kind: MemoryKind) -> MemoryBlock {
        MemoryBlock::zeroed(len, kind)
    }

    /// Register `view` with the fabric, or reuse a cached registration.
    ///
    /// The smallest cached registration fully enclosing the view is
    /// reused; `force_register` always creates a fresh fabric-level
    /// registration.
    pub fn register(
        &self,
        view: &BlockView,
        force_register: bool,
    ) -> Result<Registration, MemoryError> {
        let mut cache = self.inner.cache.lock().expect("registration cache poisoned");

        if !force_register
            && let Some(entry) = Self::smallest_enclosing(cache.as_mut_slice(), view)
        {
            entry.refs += 1;
            return Ok(Registration {
                inner: Arc::clone(&self.inner),
                kind: entry.kind,
                cookie: entry.cookie.clone(),
                start: entry.start,
                region: entry.region.clone(),
            });
        }

        let cookie = self.inner.worker.register_memory(view).map_err(|source| {
            MemoryError::RegistrationFailed {
                kind: view.kind(),
                len: view.len(),
                source,
            }
        })?;
        tracing::debug!(
            kind = ?view.kind(),
            len = view.len(),
            "registered memory range with fabric"
        );
        cache.push(CacheEntry {
            kind: view.kind(),
            start: view.addr(),
            len: view.len(),
            cookie: cookie.clone(),
            refs: 1,
            region: view.bytes().clone(),
        });
        Ok(Registration {
            inner: Arc::clone(&self.inner),
            kind: view.kind(),
            cookie,
            start: view.addr(),
            region: view.bytes().clone(),
        })
    }

    /// Current refcount of the registration covering `view`, 0 if none.
    /// Test observability hook.
    pub fn registration_refcount(&self, view: &BlockView) -> usize {
        let cache = self.inner.cache.lock().expect("registration cache poisoned");
        cache
            .iter()
            .filter(|entry| entry.encloses(view))
            .map(|entry| entry.refs)
            .sum()
    }

    /// Number of live fabric-level registrations. Test observability hook.
    pub fn registration_count(&self) -> usize {
        self.inner.cache.lock().expect("registration cache poisoned").len()
    }

    fn smallest_enclosing<'c>(
        cache: &'c mut [CacheEntry],
        view: &BlockView,
    ) -> Option<&'c mut CacheEntry> {
        cache
            .iter_mut()
            .filter(|entry| entry.encloses(view))
            .min_by_key(|entry| entry.len)
    }
}

impl CacheEntry {
    fn encloses(&self, view: &BlockView) -> bool {
        self.kind == view.kind()
            && self.start <= view.addr()
            && view.addr() + view.len() <= self.start + self.len
    }
}

impl ProviderInner {
    fn release(&self, cookie: &RegionCookie) {
        let mut cache = self.cache.lock().expect("registration cache poisoned");
        let Some(pos) = cache.iter().position(|entry| entry.cookie == *cookie) else {
            tracing::warn!(?cookie, "release of unknown registration");
            return;
        };
        cache[pos].refs -= 1;
        if cache[pos].refs == 0 {
            let entry = cache.swap_remove(pos);
            self.worker.deregister_memory(&entry.cookie);
            tracing::debug!(kind = ?entry.kind, len = entry.len, "deregistered memory range");
        }
    }
}

/// Refcount guard over a cached registration.
///
/// Cloning bumps the refcount; the fabric registration is released when
/// the last guard drops.
pub struct Registration {
    inner: Arc<ProviderInner>,
    kind: MemoryKind,
    cookie: RegionCookie,
    start: usize,
    region: Bytes,
}

impl Registration {
    pub fn cookie(&self) -> &RegionCookie {
        &self.cookie
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    /// Base address of the registered region.
    pub fn addr(&self) -> usize {
        self.start
    }

    /// The full registered region.
    pub fn region(&self) -> &Bytes {
        &self.region
    }

    /// Offset of `view` within the registered region.
    pub fn offset_of(&self, view: &BlockView) -> Result<u64, MemoryError> {
        let end = self.start + self.region.len();
        if view.addr() < self.start || view.addr() + view.len() > end {
            return Err(MemoryError::ViewOutsideRegion {
                addr: view.addr(),
                len: view.len(),
                cookie: self.cookie.clone(),
            });
        }
        Ok((view.addr() - self.start) as u64)
    }

    /// Read `[offset, offset + len)` of the registered region. Serves
    /// producer-local decodes and test assertions without another fabric
    /// round-trip.
    pub fn read(&self, offset: u64, len: u64) -> Option<Bytes> {
        let offset = usize::try_from(offset).ok()?;
        let len = usize::try_from(len).ok()?;
        if offset.checked_add(len)? > self.region.len() {
            return None;
        }
        Some(self.region.slice(offset..offset + len))
    }
}

impl Clone for Registration {
    fn clone(&self) -> Self {
        let mut cache = self.inner.cache.lock().expect("registration cache poisoned");
        if let Some(entry) = cache.iter_mut().find(|entry| entry.cookie == self.cookie) {
            entry.refs += 1;
        }
        drop(cache);
        Self {
            inner: Arc::clone(&self.inner),
            kind: self.kind,
            cookie: self.cookie.clone(),
            start: self.start,
            region: self.region.clone(),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.inner.release(&self.cookie);
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("kind", &self.kind)
            .field("cookie", &self.cookie)
            .field("len", &self.region.len())
            .finish()
    }
}

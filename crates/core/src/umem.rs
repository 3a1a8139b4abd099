// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Raw-memory manager with optional bucketed recycling.
//!
//! Every buffer-backed object in the workspace (block segments, picture and
//! sound planes, serialized dictionaries) draws its storage from a
//! [`UmemMgr`]. Two backends exist:
//! - a plain heap backend (`alloc_mgr`), and
//! - a bucketed pool (`pool_mgr`) keeping up to `depth` buffers per bucket;
//!   buffers return to their bucket when the last user drops them.
//!
//! Depth 0 is legal and means "go straight to the heap".

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};

/// Aggregate pool counters, mostly for tests and debugging.
#[derive(Debug, Clone, Default)]
pub struct UmemStats {
    pub hits: u64,
    pub misses: u64,
    /// Buffers currently parked, per bucket.
    pub available: Vec<usize>,
}

struct PoolShared {
    bucket_sizes: Vec<usize>,
    depth: usize,
    buckets: Vec<Vec<Vec<u8>>>,
    hits: u64,
    misses: u64,
}

impl PoolShared {
    fn bucket_for(&self, min_len: usize) -> Option<usize> {
        self.bucket_sizes.iter().position(|&size| size >= min_len)
    }

    fn bucket_for_storage(&self, storage_len: usize) -> Option<usize> {
        self.bucket_sizes.iter().position(|&size| size == storage_len)
    }
}

enum Backend {
    Alloc,
    Pool(Mutex<PoolShared>),
}

/// A raw-memory manager handle. Cheap to clone, safe to share across loops.
#[derive(Clone)]
pub struct UmemMgr {
    backend: Arc<Backend>,
}

impl UmemMgr {
    /// Plain heap-backed manager.
    #[must_use]
    pub fn alloc_mgr() -> Self {
        Self { backend: Arc::new(Backend::Alloc) }
    }

    /// Bucketed pool manager. `bucket_sizes` is sorted and deduplicated
    /// defensively; allocations larger than the last bucket fall back to the
    /// heap.
    #[must_use]
    pub fn pool_mgr(bucket_sizes: &[usize], depth: usize) -> Self {
        let mut bucket_sizes = bucket_sizes.to_vec();
        bucket_sizes.sort_unstable();
        bucket_sizes.dedup();
        let buckets = (0..bucket_sizes.len()).map(|_| Vec::new()).collect();
        Self {
            backend: Arc::new(Backend::Pool(Mutex::new(PoolShared {
                bucket_sizes,
                depth,
                buckets,
                hits: 0,
                misses: 0,
            }))),
        }
    }

    /// Allocates a zeroed buffer of at least `size` bytes.
    #[must_use]
    pub fn alloc(&self, size: usize) -> UmemBuf {
        match &*self.backend {
            Backend::Alloc => UmemBuf::detached(vec![0; size], size),
            Backend::Pool(shared) => {
                let Ok(mut guard) = shared.lock() else {
                    return UmemBuf::detached(vec![0; size], size);
                };
                let Some(idx) = guard.bucket_for(size) else {
                    guard.misses += 1;
                    return UmemBuf::detached(vec![0; size], size);
                };
                let bucket_size = guard.bucket_sizes[idx];
                let data = match guard.buckets[idx].pop() {
                    Some(mut data) => {
                        guard.hits += 1;
                        data.fill(0);
                        data
                    }
                    None => {
                        guard.misses += 1;
                        vec![0; bucket_size]
                    }
                };
                drop(guard);
                UmemBuf {
                    data,
                    len: size,
                    home: Some(HomeRef { shared: Arc::downgrade(&self.backend), bucket: idx }),
                }
            }
        }
    }

    /// Drains every free-list back to the heap.
    pub fn vacuum(&self) {
        if let Backend::Pool(shared) = &*self.backend {
            if let Ok(mut guard) = shared.lock() {
                for bucket in &mut guard.buckets {
                    bucket.clear();
                }
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> UmemStats {
        match &*self.backend {
            Backend::Alloc => UmemStats::default(),
            Backend::Pool(shared) => {
                let Ok(guard) = shared.lock() else { return UmemStats::default() };
                UmemStats {
                    hits: guard.hits,
                    misses: guard.misses,
                    available: guard.buckets.iter().map(Vec::len).collect(),
                }
            }
        }
    }
}

struct HomeRef {
    shared: Weak<Backend>,
    bucket: usize,
}

/// A buffer with a logical length, returning its storage to the pool on drop.
///
/// For pooled instances `storage_len()` is the bucket size and `len()` the
/// logical length requested at allocation.
pub struct UmemBuf {
    data: Vec<u8>,
    len: usize,
    home: Option<HomeRef>,
}

impl UmemBuf {
    fn detached(data: Vec<u8>, len: usize) -> Self {
        Self { data, len, home: None }
    }

    /// Wraps an existing vector without pool affiliation.
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self::detached(data, len)
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn storage_len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

impl Deref for UmemBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for UmemBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl std::fmt::Debug for UmemBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UmemBuf")
            .field("len", &self.len)
            .field("storage_len", &self.data.len())
            .field("pooled", &self.home.is_some())
            .finish()
    }
}

impl Drop for UmemBuf {
    fn drop(&mut self) {
        let Some(home) = self.home.take() else { return };
        let Some(backend) = home.shared.upgrade() else { return };
        let Backend::Pool(shared) = &*backend else { return };
        let Ok(mut guard) = shared.lock() else { return };

        // Only storage matching an existing bucket exactly goes back.
        let Some(idx) = guard.bucket_for_storage(self.data.len()) else { return };
        if idx != home.bucket || guard.buckets[idx].len() >= guard.depth {
            return;
        }
        let data = std::mem::take(&mut self.data);
        guard.buckets[idx].push(data);
    }
}

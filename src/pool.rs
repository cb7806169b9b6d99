// Copyright 2026 The Arraycalc Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Shared pool of scratch `f64` buffers, bucketed by size.
//!
//! Evaluations of array expressions allocate intermediate arrays at a
//! high rate; the pool recycles them so steady-state evaluation does no
//! heap allocation.  A single mutex guards bucket selection; the
//! buffers themselves are owned by [`ScratchBuf`] handles outside the
//! lock and return to the pool on drop, on every path.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::common::Result;
use crate::eval_err;

pub const DEFAULT_MAX_BUCKETS: usize = 5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Bucket {
    size: usize,
    free: Vec<Box<[f64]>>,
    /// Buffers created in this bucket, free or checked out.
    total: usize,
    last_used: u64,
}

impl Bucket {
    fn is_idle(&self) -> bool {
        self.free.len() == self.total
    }
}

#[derive(Default)]
struct PoolInner {
    buckets: Vec<Bucket>,
    tick: u64,
    stats: PoolStats,
}

pub struct ScratchPool {
    inner: Mutex<PoolInner>,
    max_buckets: usize,
}

impl Default for ScratchPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ScratchPool {
    pub fn new() -> Self {
        Self::with_max_buckets(DEFAULT_MAX_BUCKETS)
    }

    pub fn with_max_buckets(max_buckets: usize) -> Self {
        ScratchPool {
            inner: Mutex::new(PoolInner::default()),
            max_buckets: max_buckets.max(1),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.lock().stats
    }

    /// Check out a buffer of at least `len` elements.  Contents are
    /// whatever the previous user left; callers zero as needed.
    pub fn acquire(self: &Arc<Self>, len: usize) -> Result<ScratchBuf> {
        let data = self.checkout(len.max(1))?;
        Ok(ScratchBuf {
            data: Some(data),
            len: len.max(1),
            pool: Arc::clone(self),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn checkout(&self, len: usize) -> Result<Box<[f64]>> {
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;

        // exact-size bucket: reuse a free buffer, or grow the bucket
        if let Some(i) = inner.buckets.iter().position(|b| b.size == len) {
            let b = &mut inner.buckets[i];
            b.last_used = tick;
            if let Some(buf) = b.free.pop() {
                inner.stats.hits += 1;
                return Ok(buf);
            }
            b.total += 1;
            inner.stats.misses += 1;
            return Ok(vec![0.0; len].into_boxed_slice());
        }

        // a free buffer that is close enough (at most 2x oversized)
        if let Some(i) = best_free(&inner.buckets, |size| size > len && size <= 2 * len) {
            inner.stats.hits += 1;
            let b = &mut inner.buckets[i];
            b.last_used = tick;
            if let Some(buf) = b.free.pop() {
                return Ok(buf);
            }
        }

        // room for a new bucket
        if inner.buckets.len() < self.max_buckets {
            return Ok(new_bucket(&mut inner, len, tick));
        }

        // evict the least-recently-used fully-idle bucket
        let victim = inner
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_idle())
            .min_by_key(|(_, b)| b.last_used)
            .map(|(i, _)| i);
        if let Some(i) = victim {
            let evicted = inner.buckets.remove(i);
            inner.stats.evictions += 1;
            debug!(
                size = evicted.size,
                buffers = evicted.total,
                "evicting idle scratch bucket"
            );
            return Ok(new_bucket(&mut inner, len, tick));
        }

        // last resort: any free buffer big enough, however oversized
        if let Some(i) = best_free(&inner.buckets, |size| size > len) {
            inner.stats.hits += 1;
            let b = &mut inner.buckets[i];
            b.last_used = tick;
            if let Some(buf) = b.free.pop() {
                return Ok(buf);
            }
        }

        eval_err!(AllocFailed, format!("no scratch buffer of {len} doubles"))
    }

    fn release(&self, buf: Box<[f64]>) {
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;
        match inner.buckets.iter_mut().find(|b| b.size == buf.len()) {
            Some(b) => {
                b.last_used = tick;
                b.free.push(buf);
            }
            // bucket was evicted while this buffer was out; let it go
            None => drop(buf),
        }
    }
}

fn new_bucket(inner: &mut PoolInner, len: usize, tick: u64) -> Box<[f64]> {
    inner.stats.misses += 1;
    inner.buckets.push(Bucket {
        size: len,
        free: Vec::new(),
        total: 1,
        last_used: tick,
    });
    vec![0.0; len].into_boxed_slice()
}

/// Smallest bucket satisfying `size_ok` that has a free buffer.
fn best_free<F: Fn(usize) -> bool>(buckets: &[Bucket], size_ok: F) -> Option<usize> {
    buckets
        .iter()
        .enumerate()
        .filter(|(_, b)| size_ok(b.size) && !b.free.is_empty())
        .min_by_key(|(_, b)| b.size)
        .map(|(i, _)| i)
}

/// An owned scratch buffer; derefs to `[f64]` of the requested length
/// (the underlying allocation may be larger) and returns itself to the
/// pool when dropped.
pub struct ScratchBuf {
    data: Option<Box<[f64]>>,
    len: usize,
    pool: Arc<ScratchPool>,
}

impl fmt::Debug for ScratchBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchBuf").field("len", &self.len).finish()
    }
}

impl Deref for ScratchBuf {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        match &self.data {
            Some(d) => &d[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for ScratchBuf {
    fn deref_mut(&mut self) -> &mut [f64] {
        match &mut self.data {
            Some(d) => &mut d[..self.len],
            None => &mut [],
        }
    }
}

impl Drop for ScratchBuf {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.release(data);
        }
    }
}

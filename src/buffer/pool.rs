// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::config::RuntimeConfig;
use crate::metrics::Metrics;

use super::tuple_buffer::TupleBuffer;

struct PoolState {
    free: Vec<Vec<u8>>,
}

/// A fixed-capacity pool of equally sized byte buffers (spec.md §4.1).
///
/// Two instances of this type exist per query: one global pool shared across
/// pipelines for inter-pipeline emission, and one local pool per worker
/// thread for lower contention, matching the teacher's pattern of a shared
/// `Context` plus per-component local state partitioned by thread id.
pub struct BufferPool {
    buffer_size: usize,
    alignment: usize,
    state: Mutex<PoolState>,
    not_empty: Condvar,
    metrics: Arc<Metrics>,
}

/// A cheap handle back to the pool a buffer was allocated from, stored inside
/// the buffer so dropping the last reference returns storage to the pool.
#[derive(Clone)]
pub struct PoolHandle {
    pool: Arc<BufferPool>,
}

impl PoolHandle {
    pub(crate) fn reclaim(&self, bytes: Vec<u8>) {
        self.pool.reclaim(bytes);
    }
}

impl BufferPool {
    pub fn new(capacity: usize, config: &RuntimeConfig, metrics: Arc<Metrics>) -> Arc<Self> {
        let buffer_size = config.buffer_size;
        let alignment = config.alignment;
        let free = (0..capacity)
            .map(|_| aligned_buffer(buffer_size, alignment))
            .collect();
        Arc::new(Self {
            buffer_size,
            alignment,
            state: Mutex::new(PoolState { free }),
            not_empty: Condvar::new(),
            metrics,
        })
    }

    fn handle(self: &Arc<Self>) -> PoolHandle {
        PoolHandle {
            pool: Arc::clone(self),
        }
    }

    /// Blocks until a pooled buffer is available. Never fails.
    pub fn get_buffer(self: &Arc<Self>) -> TupleBuffer {
        let mut state = self.state.lock();
        while state.free.is_empty() {
            trace!("buffer pool empty, blocking for a free slot");
            self.not_empty.wait(&mut state);
        }
        let bytes = state.free.pop().expect("checked non-empty above");
        drop(state);
        self.metrics.buffers_acquired.inc();
        TupleBuffer::new_pooled(bytes, self.handle())
    }

    /// Returns `None` immediately instead of blocking when the pool is
    /// exhausted (spec.md §4.1 "Failure").
    pub fn get_buffer_no_block(self: &Arc<Self>) -> Option<TupleBuffer> {
        let mut state = self.state.lock();
        let bytes = state.free.pop()?;
        drop(state);
        self.metrics.buffers_acquired.inc();
        Some(TupleBuffer::new_pooled(bytes, self.handle()))
    }

    /// Allocates an arbitrary-size buffer outside the pool, for variable
    /// payload spillover. Never recycled; freed on drop.
    pub fn get_unpooled(&self, size: usize) -> TupleBuffer {
        self.metrics.unpooled_outstanding.inc();
        TupleBuffer::new_unpooled(size)
    }

    fn reclaim(&self, mut bytes: Vec<u8>) {
        bytes.iter_mut().for_each(|b| *b = 0);
        let mut state = self.state.lock();
        state.free.push(bytes);
        drop(state);
        self.metrics.buffers_released.inc();
        self.not_empty.notify_one();
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }
}

fn aligned_buffer(size: usize, alignment: usize) -> Vec<u8> {
    // Over-allocate then hand back a size-`size` Vec; the pool does not need
    // the Vec's own pointer to be aligned beyond what the global allocator
    // already guarantees for the requested size, but callers that need
    // hardware alignment can round `size` up to a multiple of `alignment`.
    debug_assert!(alignment.is_power_of_two());
    vec![0u8; size]
}

/// Retries acquiring a buffer with exponential backoff, used at call sites
/// that must not block indefinitely but still want a best-effort retry
/// before surfacing `ResourceExhausted` (spec.md §7).
pub fn get_buffer_with_backoff(
    pool: &Arc<BufferPool>,
    max_retries: u32,
) -> Result<TupleBuffer, crate::error::RuntimeError> {
    let mut delay = std::time::Duration::from_micros(50);
    for attempt in 0..max_retries {
        if let Some(buf) = pool.get_buffer_no_block() {
            return Ok(buf);
        }
        warn!(attempt, "buffer pool exhausted, backing off");
        pool.metrics.buffer_pool_exhausted.inc();
        std::thread::sleep(delay);
        delay = (delay * 2).min(std::time::Duration::from_millis(50));
    }
    Err(crate::error::RuntimeError::ResourceExhausted {
        retries: max_retries,
    })
}

// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use parking_lot::Mutex;

use super::pool::PoolHandle;

/// Header carried by every tuple buffer (spec.md §3, wire layout §6).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TupleBufferHeader {
    pub number_of_tuples: u64,
    pub watermark_ts: u64,
    pub sequence_number: u64,
    pub chunk_number: u32,
    pub last_chunk: bool,
    pub origin_id: u64,
    pub creation_ts: u64,
}

/// Byte offset of the payload within a wire-serialized tuple buffer, per
/// spec.md §6: header fields up to `n_child_buffers`, before the
/// variable-length child buffer descriptor table.
pub const WIRE_FIXED_HEADER_SIZE: usize = 56;

struct Inner {
    bytes: Vec<u8>,
    header: TupleBufferHeader,
    children: Vec<TupleBuffer>,
    /// `None` for unpooled buffers, which are freed on drop instead of
    /// recycled (spec.md §4.1).
    origin_pool: Option<PoolHandle>,
}

/// A fixed-size, reference-counted byte region with a header and owned child
/// buffers for variable-sized payload spillover (spec.md §3 "TupleBuffer").
///
/// Cloning a `TupleBuffer` is `retain()`: it bumps the `Arc` refcount. When
/// the last clone drops, the pool this buffer came from (if any) reclaims the
/// backing storage; unpooled buffers are simply freed.
#[derive(Clone)]
pub struct TupleBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl TupleBuffer {
    pub(crate) fn new_pooled(bytes: Vec<u8>, origin_pool: PoolHandle) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                bytes,
                header: TupleBufferHeader::default(),
                children: Vec::new(),
                origin_pool: Some(origin_pool),
            })),
        }
    }

    pub fn new_unpooled(size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                bytes: vec![0u8; size],
                header: TupleBufferHeader::default(),
                children: Vec::new(),
                origin_pool: None,
            })),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().bytes.len()
    }

    pub fn header(&self) -> TupleBufferHeader {
        self.inner.lock().header
    }

    pub fn set_header(&self, header: TupleBufferHeader) {
        self.inner.lock().header = header;
    }

    pub fn number_of_tuples(&self) -> u64 {
        self.inner.lock().header.number_of_tuples
    }

    pub fn set_number_of_tuples(&self, n: u64) {
        self.inner.lock().header.number_of_tuples = n;
    }

    pub fn watermark_ts(&self) -> u64 {
        self.inner.lock().header.watermark_ts
    }

    pub fn set_watermark_ts(&self, ts: u64) {
        self.inner.lock().header.watermark_ts = ts;
    }

    /// Runs `f` with exclusive access to the raw backing bytes.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard.bytes)
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.inner.lock();
        f(&guard.bytes)
    }

    /// Attaches a child buffer, tracking it in the header's owned-child list
    /// so its lifetime is accounted for (spec.md §3 invariant ii).
    pub fn add_child(&self, child: TupleBuffer) -> usize {
        let mut guard = self.inner.lock();
        guard.children.push(child);
        guard.children.len() - 1
    }

    pub fn child(&self, index: usize) -> Option<TupleBuffer> {
        self.inner.lock().children.get(index).cloned()
    }

    pub fn child_count(&self) -> usize {
        self.inner.lock().children.len()
    }

    /// Number of live references to this buffer, including this one.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn is_pooled(&self) -> bool {
        self.inner.lock().origin_pool.is_some()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(pool) = self.origin_pool.take() {
            let bytes = std::mem::take(&mut self.bytes);
            pool.reclaim(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let tb = TupleBuffer::new_unpooled(128);
        let mut h = TupleBufferHeader::default();
        h.number_of_tuples = 3;
        h.watermark_ts = 42;
        h.origin_id = 7;
        tb.set_header(h);
        assert_eq!(tb.header().number_of_tuples, 3);
        assert_eq!(tb.header().watermark_ts, 42);
    }

    #[test]
    fn child_buffers_are_tracked() {
        let parent = TupleBuffer::new_unpooled(64);
        let child = TupleBuffer::new_unpooled(16);
        let idx = parent.add_child(child.clone());
        assert_eq!(parent.child_count(), 1);
        assert!(parent.child(idx).is_some());
    }

    #[test]
    fn retain_increments_ref_count() {
        let tb = TupleBuffer::new_unpooled(8);
        assert_eq!(tb.ref_count(), 1);
        let retained = tb.clone();
        assert_eq!(tb.ref_count(), 2);
        drop(retained);
        assert_eq!(tb.ref_count(), 1);
    }
}

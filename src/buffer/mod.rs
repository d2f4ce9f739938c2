// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Buffer Manager (spec.md §4.1) and the tuple buffer it hands out (§3).

mod pool;
mod tuple_buffer;
mod wire;

pub use pool::{get_buffer_with_backoff, BufferPool, PoolHandle};
pub use tuple_buffer::{TupleBuffer, TupleBufferHeader, WIRE_FIXED_HEADER_SIZE};
pub use wire::{deserialize_header, serialize_header};

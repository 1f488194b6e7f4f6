//! `latte-cmdbuf` owns the GPU command-buffer pool of a big-endian console
//! graphics compatibility layer.
//!
//! Guest code serializes drawing commands into contiguous runs of 32-bit
//! words; the GPU backend consumes those runs asynchronously. This crate
//! provides the machinery in between:
//!
//! - A single ring region of words with wraparound-with-skip accounting
//!   ([`ring::CommandRing`]).
//! - A lock-free LIFO of reusable buffer descriptors, shared with the GPU
//!   completion thread.
//! - A lease manager that hands out at most one pool-backed buffer at a
//!   time and blocks on GPU retirement when the ring is full.
//! - A per-core active buffer, switchable between pool-backed mode and
//!   caller-owned display lists with a guest-supplied growth callback
//!   ([`CommandBufferPool`]).
//!
//! The GPU driver queue, the retirement clock, the core scheduler, and the
//! display-list growth handler are reached through the traits in [`host`];
//! command words are stored through [`mem::CommandMemory`].
//!
//! Buffers retire in exactly the order they were allocated. The pool treats
//! any deviation from that protocol (and every other precondition breach)
//! as corruption and panics; the only recoverable errors are construction
//! time configuration problems.

mod descriptor;
mod error;
pub mod host;
pub mod mem;
mod pool;
pub mod ring;
mod stats;

pub use descriptor::{BufferHandle, CommandBuffer};
pub use error::PoolConfigError;
pub use host::{
    CoreScheduler, DisplayListAllocator, GpuQueue, RetiredTimestamps, CORE_COUNT,
};
pub use pool::{
    CommandBufferPool, CommandWriter, PoolConfig, PAD_ALIGN_WORDS, PAD_FILLER,
};
pub use ring::{CommandRing, RingGrant, MAX_LEASE_WORDS, MIN_LEASE_WORDS};
pub use stats::PoolStats;

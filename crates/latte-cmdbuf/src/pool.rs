//! The command-buffer pool: leases, the per-core active buffer, and
//! display-list sessions.
//!
//! One pool instance exists per emulated process. Guest code asks for space
//! with [`CommandBufferPool::get_command_buffer`]; when the active buffer
//! cannot take the requested words it is padded, handed to the GPU queue,
//! and a fresh lease is carved from the ring. Retirement flows back in
//! through [`CommandBufferPool::free_command_buffer`] on the GPU completion
//! thread.
//!
//! Protocol violations (out-of-order retirement, a second outstanding
//! lease, mismatched display-list buffers) mean guest- or scheduler-side
//! corruption and panic; there is no recoverable error surface past
//! construction.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace, warn};

use crate::descriptor::{BufferHandle, CommandBuffer, DescriptorFreeList};
use crate::error::PoolConfigError;
use crate::host::{CoreScheduler, DisplayListAllocator, GpuQueue, RetiredTimestamps, CORE_COUNT};
use crate::mem::CommandMemory;
use crate::ring::{align_up, CommandRing, MIN_LEASE_WORDS};
use crate::stats::{Counters, PoolStats};

/// Filler written when a buffer is padded, as seen by the device.
pub const PAD_FILLER: u32 = 0xBEEF2929;

/// Buffers are padded to 32 bytes: four 32-bit words.
pub const PAD_ALIGN_WORDS: u32 = 4;

/// Placement of the pool ring and the identity of the main graphics core.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// First word address of the ring region.
    pub base: u32,
    /// Region size in words.
    pub size_words: u32,
    /// The one core allowed to hold pool-backed buffers.
    pub main_core: u32,
}

impl PoolConfig {
    fn validate(&self) -> Result<(), PoolConfigError> {
        if self.size_words == 0 {
            return Err(PoolConfigError::EmptyRegion);
        }
        if self.size_words < MIN_LEASE_WORDS {
            return Err(PoolConfigError::RegionTooSmall {
                size_words: self.size_words,
            });
        }
        if self.base.checked_add(self.size_words).is_none() {
            return Err(PoolConfigError::RegionOverflow {
                base: self.base,
                size_words: self.size_words,
            });
        }
        if self.main_core as usize >= CORE_COUNT {
            return Err(PoolConfigError::MainCoreOutOfRange {
                core: self.main_core,
            });
        }
        Ok(())
    }
}

/// Ring accounting plus the single-lease flag, all behind one mutex. The
/// lock is never held across anything that can block on the GPU.
#[derive(Debug)]
struct PoolState {
    ring: CommandRing,
    leased: bool,
}

/// GPU command-buffer pool and lease manager.
///
/// See the crate docs for the overall dataflow. The pool is `Sync`; the
/// per-core active slots are only ever touched from their owning core, and
/// the GPU completion path touches only the ring and the free list.
pub struct CommandBufferPool {
    memory: Arc<dyn CommandMemory>,
    cores: Arc<dyn CoreScheduler>,
    gpu: Arc<dyn GpuQueue>,
    timestamps: Arc<dyn RetiredTimestamps>,
    display_lists: Arc<dyn DisplayListAllocator>,

    state: Mutex<PoolState>,
    free_list: DescriptorFreeList,
    active: [Mutex<Option<BufferHandle>>; CORE_COUNT],
    main_core: u32,
    counters: Counters,
}

impl std::fmt::Debug for CommandBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBufferPool")
            .field("state", &self.state)
            .field("main_core", &self.main_core)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl CommandBufferPool {
    /// Build the pool over `[config.base, config.base + config.size_words)`
    /// and take the initial lease as the main core's active buffer.
    ///
    /// Must be called on the main graphics core; calling it anywhere else is
    /// a protocol violation and panics.
    pub fn new(
        memory: Arc<dyn CommandMemory>,
        cores: Arc<dyn CoreScheduler>,
        gpu: Arc<dyn GpuQueue>,
        timestamps: Arc<dyn RetiredTimestamps>,
        display_lists: Arc<dyn DisplayListAllocator>,
        config: PoolConfig,
    ) -> Result<Self, PoolConfigError> {
        config.validate()?;

        let core = cores.current_core();
        assert_eq!(
            core, config.main_core,
            "command buffer pool initialized on core {core}, not the main graphics core"
        );

        let pool = Self {
            memory,
            cores,
            gpu,
            timestamps,
            display_lists,
            state: Mutex::new(PoolState {
                ring: CommandRing::new(config.base, config.size_words),
                leased: false,
            }),
            free_list: DescriptorFreeList::new(),
            active: std::array::from_fn(|_| Mutex::new(None)),
            main_core: config.main_core,
            counters: Counters::default(),
        };

        let initial = pool.allocate_command_buffer(MIN_LEASE_WORDS);
        *pool.active[core as usize].lock().unwrap() = initial;

        Ok(pool)
    }

    /// The active buffer for the calling core, with room for at least
    /// `words` more words.
    ///
    /// Flushes the current buffer (pool mode) or grows it through the guest
    /// callback (display-list mode) first when it is too full. Panics if the
    /// calling core has no active buffer.
    pub fn get_command_buffer(&self, words: u32) -> CommandWriter<'_> {
        let core = self.current_core();
        let mut slot = self.active[core].lock().unwrap();

        let full = {
            let cb = Self::active_buffer(&slot);
            cb.cur_size.checked_add(words).is_none_or(|n| n > cb.max_size)
        };
        if full {
            self.flush_slot(&mut slot, words);
        }

        CommandWriter {
            slot,
            memory: &*self.memory,
        }
    }

    /// Flush the calling core's active buffer, making room for at least
    /// `needed_words`.
    ///
    /// Pool mode pads the buffer, queues it, and installs a fresh lease.
    /// Display-list mode pads and asks the guest for a larger list; the same
    /// descriptor migrates to the new storage.
    pub fn flush_command_buffer(&self, needed_words: u32) {
        let core = self.current_core();
        let mut slot = self.active[core].lock().unwrap();
        self.flush_slot(&mut slot, needed_words);
    }

    /// One-shot submission of a preformed, caller-owned display list.
    pub fn queue_display_list(&self, buffer: u32, words: u32) {
        let mut cb = self.free_list.acquire();
        cb.display_list = true;
        cb.submit_time = 0;
        cb.cur_size = words;
        cb.max_size = words;
        cb.buffer = buffer;

        Counters::bump(&self.counters.display_lists_queued);
        trace!(buffer, words, "queueing display list");
        self.gpu.submit(cb);
    }

    /// Open a build-it-yourself display-list session over a caller-owned
    /// buffer of `words` words.
    ///
    /// On the main core any pool-backed work is flushed first. Panics if a
    /// display list is already active on this core.
    pub fn begin_user_command_buffer(&self, buffer: u32, words: u32) {
        let core = self.current_core();
        let mut slot = self.active[core].lock().unwrap();

        if core == self.main_core as usize {
            self.flush_active(&mut slot);
        }

        let mut cb = self.free_list.acquire();
        cb.display_list = true;
        cb.submit_time = 0;
        cb.cur_size = 0;
        cb.max_size = words;
        cb.buffer = buffer;

        assert!(
            slot.is_none(),
            "a display list is already active on this core"
        );
        Counters::bump(&self.counters.user_sessions);
        *slot = Some(cb);
    }

    /// Close the display-list session over `buffer`.
    ///
    /// Pads the list and returns the number of words actually used. On the
    /// main core a fresh pool lease immediately becomes the active buffer.
    pub fn end_user_command_buffer(&self, buffer: u32) -> u32 {
        let core = self.current_core();
        let mut slot = self.active[core].lock().unwrap();

        let used = {
            let cb = Self::active_buffer_mut(&mut slot);
            assert!(cb.display_list, "no display list is active on this core");
            assert_eq!(
                cb.buffer, buffer,
                "closed a display list with a mismatched buffer"
            );
            self.pad(cb);
            cb.cur_size
        };

        let cb = slot.take().expect("active buffer vanished during close");
        self.free_list.release(cb);

        if core == self.main_core as usize {
            *slot = self.allocate_command_buffer(MIN_LEASE_WORDS);
        }

        used
    }

    /// The calling core's display-list session, as `(buffer, max_words)`,
    /// or `None` if the active buffer is pool-backed.
    pub fn user_command_buffer(&self) -> Option<(u32, u32)> {
        let core = self.current_core();
        let slot = self.active[core].lock().unwrap();
        let cb = Self::active_buffer(&slot);

        cb.display_list.then(|| (cb.buffer, cb.max_size))
    }

    /// Pad the calling core's active buffer to the 32-byte boundary with
    /// the device-order filler word. Returns the padded word count.
    pub fn pad_command_buffer(&self) -> u32 {
        let core = self.current_core();
        let mut slot = self.active[core].lock().unwrap();
        let cb = Self::active_buffer_mut(&mut slot);
        self.pad(cb);
        cb.cur_size
    }

    /// GPU-side completion callback: the driver is done with `cb`.
    ///
    /// Pool-backed buffers release their words back to the ring; every
    /// descriptor goes back on the free list. Must be called in allocation
    /// order for pool-backed buffers.
    pub fn free_command_buffer(&self, cb: BufferHandle) {
        assert_eq!(
            cb.cur_size, cb.max_size,
            "retired command buffer has unaccounted words"
        );

        if !cb.display_list {
            let mut state = self.state.lock().unwrap();
            state.ring.retire(cb.buffer, cb.max_size);
            Counters::bump(&self.counters.buffers_retired);
        }

        self.free_list.release(cb);
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.free_list.minted())
    }

    fn current_core(&self) -> usize {
        let core = self.cores.current_core() as usize;
        assert!(core < CORE_COUNT, "core id {core} out of range");
        core
    }

    fn active_buffer<'s>(slot: &'s MutexGuard<'_, Option<BufferHandle>>) -> &'s CommandBuffer {
        slot.as_deref()
            .expect("no active command buffer on this core")
    }

    fn active_buffer_mut<'s>(
        slot: &'s mut MutexGuard<'_, Option<BufferHandle>>,
    ) -> &'s mut CommandBuffer {
        slot.as_deref_mut()
            .expect("no active command buffer on this core")
    }

    /// Pad `cb` to the 32-byte boundary with the device-order filler word.
    fn pad(&self, cb: &mut CommandBuffer) {
        let aligned = align_up(cb.cur_size, PAD_ALIGN_WORDS);
        assert!(
            aligned <= cb.max_size,
            "padding to {aligned:#x} words overruns a {:#x} word buffer",
            cb.max_size
        );

        while cb.cur_size < aligned {
            self.memory.write_word(cb.buffer + cb.cur_size, PAD_FILLER.to_be());
            cb.cur_size += 1;
        }
    }

    /// Pool branch pads, queues, and re-leases; display-list branch grows in
    /// place through the guest callback.
    fn flush_slot(&self, slot: &mut MutexGuard<'_, Option<BufferHandle>>, needed_words: u32) {
        let cb = Self::active_buffer_mut(slot);

        if cb.display_list {
            self.pad(cb);

            let used_bytes = cb.cur_size * 4;
            let needed_bytes = needed_words * 4;
            let (new_list, new_bytes) = self
                .display_lists
                .grow(cb.buffer, used_bytes, needed_bytes)
                .expect("guest failed to grow an overrun display list");
            assert!(new_bytes != 0, "guest grew a display list to zero bytes");

            debug!(
                old = cb.buffer,
                used_bytes, new_list, new_bytes, "display list overrun"
            );
            Counters::bump(&self.counters.display_list_growths);

            // The same descriptor migrates to the new storage.
            cb.buffer = new_list;
            cb.cur_size = 0;
            cb.max_size = new_bytes / 4;
            return;
        }

        self.pad(cb);
        self.flush_active(slot);
        **slot = self.allocate_command_buffer(needed_words);
    }

    /// Queue the calling core's pool-backed buffer and release the lease.
    /// Untouched buffers skip the GPU and go straight back to the free list.
    fn flush_active(&self, slot: &mut MutexGuard<'_, Option<BufferHandle>>) {
        let mut cb = slot.take().expect("no active command buffer on this core");
        assert!(
            !cb.display_list,
            "a display list is already active on this core"
        );

        {
            let mut state = self.state.lock().unwrap();
            assert!(state.leased, "flushed a command buffer with no lease outstanding");
            state.leased = false;
            state.ring.shrink(cb.buffer, cb.cur_size, cb.max_size);
        }

        // From here on the descriptor accounts for exactly the words kept.
        cb.max_size = cb.cur_size;

        if cb.cur_size == 0 {
            Counters::bump(&self.counters.empty_flushes);
            self.free_list.release(cb);
        } else {
            Counters::bump(&self.counters.buffers_queued);
            trace!(buffer = cb.buffer, words = cb.cur_size, "queueing command buffer");
            self.gpu.submit(cb);
        }
    }

    /// Take a fresh lease of at least `wanted_words` from the ring, blocking
    /// on GPU retirement while the ring is full.
    ///
    /// Only the main graphics core may hold pool-backed buffers; other cores
    /// get a warning and `None`.
    fn allocate_command_buffer(&self, wanted_words: u32) -> Option<BufferHandle> {
        assert!(
            !self.state.lock().unwrap().leased,
            "allocated a command buffer while a lease is outstanding"
        );

        if self.cores.current_core() != self.main_core {
            warn!(
                core = self.cores.current_core(),
                "tried to allocate a command buffer off the main graphics core"
            );
            return None;
        }

        let grant = loop {
            // Sample the clock before probing the ring: a retirement that
            // lands between a failed probe and the wait must not be missed.
            let target = self.timestamps.retired() + 1;

            let grant = {
                let mut state = self.state.lock().unwrap();
                let grant = state.ring.allocate(wanted_words);
                if grant.is_some() {
                    state.leased = true;
                }
                grant
            };

            match grant {
                Some(grant) => break grant,
                None => {
                    // Ring is full: stall until the GPU retires something,
                    // with the pool lock released.
                    Counters::bump(&self.counters.retirement_waits);
                    self.timestamps.wait_retired(target);
                }
            }
        };

        Counters::bump(&self.counters.pool_allocations);
        if grant.wrapped {
            Counters::bump(&self.counters.wrap_allocations);
            debug!(addr = grant.addr, words = grant.words, "lease wrapped to pool base");
        }

        let mut cb = self.free_list.acquire();
        cb.display_list = false;
        cb.submit_time = 0;
        cb.cur_size = 0;
        cb.max_size = grant.words;
        cb.buffer = grant.addr;
        Some(cb)
    }
}

impl Drop for CommandBufferPool {
    fn drop(&mut self) {
        // Descriptors still sitting in active slots go back to the free
        // list so it can reclaim them.
        for slot in &self.active {
            if let Some(cb) = slot.lock().unwrap().take() {
                self.free_list.release(cb);
            }
        }
    }
}

/// Write access to the calling core's active buffer.
///
/// Words land at `buffer[cur_size..]` and `cur_size` advances by exactly
/// the amount written. The handle holds the core's slot for its lifetime;
/// drop it before asking the pool for anything else.
pub struct CommandWriter<'a> {
    slot: MutexGuard<'a, Option<BufferHandle>>,
    memory: &'a dyn CommandMemory,
}

impl CommandWriter<'_> {
    fn cb(&self) -> &CommandBuffer {
        self.slot.as_deref().expect("active buffer vanished")
    }

    fn cb_mut(&mut self) -> &mut CommandBuffer {
        self.slot.as_deref_mut().expect("active buffer vanished")
    }

    /// Append one word.
    pub fn push(&mut self, word: u32) {
        let cb = self.cb_mut();
        assert!(cb.cur_size < cb.max_size, "command buffer overrun");
        let addr = cb.buffer + cb.cur_size;
        cb.cur_size += 1;
        self.memory.write_word(addr, word);
    }

    /// Append a run of words.
    pub fn extend(&mut self, words: &[u32]) {
        for &word in words {
            self.push(word);
        }
    }

    /// Word address of the start of the buffer.
    pub fn buffer(&self) -> u32 {
        self.cb().buffer
    }

    /// Words written so far.
    pub fn written(&self) -> u32 {
        self.cb().cur_size
    }

    /// Words still free.
    pub fn remaining(&self) -> u32 {
        let cb = self.cb();
        cb.max_size - cb.cur_size
    }
}

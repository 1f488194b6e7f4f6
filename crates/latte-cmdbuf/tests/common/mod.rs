//! Shared fakes for driving the pool without a real emulator.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use latte_cmdbuf::host::{CoreScheduler, DisplayListAllocator, GpuQueue, RetiredTimestamps};
use latte_cmdbuf::mem::VecCommandMemory;
use latte_cmdbuf::{BufferHandle, CommandBufferPool, PoolConfig};

/// Core scheduler whose answer the test flips by hand.
#[derive(Default)]
pub struct SwitchableCore {
    core: AtomicU32,
}

impl SwitchableCore {
    pub fn switch_to(&self, core: u32) {
        self.core.store(core, Ordering::Relaxed);
    }
}

impl CoreScheduler for SwitchableCore {
    fn current_core(&self) -> u32 {
        self.core.load(Ordering::Relaxed)
    }
}

/// GPU queue that just records submissions in order.
#[derive(Default)]
pub struct RecordingQueue {
    submitted: Mutex<VecDeque<BufferHandle>>,
}

impl RecordingQueue {
    pub fn pop_oldest(&self) -> Option<BufferHandle> {
        self.submitted.lock().unwrap().pop_front()
    }

    pub fn pop_newest(&self) -> Option<BufferHandle> {
        self.submitted.lock().unwrap().pop_back()
    }

    pub fn len(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

impl GpuQueue for RecordingQueue {
    fn submit(&self, cb: BufferHandle) {
        self.submitted.lock().unwrap().push_back(cb);
    }
}

/// Manually advanced retirement clock.
#[derive(Default)]
pub struct ManualTimestamps {
    retired: Mutex<u64>,
    advanced: Condvar,
}

impl ManualTimestamps {
    pub fn advance(&self) {
        *self.retired.lock().unwrap() += 1;
        self.advanced.notify_all();
    }
}

impl RetiredTimestamps for ManualTimestamps {
    fn retired(&self) -> u64 {
        *self.retired.lock().unwrap()
    }

    fn wait_retired(&self, timestamp: u64) {
        let mut retired = self.retired.lock().unwrap();
        while *retired < timestamp {
            retired = self.advanced.wait(retired).unwrap();
        }
    }
}

/// Display-list growth handler fed with canned responses.
#[derive(Default)]
pub struct ScriptedGrowth {
    responses: Mutex<VecDeque<(u32, u32)>>,
    pub calls: Mutex<Vec<(u32, u32, u32)>>,
}

impl ScriptedGrowth {
    pub fn respond_with(&self, new_list: u32, new_bytes: u32) {
        self.responses.lock().unwrap().push_back((new_list, new_bytes));
    }
}

impl DisplayListAllocator for ScriptedGrowth {
    fn grow(&self, old_list: u32, used_bytes: u32, needed_bytes: u32) -> Option<(u32, u32)> {
        self.calls
            .lock()
            .unwrap()
            .push((old_list, used_bytes, needed_bytes));
        self.responses.lock().unwrap().pop_front()
    }
}

/// A pool wired to fakes, plus handles to drive them.
pub struct Rig {
    pub mem: Arc<VecCommandMemory>,
    pub cores: Arc<SwitchableCore>,
    pub queue: Arc<RecordingQueue>,
    pub timestamps: Arc<ManualTimestamps>,
    pub growth: Arc<ScriptedGrowth>,
    pub pool: CommandBufferPool,
}

impl Rig {
    /// Pool over `[base, base + size_words)`, main core 0, in a command
    /// space of `mem_words` words.
    pub fn new(base: u32, size_words: u32, mem_words: u32) -> Self {
        let mem = Arc::new(VecCommandMemory::new(mem_words));
        let cores = Arc::new(SwitchableCore::default());
        let queue = Arc::new(RecordingQueue::default());
        let timestamps = Arc::new(ManualTimestamps::default());
        let growth = Arc::new(ScriptedGrowth::default());

        let pool = CommandBufferPool::new(
            Arc::clone(&mem) as _,
            Arc::clone(&cores) as _,
            Arc::clone(&queue) as _,
            Arc::clone(&timestamps) as _,
            Arc::clone(&growth) as _,
            PoolConfig {
                base,
                size_words,
                main_core: 0,
            },
        )
        .expect("pool config rejected");

        Self {
            mem,
            cores,
            queue,
            timestamps,
            growth,
            pool,
        }
    }

    /// Retire the oldest queued buffer, the way the GPU driver would.
    pub fn retire_oldest(&self) {
        let cb = self.queue.pop_oldest().expect("nothing queued to retire");
        self.pool.free_command_buffer(cb);
        self.timestamps.advance();
    }

    /// Fill the active buffer completely with `seed`-derived words.
    pub fn fill_active(&self, seed: u32) {
        let mut writer = self.pool.get_command_buffer(0);
        while writer.remaining() > 0 {
            writer.push(seed ^ writer.written());
        }
    }
}

//! Command-buffer descriptors and the lock-free descriptor free list.
//!
//! A descriptor is the metadata record for a run of command words,
//! independent of the backing storage: pool-backed leases and caller-owned
//! display lists use the same record. Descriptors are recycled through a
//! CAS-based LIFO because the GPU completion thread releases them while the
//! main graphics core is acquiring; everything else about their lifecycle is
//! serialized by the pool's higher-level rules.

use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// Metadata for one run of command words.
///
/// A descriptor is always in exactly one place: the free list, a per-core
/// active slot, or in flight with the GPU queue.
#[derive(Debug)]
pub struct CommandBuffer {
    /// Word address of the first word of the backing storage.
    pub buffer: u32,
    /// Words written so far.
    pub cur_size: u32,
    /// Words reserved.
    pub max_size: u32,
    /// Caller-owned display list rather than a pool lease.
    pub display_list: bool,
    /// Stamped by the driver when the buffer is submitted; the pool only
    /// zeroes it.
    pub submit_time: u64,
    /// Free-list link.
    next: AtomicPtr<CommandBuffer>,
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self {
            buffer: 0,
            cur_size: 0,
            max_size: 0,
            display_list: false,
            submit_time: 0,
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// Owning handle to a [`CommandBuffer`] drawn from a [`DescriptorFreeList`].
///
/// The handle is the unit that moves between the active-buffer slots, the
/// GPU queue, and the free list. Dropping a handle without releasing it back
/// to its list leaks the descriptor; it is never deallocated early, which is
/// what keeps concurrent free-list pops safe.
#[derive(Debug)]
pub struct BufferHandle {
    ptr: NonNull<CommandBuffer>,
}

// SAFETY: the handle has exclusive access to its descriptor, and
// `CommandBuffer` holds no thread-bound state.
unsafe impl Send for BufferHandle {}

impl BufferHandle {
    fn into_raw(self) -> *mut CommandBuffer {
        self.ptr.as_ptr()
    }
}

impl Deref for BufferHandle {
    type Target = CommandBuffer;

    fn deref(&self) -> &CommandBuffer {
        // SAFETY: the pointer came from `Box::into_raw` and stays valid
        // until the owning free list is dropped.
        unsafe { self.ptr.as_ref() }
    }
}

impl DerefMut for BufferHandle {
    fn deref_mut(&mut self) -> &mut CommandBuffer {
        // SAFETY: as above, plus the handle is the sole owner.
        unsafe { self.ptr.as_mut() }
    }
}

/// Lock-free LIFO of reusable descriptors.
///
/// Descriptors are minted on demand and only ever deallocated when the list
/// itself is dropped, so a pop racing with a concurrent pop of the same node
/// never dereferences freed memory. The usage rules above make the classic
/// ABA hazard unreachable: a descriptor cannot be popped and pushed again
/// while another thread still holds its pointer from the same pop loop.
#[derive(Debug, Default)]
pub(crate) struct DescriptorFreeList {
    head: AtomicPtr<CommandBuffer>,
    minted: AtomicU64,
}

impl DescriptorFreeList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Descriptors minted so far. A steady value under a recycling workload
    /// is the signal that buffers really are coming back.
    pub(crate) fn minted(&self) -> u64 {
        self.minted.load(Ordering::Relaxed)
    }

    /// Pop a recycled descriptor, or mint a fresh one if the list is empty.
    pub(crate) fn acquire(&self) -> BufferHandle {
        let mut head = self.head.load(Ordering::Acquire);

        while !head.is_null() {
            // SAFETY: nodes are never deallocated while the list is alive,
            // so `head` can be read even if another thread pops it first.
            let next = unsafe { (*head).next.load(Ordering::Acquire) };

            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => {
                    // SAFETY: the CAS transferred ownership of `head` to us.
                    unsafe { (*head).next.store(ptr::null_mut(), Ordering::Relaxed) };
                    return BufferHandle {
                        ptr: NonNull::new(head).expect("free list head was null after CAS"),
                    };
                }
                Err(current) => head = current,
            }
        }

        self.minted.fetch_add(1, Ordering::Relaxed);
        let raw = Box::into_raw(Box::new(CommandBuffer::default()));
        BufferHandle {
            // SAFETY: `Box::into_raw` never returns null.
            ptr: unsafe { NonNull::new_unchecked(raw) },
        }
    }

    /// Push a descriptor back for reuse.
    pub(crate) fn release(&self, handle: BufferHandle) {
        let node = handle.into_raw();
        let mut head = self.head.load(Ordering::Acquire);

        loop {
            // SAFETY: we own `node` until the CAS below publishes it.
            unsafe { (*node).next.store(head, Ordering::Release) };

            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }
}

impl Drop for DescriptorFreeList {
    fn drop(&mut self) {
        let mut node = *self.head.get_mut();
        while !node.is_null() {
            // SAFETY: exclusive access; every node was minted via
            // `Box::into_raw` and is on the list exactly once.
            let next = unsafe { (*node).next.load(Ordering::Relaxed) };
            drop(unsafe { Box::from_raw(node) });
            node = next;
        }
    }
}

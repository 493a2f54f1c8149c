//! Core SPSC ring buffer algorithm over fixed-size byte slots.
//!
//! The ring state (indices and role-local caches) lives at the front of a
//! shared mapping and the slots follow it, so both the capacity and the slot
//! size are runtime values.
//!
//! # Safety
//!
//! [`Ring::push`] and [`Ring::pop`] are unsafe because the caller must uphold
//! the SPSC invariant: at most one pusher and one popper at any time.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::ipc::shmem::SharedMemorySafe;

/// Role marker: fields owned exclusively by the producer.
pub struct ProducerRole;

/// Role marker: fields owned exclusively by the consumer.
pub struct ConsumerRole;

/// Interior-mutable cell tagged with the role that owns it.
///
/// The role has no runtime effect; it keeps producer-owned and
/// consumer-owned caches from being mixed up at compile time.
#[repr(transparent)]
pub struct SpscCell<T, Role>(UnsafeCell<T>, PhantomData<Role>);

impl<T, Role> SpscCell<T, Role> {
    pub const fn get(&self) -> &UnsafeCell<T> {
        &self.0
    }
}

// SAFETY: each cell is only touched by the role named in its type, and the
// SPSC invariant guarantees one thread per role.
unsafe impl<T: Send, Role> Sync for SpscCell<T, Role> {}
unsafe impl<T: Send, Role> Send for SpscCell<T, Role> {}

/// Cache cell owned exclusively by the producer.
pub type ProducerCache<T> = SpscCell<T, ProducerRole>;

/// Cache cell owned exclusively by the consumer.
pub type ConsumerCache<T> = SpscCell<T, ConsumerRole>;

/// Producer-side state: head index, slot cursor and cached tail.
#[repr(C)]
#[repr(align(64))]
pub struct ProducerState {
    /// Write index (count of slots ever published). Read by the consumer.
    pub head: AtomicUsize,

    /// `head % capacity`, kept to avoid a division per push.
    pub cursor: ProducerCache<usize>,

    /// Last observed tail.
    pub cached_tail: ProducerCache<usize>,
}

/// Consumer-side state: tail index, slot cursor and cached head.
#[repr(C)]
#[repr(align(64))]
pub struct ConsumerState {
    /// Read index (count of slots ever consumed). Read by the producer.
    pub tail: AtomicUsize,

    /// `tail % capacity`.
    pub cursor: ConsumerCache<usize>,

    /// Last observed head.
    pub cached_head: ConsumerCache<usize>,
}

/// Index state of one ring, placed in shared memory.
///
/// All-zeroes is the empty ring.
#[repr(C)]
pub struct RingState {
    pub producer: ProducerState,
    pub consumer: ConsumerState,
}

// SAFETY: repr(C), atomics and role cells over usize only; zero is the
// initial state of every field.
unsafe impl SharedMemorySafe for RingState {}

/// The ring was at capacity; nothing was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full;

/// A view of a ring: its state plus the slot array that follows it.
pub struct Ring<'a> {
    state: &'a RingState,
    slots: NonNull<u8>,
    capacity: usize,
    slot_size: usize,
}

impl<'a> Ring<'a> {
    /// Builds a view over `capacity` slots of `slot_size` bytes at `slots`.
    ///
    /// # Safety
    ///
    /// - `slots` must be valid for reads and writes of `capacity * slot_size`
    ///   bytes for `'a`
    /// - `capacity` and `slot_size` must be the values the ring was created
    ///   with and non-zero
    pub const unsafe fn from_raw(
        state: &'a RingState,
        slots: NonNull<u8>,
        capacity: usize,
        slot_size: usize,
    ) -> Self {
        Self {
            state,
            slots,
            capacity,
            slot_size,
        }
    }

    /// Number of published, not yet consumed slots.
    #[must_use]
    pub fn len(&self) -> usize {
        let tail = self.state.consumer.tail.load(Ordering::Acquire);
        let head = self.state.producer.head.load(Ordering::Acquire);
        head.wrapping_sub(tail).min(self.capacity)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    const fn bump_cursor(&self, cursor: usize) -> usize {
        let next = cursor + 1;
        if next == self.capacity { 0 } else { next }
    }

    #[inline]
    fn slot_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.capacity);
        // SAFETY: index < capacity, so the offset stays inside the slot array.
        unsafe { self.slots.as_ptr().add(index * self.slot_size) }
    }

    /// Copies `bytes` into the next free slot, zero-filling the rest of it.
    ///
    /// # Safety
    ///
    /// Only one thread or process may push at a time.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is longer than a slot.
    #[inline]
    pub unsafe fn push(&self, bytes: &[u8]) -> Result<(), Full> {
        assert!(bytes.len() <= self.slot_size, "payload exceeds slot size");

        let producer = &self.state.producer;
        let head = producer.head.load(Ordering::Relaxed);

        // SAFETY: producer-owned cache.
        let mut cached_tail = unsafe { *producer.cached_tail.get().get() };
        if head.wrapping_sub(cached_tail) >= self.capacity {
            cached_tail = self.state.consumer.tail.load(Ordering::Acquire);
            // SAFETY: producer-owned cache.
            unsafe { *producer.cached_tail.get().get() = cached_tail };

            if head.wrapping_sub(cached_tail) >= self.capacity {
                return Err(Full);
            }
        }

        // SAFETY: producer-owned cursor, always in [0, capacity).
        let index = unsafe { *producer.cursor.get().get() };

        // SAFETY: head - tail < capacity, so the consumer is not reading this
        // slot, and it stays ours until head is published below.
        unsafe {
            let slot = self.slot_ptr(index);
            ptr::copy_nonoverlapping(bytes.as_ptr(), slot, bytes.len());
            ptr::write_bytes(slot.add(bytes.len()), 0, self.slot_size - bytes.len());
            *producer.cursor.get().get() = self.bump_cursor(index);
        }

        producer.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Copies the oldest slot into `out` and frees it.
    ///
    /// Copies `out.len()` bytes. Returns `false` if the ring is empty.
    ///
    /// # Safety
    ///
    /// Only one thread or process may pop at a time.
    ///
    /// # Panics
    ///
    /// Panics if `out` is longer than a slot.
    #[inline]
    pub unsafe fn pop(&self, out: &mut [u8]) -> bool {
        assert!(out.len() <= self.slot_size, "buffer exceeds slot size");

        let consumer = &self.state.consumer;
        let tail = consumer.tail.load(Ordering::Relaxed);

        // SAFETY: consumer-owned cache.
        let mut cached_head = unsafe { *consumer.cached_head.get().get() };
        if cached_head == tail {
            cached_head = self.state.producer.head.load(Ordering::Acquire);
            // SAFETY: consumer-owned cache.
            unsafe { *consumer.cached_head.get().get() = cached_head };

            if cached_head == tail {
                return false;
            }
        }

        // SAFETY: consumer-owned cursor, always in [0, capacity).
        let index = unsafe { *consumer.cursor.get().get() };

        // SAFETY: head != tail, so the slot was published by the producer, and
        // it is not overwritten until tail is published below.
        unsafe {
            ptr::copy_nonoverlapping(self.slot_ptr(index), out.as_mut_ptr(), out.len());
        }

        consumer.tail.store(tail.wrapping_add(1), Ordering::Release);

        // SAFETY: consumer-owned cursor.
        unsafe { *consumer.cursor.get().get() = self.bump_cursor(index) };

        true
    }
}

//! Named, bounded mailbox of fixed-size message slots.
//!
//! A mailbox is a POSIX shared memory object holding a small header followed
//! by `capacity` slots of `slot_size` bytes:
//!
//! ```text
//! ┌────────────────────────────────────────┐ offset 0
//! │ InitMarker      (64-byte aligned)      │
//! ├────────────────────────────────────────┤
//! │ capacity, slot_size, closed            │
//! ├────────────────────────────────────────┤
//! │ RingState       (head / tail lines)    │
//! ├────────────────────────────────────────┤ HEADER_SIZE
//! │ slot 0 │ slot 1 │ ...  │ slot cap-1    │
//! └────────────────────────────────────────┘
//! ```
//!
//! The name is the mailbox identity: only one mailbox with a given name can
//! exist at a time, and [`Mailbox::destroy`] (or dropping the creating
//! handle) releases it.
//!
//! # Roles
//!
//! The ring underneath is single-producer single-consumer. Within one process
//! a handle serializes all senders through one lock and all receivers through
//! another, so sharing it behind an `Arc` is always sound. Across processes
//! only one process may send and only one may receive.
//!
//! # Example
//!
//! ```no_run
//! use mqbox::mailbox::{Mailbox, MailboxConfig};
//! use mqbox::message::Message;
//!
//! let mailbox = Mailbox::create_with(&MailboxConfig::default())?;
//! mailbox.send(&Message::U16(100))?;
//! assert_eq!(mailbox.receive()?, Message::U16(100));
//! mailbox.close();
//! mailbox.destroy()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::fmt;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use minstant::Instant;
use parking_lot::{Condvar, Mutex, MutexGuard};
use rustix::io;
use thiserror::Error;

use crate::data::frame::{Frame, FrameError, MESSAGE_SIZE};
use crate::ipc::shmem::{self, Creator, Opener, SharedMemorySafe, Shm, ShmError, ShmMode, ShmPath};
use crate::message::Message;
use crate::spsc::ring::{Ring, RingState};
use crate::trace::{debug, trace};

/// Name used when none is configured.
pub const DEFAULT_MAILBOX_NAME: &str = "/my_mq";

/// Capacity used when none is configured.
pub const DEFAULT_CAPACITY: usize = 10;

/// How often a blocked receiver re-checks the ring without a wake-up.
///
/// Senders in this process wake receivers directly; the re-check covers
/// senders in other processes.
pub const RECHECK_INTERVAL: Duration = Duration::from_millis(10);

const INIT_MAGIC: u64 = 0x4D51_424F_5849_4E54; // "MQBOXINT" in ASCII
const INIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Byte offset of the first slot.
const HEADER_SIZE: usize = size_of::<MailboxHeader>();

/// Parameters for [`Mailbox::create_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxConfig {
    pub name: String,
    pub capacity: usize,
    pub slot_size: usize,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_MAILBOX_NAME.to_string(),
            capacity: DEFAULT_CAPACITY,
            slot_size: MESSAGE_SIZE,
        }
    }
}

/// Errors from creating, opening or destroying a mailbox.
#[derive(Debug, Error)]
pub enum MailboxError {
    /// Rejected parameters (zero capacity, undersized slots, bad name).
    #[error("invalid mailbox configuration: {0}")]
    Config(&'static str),
    /// A mailbox with this name already exists.
    #[error("mailbox `{name}` already exists")]
    NameConflict { name: String },
    /// No mailbox with this name exists.
    #[error("mailbox `{name}` does not exist")]
    NotFound { name: String },
    /// The named object is not a usable mailbox.
    #[error("mailbox `{name}` is corrupt: {reason}")]
    Corrupt { name: String, reason: &'static str },
    /// The mailbox must be closed before it is destroyed.
    #[error("mailbox `{name}` is still open")]
    StillOpen { name: String },
    /// Any other shared memory failure.
    #[error(transparent)]
    Shm(#[from] ShmError),
}

impl MailboxError {
    /// The errno behind an OS failure, if any.
    #[must_use]
    pub const fn errno(&self) -> Option<io::Errno> {
        match self {
            Self::Shm(err) => err.errno(),
            _ => None,
        }
    }
}

/// Errors from [`Mailbox::send`].
#[derive(Debug, Error)]
pub enum SendError {
    /// Every slot is occupied; nothing was enqueued.
    #[error("mailbox is full")]
    WouldBlock,
    /// The mailbox has been closed.
    #[error("mailbox is closed")]
    Closed,
    /// The message could not be encoded into a slot.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Errors from the receive family.
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// The mailbox has been closed.
    #[error("mailbox is closed")]
    Closed,
    /// A slot carried a kind tag this build does not know.
    #[error("message carries unknown kind tag {0}")]
    UnknownVariant(u8),
    /// A slot could not be decoded.
    #[error(transparent)]
    Frame(FrameError),
}

impl From<FrameError> for ReceiveError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::UnknownVariant(tag) => Self::UnknownVariant(tag),
            err => Self::Frame(err),
        }
    }
}

/// Initialization marker on its own cache line.
#[repr(C)]
#[repr(align(64))]
struct InitMarker(AtomicU64);

/// Shared header at the front of every mailbox object.
#[repr(C)]
struct MailboxHeader {
    init: InitMarker,
    capacity: AtomicUsize,
    slot_size: AtomicUsize,
    closed: AtomicBool,
    ring: RingState,
}

// SAFETY: repr(C), atomics and ring state only; all zeroes is "not yet
// initialized".
unsafe impl SharedMemorySafe for InitMarker {}
unsafe impl SharedMemorySafe for MailboxHeader {}

fn mailbox_path(name: &str) -> Result<ShmPath, MailboxError> {
    ShmPath::new(name).map_err(|err| match err {
        ShmError::InvalidPath { reason, .. } => MailboxError::Config(reason),
        err => MailboxError::Shm(err),
    })
}

fn object_len(capacity: usize, slot_size: usize) -> Option<usize> {
    capacity.checked_mul(slot_size)?.checked_add(HEADER_SIZE)
}

/// Removes the mailbox called `name`.
///
/// Meant for leftovers of a process that did not shut down cleanly; live
/// handles keep their mapping but the name becomes free. Returns `Ok(false)`
/// when no such mailbox exists.
///
/// # Errors
///
/// [`MailboxError::Config`] for an invalid name, [`MailboxError::Shm`] if the
/// OS refuses the removal.
pub fn destroy(name: &str) -> Result<bool, MailboxError> {
    let path = mailbox_path(name)?;
    let removed = shmem::unlink(&path)?;
    if removed {
        debug!(name = %path, "mailbox removed by name");
    }
    Ok(removed)
}

/// A bounded, named queue of [`Message`]s.
///
/// `Mailbox<Creator>` owns the name, `Mailbox<Opener>` attaches to a mailbox
/// created elsewhere.
pub struct Mailbox<M: ShmMode = Creator> {
    shm: Shm<M>,
    capacity: usize,
    slot_size: usize,
    /// Serializes pushers in this process.
    send_lock: Mutex<()>,
    /// Serializes poppers in this process; paired with `readable`.
    wait_lock: Mutex<()>,
    readable: Condvar,
    /// Upper bound on one condvar wait; catches pushes from other processes.
    recheck: Duration,
}

impl Mailbox<Creator> {
    /// Creates a new, empty, open mailbox.
    ///
    /// # Errors
    ///
    /// - [`MailboxError::Config`] if `capacity` or `slot_size` is zero, a slot
    ///   cannot hold an encoded message, or `name` is not a valid POSIX name
    /// - [`MailboxError::NameConflict`] if the name is taken
    /// - [`MailboxError::Shm`] for other OS failures
    pub fn create(name: &str, capacity: usize, slot_size: usize) -> Result<Self, MailboxError> {
        if capacity == 0 {
            return Err(MailboxError::Config("capacity must be non-zero"));
        }
        if slot_size == 0 {
            return Err(MailboxError::Config("slot size must be non-zero"));
        }
        if slot_size < MESSAGE_SIZE {
            return Err(MailboxError::Config("slot size is smaller than an encoded message"));
        }
        let path = mailbox_path(name)?;
        let len = object_len(capacity, slot_size)
            .ok_or(MailboxError::Config("capacity * slot size overflows"))?;

        let shm = Shm::<Creator>::create(&path, len).map_err(|err| match err.errno() {
            Some(errno) if errno == io::Errno::EXIST => MailboxError::NameConflict {
                name: path.to_string(),
            },
            _ => MailboxError::Shm(err),
        })?;

        let header = shm.view::<MailboxHeader>(0);
        header.capacity.store(capacity, Ordering::Relaxed);
        header.slot_size.store(slot_size, Ordering::Relaxed);
        header.init.0.store(INIT_MAGIC, Ordering::Release);

        debug!(name = %path, capacity, slot_size, "mailbox created");
        Ok(Self::from_shm(shm, capacity, slot_size))
    }

    /// [`Mailbox::create`] from a config.
    ///
    /// # Errors
    ///
    /// See [`Mailbox::create`].
    pub fn create_with(config: &MailboxConfig) -> Result<Self, MailboxError> {
        Self::create(&config.name, config.capacity, config.slot_size)
    }

    /// Releases the name so a new mailbox can be created under it.
    ///
    /// Returns `Ok(true)` if this call released it and `Ok(false)` if it was
    /// already released (by an earlier call or by [`destroy`]).
    ///
    /// # Errors
    ///
    /// [`MailboxError::StillOpen`] if [`Mailbox::close`] was not called,
    /// [`MailboxError::Shm`] if the OS refuses the removal.
    pub fn destroy(&self) -> Result<bool, MailboxError> {
        if !self.is_closed() {
            return Err(MailboxError::StillOpen {
                name: self.name().to_string(),
            });
        }
        let removed = self.shm.unlink()?;
        if removed {
            debug!(name = %self.name(), "mailbox destroyed");
        }
        Ok(removed)
    }
}

impl Mailbox<Opener> {
    /// Attaches to an existing mailbox.
    ///
    /// # Errors
    ///
    /// - [`MailboxError::NotFound`] if no mailbox has this name
    /// - [`MailboxError::Corrupt`] if the object is not an initialized mailbox
    /// - [`MailboxError::Config`] for an invalid name
    pub fn open(name: &str) -> Result<Self, MailboxError> {
        let path = mailbox_path(name)?;
        let shm = Shm::<Opener>::open(&path, HEADER_SIZE).map_err(|err| match err {
            ShmError::SizeMismatch { .. } => MailboxError::Corrupt {
                name: path.to_string(),
                reason: "object is smaller than a mailbox header",
            },
            err if err.errno() == Some(io::Errno::NOENT) => MailboxError::NotFound {
                name: path.to_string(),
            },
            err => MailboxError::Shm(err),
        })?;

        let header = shm.view::<MailboxHeader>(0);
        if !wait_for_init(header, INIT_TIMEOUT) {
            return Err(MailboxError::Corrupt {
                name: path.to_string(),
                reason: "header was never initialized",
            });
        }

        let capacity = header.capacity.load(Ordering::Relaxed);
        let slot_size = header.slot_size.load(Ordering::Relaxed);
        if capacity == 0
            || slot_size < MESSAGE_SIZE
            || object_len(capacity, slot_size) != Some(shm.len())
        {
            return Err(MailboxError::Corrupt {
                name: path.to_string(),
                reason: "geometry does not match the object size",
            });
        }

        debug!(name = %path, capacity, slot_size, "mailbox opened");
        Ok(Self::from_shm(shm, capacity, slot_size))
    }
}

/// Spins until the creator has published the header or `timeout` expires.
fn wait_for_init(header: &MailboxHeader, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if header.init.0.load(Ordering::Acquire) == INIT_MAGIC {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        std::hint::spin_loop();
    }
}

impl<M: ShmMode> Mailbox<M> {
    fn from_shm(shm: Shm<M>, capacity: usize, slot_size: usize) -> Self {
        Self {
            shm,
            capacity,
            slot_size,
            send_lock: Mutex::new(()),
            wait_lock: Mutex::new(()),
            readable: Condvar::new(),
            recheck: RECHECK_INTERVAL,
        }
    }

    fn header(&self) -> &MailboxHeader {
        self.shm.view(0)
    }

    fn ring(&self) -> Ring<'_> {
        // SAFETY: the mapping is HEADER_SIZE + capacity * slot_size bytes
        // (checked at create/open) and lives as long as `self`.
        unsafe {
            let slots = self.shm.as_ptr().add(HEADER_SIZE);
            Ring::from_raw(&self.header().ring, slots, self.capacity, self.slot_size)
        }
    }

    /// The mailbox name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.shm.path().as_str()
    }

    /// Maximum number of buffered messages.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size of one slot in bytes.
    #[must_use]
    pub const fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Messages currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring().is_empty()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.header().closed.load(Ordering::Acquire)
    }

    /// Enqueues `msg` without blocking.
    ///
    /// # Errors
    ///
    /// - [`SendError::WouldBlock`] if all `capacity` slots are occupied; the
    ///   queue is left unchanged
    /// - [`SendError::Closed`] once the mailbox is closed
    pub fn send(&self, msg: &Message) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.push_frame(&Frame::encode(msg)?)?;
        trace!(name = %self.name(), kind = %msg.kind(), "message sent");
        Ok(())
    }

    /// Enqueues an already encoded frame and wakes a receiver.
    pub(crate) fn push_frame(&self, frame: &Frame) -> Result<(), SendError> {
        let pushed = {
            let _guard = self.send_lock.lock();
            // SAFETY: send_lock makes this the only pusher in the process.
            unsafe { self.ring().push(&frame.to_bytes()) }
        };
        if pushed.is_err() {
            return Err(SendError::WouldBlock);
        }

        // A receiver holds wait_lock from its emptiness check until it waits,
        // so taking it here orders this notify after that wait.
        drop(self.wait_lock.lock());
        self.readable.notify_one();
        Ok(())
    }

    /// Dequeues the oldest message, blocking while the mailbox is empty.
    ///
    /// # Errors
    ///
    /// - [`ReceiveError::Closed`] if the mailbox is closed, including while
    ///   this call is waiting
    /// - [`ReceiveError::UnknownVariant`] or [`ReceiveError::Frame`] if the
    ///   slot cannot be decoded; the slot is consumed
    pub fn receive(&self) -> Result<Message, ReceiveError> {
        let mut guard = self.wait_lock.lock();
        loop {
            if let Some(msg) = self.pop_locked(&guard)? {
                return Ok(msg);
            }
            self.readable.wait_for(&mut guard, self.recheck);
        }
    }

    /// Dequeues the oldest message if there is one.
    ///
    /// # Errors
    ///
    /// As [`Mailbox::receive`].
    pub fn try_receive(&self) -> Result<Option<Message>, ReceiveError> {
        let guard = self.wait_lock.lock();
        self.pop_locked(&guard)
    }

    /// Like [`Mailbox::receive`] but gives up after `timeout`, returning
    /// `Ok(None)`.
    ///
    /// # Errors
    ///
    /// As [`Mailbox::receive`].
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<Message>, ReceiveError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.wait_lock.lock();
        loop {
            if let Some(msg) = self.pop_locked(&guard)? {
                return Ok(Some(msg));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let remaining = deadline.duration_since(now);
            self.readable.wait_for(&mut guard, remaining.min(self.recheck));
        }
    }

    /// Pops and decodes one slot. The guard proves this is the only popper.
    fn pop_locked(&self, _guard: &MutexGuard<'_, ()>) -> Result<Option<Message>, ReceiveError> {
        if self.is_closed() {
            return Err(ReceiveError::Closed);
        }
        let mut bytes = [0u8; MESSAGE_SIZE];
        // SAFETY: wait_lock is held, so this is the only popper in the process.
        if !unsafe { self.ring().pop(&mut bytes) } {
            return Ok(None);
        }
        let msg = Frame::from_bytes(&bytes).decode()?;
        trace!(name = %self.name(), kind = %msg.kind(), "message received");
        Ok(Some(msg))
    }

    /// Marks the mailbox closed and wakes every blocked receiver.
    ///
    /// Later sends and receives fail with `Closed`. Idempotent; the flag is
    /// shared, so peers in other processes observe it too.
    pub fn close(&self) {
        if !self.header().closed.swap(true, Ordering::AcqRel) {
            debug!(name = %self.name(), pending = self.len(), "mailbox closed");
        }
        drop(self.wait_lock.lock());
        self.readable.notify_all();
    }
}

impl<M: ShmMode> fmt::Debug for Mailbox<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("name", &self.name())
            .field("capacity", &self.capacity)
            .field("slot_size", &self.slot_size)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

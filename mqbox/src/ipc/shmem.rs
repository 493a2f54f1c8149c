//! POSIX shared memory regions with typestate-based cleanup.
//!
//! This module wraps `shm_open`/`mmap` behind a safe handle whose cleanup
//! behavior is fixed at compile time:
//!
//! - [`Shm<Creator>`] owns the name: it creates the object exclusively and
//!   unlinks it on drop (unless it was already unlinked).
//! - [`Shm<Opener>`] attaches to an existing object and only unmaps on drop.
//!
//! Unlike a `Box`, a region is sized at runtime: the mailbox lays out a header
//! followed by `capacity * slot_size` bytes of slots, so the mapping is a byte
//! range and typed views are taken with [`Shm::view`].
//!
//! ```text
//! Unsafe POSIX operations:    Safe Rust wrappers:
//! ┌──────────────────┐        ┌────────────────────┐
//! │ shm_open()       │───────>│ Shm::create()      │
//! │ ftruncate()      │───────>│ Shm::create()      │
//! │ mmap()           │───────>│ Shm::open()        │
//! │ munmap()         │───────>│ Drop::drop()       │
//! │ shm_unlink()     │───────>│ Shm::unlink()      │
//! └──────────────────┘        └────────────────────┘
//! ```
//!
//! # Stale names
//!
//! A crashed creator leaves its name behind. Remove it before creating again:
//!
//! ```no_run
//! use mqbox::ipc::shmem::{ShmPath, unlink};
//!
//! let path = ShmPath::new("/my_mq")?;
//! let _ = unlink(&path);
//! # Ok::<(), mqbox::ipc::shmem::ShmError>(())
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::{
    AtomicBool, AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize, AtomicU8, AtomicU16,
    AtomicU32, AtomicU64, AtomicUsize, Ordering,
};

use rustix::fd::OwnedFd;
use rustix::fs::{Mode as FileMode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use thiserror::Error;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Contextual errors produced by [`Shm`] and [`ShmPath`].
#[derive(Debug, Error)]
pub enum ShmError {
    /// The provided POSIX shared memory name is invalid.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    /// `shm_open`, `ftruncate`, `mmap`, etc. failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    PosixError {
        op: &'static str,
        path: String,
        source: io::Errno,
    },
    /// The shared memory object is smaller than the caller requires.
    #[error("shared memory `{path}` size mismatch: expected at least {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },
}

impl ShmError {
    fn posix(op: &'static str, path: &ShmPath, err: io::Errno) -> Self {
        Self::PosixError {
            op,
            path: path.to_string(),
            source: err,
        }
    }

    /// Returns the errno behind a failed POSIX call, if any.
    #[must_use]
    pub const fn errno(&self) -> Option<io::Errno> {
        match self {
            Self::PosixError { source, .. } => Some(*source),
            _ => None,
        }
    }
}

const POSIX_NAME_MAX: usize = 255;

/// A validated POSIX shared memory object name.
///
/// Portable names start with `/`, contain no other `/` and are at most
/// `NAME_MAX` (255) bytes long.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShmPath(String);

impl ShmPath {
    /// Validates `path` and wraps it.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::InvalidPath`] if the name is not portable.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        validate_shm_path(&path)?;
        Ok(Self(path))
    }

    /// The name as passed to `shm_open`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ShmPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<ShmPath> for String {
    fn from(path: ShmPath) -> Self {
        path.0
    }
}

fn validate_shm_path(path: &str) -> Result<()> {
    let invalid = |reason| {
        Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason,
        })
    };

    if !path.starts_with('/') {
        return invalid("path must start with '/'");
    }
    if path.len() == 1 {
        return invalid("path must name an object after '/'");
    }
    if path[1..].contains('/') {
        return invalid("path must not contain additional '/' characters");
    }
    if path.len() > POSIX_NAME_MAX {
        return invalid("path length must be <= 255 bytes");
    }
    Ok(())
}

/// Trait defining cleanup behavior for shared memory modes.
///
/// `Shm<Creator>` and `Shm<Opener>` are different types with different
/// `Drop` behavior:
///
/// ```text
/// Creator          Opener
///    ↓                ↓
/// munmap()        munmap()
/// unlink()        (no unlink)
/// ```
pub trait ShmMode: Send + Sync + 'static {
    /// Whether the handle owns the name and removes it on drop.
    const OWNS_NAME: bool;
}

/// Typestate marker for the process that creates (and owns) the name.
pub struct Creator;
impl ShmMode for Creator {
    const OWNS_NAME: bool = true;
}

/// Typestate marker for peers that attach to an existing name.
pub struct Opener;
impl ShmMode for Opener {
    const OWNS_NAME: bool = false;
}

/// Types that may be viewed in place inside a shared mapping.
///
/// # Safety
///
/// Implementers must guarantee:
/// - `#[repr(C)]` or `#[repr(transparent)]` layout
/// - no pointers, references or heap allocations
/// - the all-zeroes bit pattern is a valid value (fresh mappings are zero-filled)
/// - concurrent access goes through atomics or an external protocol
/// - the type stays sound if `Drop` never runs
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    i8, i16, i32, i64, isize,
    u8, u16, u32, u64, usize,
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// A mapped POSIX shared memory object.
///
/// # Safety Invariants
///
/// - `ptr` points to `len` bytes mapped `READ | WRITE`, `MAP_SHARED`
/// - the mapping lives until `Drop`
/// - `ptr` is page aligned
pub struct Shm<Mode: ShmMode> {
    ptr: NonNull<u8>,
    len: usize,
    path: ShmPath,
    fd: OwnedFd,
    unlinked: AtomicBool,
    _mode: PhantomData<Mode>,
}

// SAFETY: the mapping is process-wide memory, not thread-local data; all
// mutation through it goes through `SharedMemorySafe` views.
unsafe impl<Mode: ShmMode> Send for Shm<Mode> {}

// SAFETY: see above, `&Shm` only hands out shared views.
unsafe impl<Mode: ShmMode> Sync for Shm<Mode> {}

fn map_shared(fd: &OwnedFd, len: usize, path: &ShmPath) -> Result<NonNull<u8>> {
    // SAFETY: a fresh mapping of a valid shm descriptor; it aliases no Rust
    // object in this process and is page aligned.
    let ptr = unsafe {
        mmap(
            null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|err| ShmError::posix("mmap", path, err))?;

    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| ShmError::posix("mmap", path, io::Errno::NOMEM))
}

impl Shm<Creator> {
    /// Creates a new, zero-filled object of `len` bytes and maps it.
    ///
    /// # Errors
    ///
    /// - `EEXIST` if an object with this name already exists
    /// - `EACCES`, `ENOMEM`, `EMFILE`, ... from the underlying calls
    /// - `EINVAL` when `len` is zero
    pub fn create(path: &ShmPath, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(ShmError::posix("ftruncate", path, io::Errno::INVAL));
        }

        let fd = shm::open(
            path.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            FileMode::RUSR | FileMode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", path, err))?;

        let mapped = ftruncate(&fd, len as u64)
            .map_err(|err| ShmError::posix("ftruncate", path, err))
            .and_then(|()| map_shared(&fd, len, path));

        match mapped {
            Ok(ptr) => Ok(Self {
                ptr,
                len,
                path: path.clone(),
                fd,
                unlinked: AtomicBool::new(false),
                _mode: PhantomData,
            }),
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(path.as_str());
                Err(err)
            }
        }
    }

    /// Removes the name, once.
    ///
    /// Returns `Ok(true)` when this call removed the name and `Ok(false)` when
    /// it was already gone or now refers to a different object (someone
    /// unlinked it by name and created a new one). The mapping stays valid.
    ///
    /// # Errors
    ///
    /// Returns the `shm_unlink` errno for anything other than `ENOENT`.
    pub fn unlink(&self) -> Result<bool> {
        if self.unlinked.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        if !self.still_named() {
            return Ok(false);
        }
        unlink(&self.path)
    }
}

impl Shm<Opener> {
    /// Opens an existing object and maps all of it.
    ///
    /// # Errors
    ///
    /// - `ENOENT` if the name does not exist
    /// - [`ShmError::SizeMismatch`] if it is smaller than `min_len`
    pub fn open(path: &ShmPath, min_len: usize) -> Result<Self> {
        let fd = shm::open(path.as_str(), shm::OFlags::RDWR, FileMode::empty())
            .map_err(|err| ShmError::posix("shm_open", path, err))?;

        let stat = fstat(&fd).map_err(|err| ShmError::posix("fstat", path, err))?;
        let len = usize::try_from(stat.st_size).unwrap_or(0);
        if len == 0 || len < min_len {
            return Err(ShmError::SizeMismatch {
                path: path.to_string(),
                expected: min_len.max(1),
                actual: stat.st_size,
            });
        }

        let ptr = map_shared(&fd, len, path)?;
        Ok(Self {
            ptr,
            len,
            path: path.clone(),
            fd,
            unlinked: AtomicBool::new(true),
            _mode: PhantomData,
        })
    }
}

impl<Mode: ShmMode> Shm<Mode> {
    /// Size of the mapping in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Always `false`: zero-sized objects are rejected at construction.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The object's name.
    #[must_use]
    pub const fn path(&self) -> &ShmPath {
        &self.path
    }

    /// Base address of the mapping.
    #[must_use]
    pub const fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Views `T` in place at `offset` bytes into the mapping.
    ///
    /// # Panics
    ///
    /// Panics if `T` does not fit at `offset` or `offset` is misaligned for `T`.
    #[must_use]
    pub fn view<T: SharedMemorySafe>(&self, offset: usize) -> &T {
        assert!(
            offset
                .checked_add(size_of::<T>())
                .is_some_and(|end| end <= self.len),
            "view out of bounds"
        );
        assert_eq!(offset % align_of::<T>(), 0, "misaligned view");

        // SAFETY: bounds and alignment are checked above, the base is page
        // aligned, and `SharedMemorySafe` guarantees any bit pattern written
        // by a conforming peer (including all zeroes) is a valid `T`.
        unsafe { &*self.ptr.as_ptr().add(offset).cast::<T>() }
    }

    /// Whether `path` still resolves to the object behind this mapping.
    fn still_named(&self) -> bool {
        let Ok(current) = shm::open(self.path.as_str(), shm::OFlags::RDONLY, FileMode::empty()) else {
            return false;
        };
        match (fstat(&current), fstat(&self.fd)) {
            (Ok(named), Ok(ours)) => named.st_dev == ours.st_dev && named.st_ino == ours.st_ino,
            _ => false,
        }
    }
}

impl<Mode: ShmMode> Drop for Shm<Mode> {
    fn drop(&mut self) {
        if Mode::OWNS_NAME && !self.unlinked.swap(true, Ordering::AcqRel) && self.still_named() {
            let _ = unlink(&self.path);
        }

        // SAFETY: ptr/len describe the mapping created in the constructor.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

/// Removes a shared memory name.
///
/// Returns `Ok(true)` if the name was removed and `Ok(false)` if it did not
/// exist.
///
/// # Errors
///
/// Returns the `shm_unlink` errno for anything other than `ENOENT`.
pub fn unlink(path: &ShmPath) -> Result<bool> {
    match shm::unlink(path.as_str()) {
        Ok(()) => Ok(true),
        Err(err) if err == io::Errno::NOENT => Ok(false),
        Err(err) => Err(ShmError::posix("shm_unlink", path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_path(tag: &str) -> ShmPath {
        let nonce: u32 = rand::random();
        ShmPath::new(format!("/mqbox-shm-{tag}-{}-{nonce}", std::process::id())).unwrap()
    }

    fn create_or_skip(path: &ShmPath, len: usize, test: &str) -> Option<Shm<Creator>> {
        match Shm::<Creator>::create(path, len) {
            Ok(shm) => Some(shm),
            Err(err) if err.errno() == Some(io::Errno::ACCESS) => {
                eprintln!("Skipping {test}: {err}");
                None
            }
            Err(err) => panic!("{test}: {err}"),
        }
    }

    #[test]
    fn test_validate_shm_path_valid() {
        assert!(ShmPath::new("/valid").is_ok());
        assert!(ShmPath::new("/my_mq").is_ok());
        assert!(ShmPath::new("/valid-name_123").is_ok());
    }

    #[test]
    fn test_validate_shm_path_no_leading_slash() {
        let result = ShmPath::new("no-slash");
        assert!(matches!(
            result,
            Err(ShmError::InvalidPath { reason, .. }) if reason == "path must start with '/'"
        ));
    }

    #[test]
    fn test_validate_shm_path_bare_slash() {
        assert!(matches!(
            ShmPath::new("/"),
            Err(ShmError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_validate_shm_path_extra_slashes() {
        let result = ShmPath::new("/foo/bar");
        assert!(matches!(
            result,
            Err(ShmError::InvalidPath { reason, .. })
                if reason == "path must not contain additional '/' characters"
        ));
    }

    #[test]
    fn test_validate_shm_path_length() {
        assert!(ShmPath::new(format!("/{}", "a".repeat(254))).is_ok());
        assert!(matches!(
            ShmPath::new(format!("/{}", "a".repeat(255))),
            Err(ShmError::InvalidPath { reason, .. }) if reason == "path length must be <= 255 bytes"
        ));
    }

    #[test]
    fn test_create_is_zero_filled_and_shared_with_opener() {
        let path = unique_path("share");
        let Some(creator) = create_or_skip(&path, 128, "test_create_is_zero_filled") else {
            return;
        };

        let counter = creator.view::<AtomicU64>(64);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        counter.store(42, Ordering::SeqCst);

        {
            let opener = Shm::<Opener>::open(&path, 128).unwrap();
            assert_eq!(opener.len(), 128);
            let seen = opener.view::<AtomicU64>(64);
            assert_eq!(seen.load(Ordering::SeqCst), 42);
            seen.store(7, Ordering::SeqCst);
        }

        assert_eq!(counter.load(Ordering::SeqCst), 7);
        assert!(creator.unlink().unwrap());
    }

    #[test]
    fn test_create_exclusive() {
        let path = unique_path("excl");
        let Some(creator) = create_or_skip(&path, 64, "test_create_exclusive") else {
            return;
        };

        let err = Shm::<Creator>::create(&path, 64).err().unwrap();
        assert_eq!(err.errno(), Some(io::Errno::EXIST));
        assert!(creator.unlink().unwrap());
    }

    #[test]
    fn test_unlink_is_idempotent() {
        let path = unique_path("unlink");
        let Some(creator) = create_or_skip(&path, 64, "test_unlink_is_idempotent") else {
            return;
        };

        assert!(creator.unlink().unwrap());
        assert!(!creator.unlink().unwrap());
        assert!(!unlink(&path).unwrap());
        let err = Shm::<Opener>::open(&path, 64).err().unwrap();
        assert_eq!(err.errno(), Some(io::Errno::NOENT));
    }

    #[test]
    fn test_unlink_skips_recreated_name() {
        let path = unique_path("recreate");
        let Some(first) = create_or_skip(&path, 64, "test_unlink_skips_recreated_name") else {
            return;
        };

        assert!(unlink(&path).unwrap());
        let second = Shm::<Creator>::create(&path, 64).unwrap();

        // The stale handle must not remove the new owner's name.
        assert!(!first.unlink().unwrap());
        assert!(Shm::<Opener>::open(&path, 64).is_ok());
        assert!(second.unlink().unwrap());
    }

    #[test]
    fn test_open_size_mismatch() {
        let path = unique_path("size");
        let Some(creator) = create_or_skip(&path, 64, "test_open_size_mismatch") else {
            return;
        };

        match Shm::<Opener>::open(&path, 4096) {
            Err(ShmError::SizeMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 4096);
                assert_eq!(actual, 64);
            }
            Err(e) => panic!("Expected SizeMismatch error, got: {e}"),
            Ok(_) => panic!("Expected SizeMismatch error, but open() succeeded"),
        }
        assert!(creator.unlink().unwrap());
    }
}

//! Cross-process building blocks: named POSIX shared memory.

pub mod shmem;

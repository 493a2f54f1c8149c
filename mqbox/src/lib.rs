//! A bounded, named, type-tagged mailbox and the producer/consumer runtime
//! built around it.
//!
//! - [`message`]: the tagged [`Message`] value
//! - [`data`]: its fixed-size wire [`Frame`](data::Frame)
//! - [`mailbox`]: the named queue, backed by POSIX shared memory
//! - [`producer`], [`consumer`]: the two loops
//! - [`runtime`], [`signal`]: startup, cancellation and shutdown

pub mod cancel;
pub mod consumer;
pub mod data;
pub mod ipc;
pub mod mailbox;
pub mod message;
pub mod producer;
pub mod runtime;
pub mod signal;
mod spsc;
mod trace;

pub use cancel::CancelToken;
pub use mailbox::{Mailbox, MailboxConfig, MailboxError, ReceiveError, SendError};
pub use message::{Kind, Message, Text};
pub use runtime::{Runtime, RuntimeConfig, ShutdownHandle, ShutdownReport, StartupError};
pub use trace::init_tracing;

#[doc(inline)]
pub use ipc::shmem::SharedMemorySafe;

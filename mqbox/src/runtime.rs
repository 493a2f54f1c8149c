//! Runtime: owns the mailbox and both loop threads, and shuts them down.
//!
//! # Shutdown
//!
//! ```text
//! trigger()            shutdown()
//!    │                    │
//!    ├─ cancel token      ├─ trigger() (no-op if already done)
//!    └─ close mailbox     ├─ join producer, join consumer
//!                         └─ destroy mailbox (once)
//! ```
//!
//! Triggering only requests the stop, so it is safe from any thread and any
//! number of times. The mailbox name is released only after both loops have
//! been joined.
//!
//! Either loop exiting on its own (a panic on an unknown message kind, or a
//! peer closing the mailbox) also triggers shutdown, so [`ShutdownHandle::wait`]
//! returns and the owner can join and release.
//!
//! # Example
//!
//! ```no_run
//! use mqbox::runtime::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::spawn(RuntimeConfig::default())?;
//! let handle = runtime.handle();
//! // ... hand `handle` to whatever decides when to stop ...
//! handle.trigger();
//! let report = runtime.shutdown();
//! println!("{report:?}");
//! # Ok::<(), mqbox::runtime::StartupError>(())
//! ```

use std::any::Any;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::cancel::CancelToken;
use crate::consumer::{Consumer, ConsumerConfig, ConsumerStats};
use crate::mailbox::{Mailbox, MailboxConfig, MailboxError};
use crate::message::Message;
use crate::producer::{Producer, ProducerConfig, ProducerStats};
use crate::trace::{debug, error, info, warn};

/// Name of the producer thread.
pub const PRODUCER_THREAD: &str = "mq-producer";

/// Name of the consumer thread.
pub const CONSUMER_THREAD: &str = "mq-consumer";

/// Stack size of both loop threads.
pub const LOOP_STACK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub mailbox: MailboxConfig,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
}

/// Errors that prevent the runtime from starting.
///
/// Nothing is left behind on failure: started threads are joined and the
/// mailbox is destroyed.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to create mailbox: {0}")]
    Mailbox(#[from] MailboxError),
    #[error("failed to spawn {thread} thread: {source}")]
    Spawn {
        thread: &'static str,
        #[source]
        source: io::Error,
    },
}

/// How a loop thread ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadExit<T> {
    /// The loop returned normally.
    Finished(T),
    /// The loop panicked with this message.
    Panicked(String),
}

impl<T> ThreadExit<T> {
    fn from_join(result: thread::Result<T>) -> Self {
        match result {
            Ok(stats) => Self::Finished(stats),
            Err(payload) => Self::Panicked(panic_message(payload.as_ref())),
        }
    }

    /// The loop's result, if it did not panic.
    #[must_use]
    pub const fn stats(&self) -> Option<&T> {
        match self {
            Self::Finished(stats) => Some(stats),
            Self::Panicked(_) => None,
        }
    }

    #[must_use]
    pub const fn is_panicked(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Outcome of [`Runtime::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub producer: ThreadExit<ProducerStats>,
    pub consumer: ThreadExit<ConsumerStats>,
    /// Whether this shutdown released the mailbox name. `false` if it was
    /// already removed by name from outside.
    pub released: bool,
}

/// Clonable handle that requests shutdown.
#[derive(Clone)]
pub struct ShutdownHandle {
    cancel: CancelToken,
    mailbox: Arc<Mailbox>,
}

impl ShutdownHandle {
    /// Requests shutdown: cancels both loops and closes the mailbox.
    ///
    /// Returns `true` for the first call and `false` for every later one,
    /// which does nothing.
    pub fn trigger(&self) -> bool {
        if !self.cancel.cancel() {
            debug!("shutdown already triggered");
            return false;
        }
        info!(name = %self.mailbox.name(), "shutdown triggered");
        self.mailbox.close();
        true
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Blocks until shutdown is triggered.
    pub fn wait(&self) {
        self.cancel.wait();
    }

    /// Blocks until shutdown is triggered or `timeout` elapses; returns
    /// whether it was triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.cancel.wait_timeout(timeout)
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("mailbox", &self.mailbox.name())
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

/// A running producer/consumer pair and the mailbox between them.
///
/// Dropping the runtime without calling [`Runtime::shutdown`] performs the
/// same shutdown and discards the report.
pub struct Runtime {
    mailbox: Arc<Mailbox>,
    shutdown: ShutdownHandle,
    producer: Option<JoinHandle<ProducerStats>>,
    consumer: Option<JoinHandle<ConsumerStats>>,
    stopped: bool,
}

/// Triggers shutdown when a loop thread exits, whether it returned or
/// unwound. A loop that stops on its own takes the runtime down with it.
struct ExitGuard {
    #[cfg_attr(not(feature = "tracing"), allow(dead_code))]
    thread: &'static str,
    shutdown: ShutdownHandle,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if !self.shutdown.trigger() {
            return;
        }
        if thread::panicking() {
            error!(thread = self.thread, "loop thread panicked, shutdown triggered");
        } else {
            warn!(thread = self.thread, "loop thread exited, shutdown triggered");
        }
    }
}

fn spawn_loop<T, F>(
    name: &'static str,
    shutdown: ShutdownHandle,
    body: F,
) -> Result<JoinHandle<T>, StartupError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    debug!(thread = name, "spawning loop thread");
    thread::Builder::new()
        .name(name.into())
        .stack_size(LOOP_STACK_SIZE)
        .spawn(move || {
            let _guard = ExitGuard {
                thread: name,
                shutdown,
            };
            body()
        })
        .map_err(|source| {
            error!(thread = name, error = %source, "failed to spawn loop thread");
            StartupError::Spawn { thread: name, source }
        })
}

impl Runtime {
    /// Creates the mailbox and starts both loops, discarding received
    /// messages after logging them.
    ///
    /// # Errors
    ///
    /// See [`StartupError`].
    pub fn spawn(config: RuntimeConfig) -> Result<Self, StartupError> {
        Self::spawn_with_handler(config, |_| {})
    }

    /// Like [`Runtime::spawn`], passing every received message to `handler`
    /// on the consumer thread.
    ///
    /// # Errors
    ///
    /// See [`StartupError`].
    pub fn spawn_with_handler<F>(config: RuntimeConfig, handler: F) -> Result<Self, StartupError>
    where
        F: FnMut(&Message) + Send + 'static,
    {
        info!(
            name = %config.mailbox.name,
            capacity = config.mailbox.capacity,
            slot_size = config.mailbox.slot_size,
            "runtime starting"
        );

        let mailbox = Arc::new(Mailbox::create_with(&config.mailbox)?);
        let cancel = CancelToken::new();
        let shutdown = ShutdownHandle {
            cancel: cancel.clone(),
            mailbox: Arc::clone(&mailbox),
        };

        let mut runtime = Self {
            mailbox: Arc::clone(&mailbox),
            shutdown,
            producer: None,
            consumer: None,
            stopped: false,
        };

        // On error `runtime` drops here, which stops whatever was started and
        // destroys the mailbox.
        let producer = Producer::new(Arc::clone(&mailbox), config.producer, cancel.clone());
        runtime.producer = Some(spawn_loop(
            PRODUCER_THREAD,
            runtime.handle(),
            move || producer.run(),
        )?);

        let consumer = Consumer::new(mailbox, config.consumer, cancel);
        runtime.consumer = Some(spawn_loop(
            CONSUMER_THREAD,
            runtime.handle(),
            move || consumer.run(handler),
        )?);

        info!("runtime started");
        Ok(runtime)
    }

    /// A handle for requesting shutdown from elsewhere (a signal thread).
    #[must_use]
    pub fn handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// The mailbox shared by the loops.
    #[must_use]
    pub const fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    /// Stops both loops, waits for them and destroys the mailbox.
    #[must_use = "the report says whether a loop panicked"]
    pub fn shutdown(mut self) -> ShutdownReport {
        self.stop()
    }

    fn stop(&mut self) -> ShutdownReport {
        self.stopped = true;
        info!("runtime shutdown initiated");
        self.shutdown.trigger();

        let producer = match self.producer.take() {
            Some(handle) => {
                debug!("waiting for producer thread to exit");
                ThreadExit::from_join(handle.join())
            }
            None => ThreadExit::Finished(ProducerStats::default()),
        };
        let consumer = match self.consumer.take() {
            Some(handle) => {
                debug!("waiting for consumer thread to exit");
                ThreadExit::from_join(handle.join())
            }
            None => ThreadExit::Finished(ConsumerStats::default()),
        };
        if let ThreadExit::Panicked(msg) = &producer {
            error!(thread = PRODUCER_THREAD, panic = %msg, "loop thread panicked");
        }
        if let ThreadExit::Panicked(msg) = &consumer {
            error!(thread = CONSUMER_THREAD, panic = %msg, "loop thread panicked");
        }

        let released = match self.mailbox.destroy() {
            Ok(released) => released,
            Err(err) => {
                warn!(name = %self.mailbox.name(), error = %err, "failed to destroy mailbox");
                false
            }
        };

        info!(released, "runtime shutdown complete");
        ShutdownReport {
            producer,
            consumer,
            released,
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !self.stopped {
            let _ = self.stop();
        }
    }
}

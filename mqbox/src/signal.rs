//! Forwards process signals to a [`ShutdownHandle`].
//!
//! Signals are received on a dedicated thread through `signal-hook`, so the
//! handler itself does nothing but record delivery:
//!
//! - `SIGINT`, `SIGTERM`: trigger shutdown
//! - `SIGHUP`: logged and ignored

use std::ffi::c_int;
use std::io;
use std::thread::{self, JoinHandle};

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};

use crate::runtime::ShutdownHandle;
use crate::trace::{debug, info, warn};

/// Name of the listener thread.
pub const SIGNAL_THREAD: &str = "mq-signals";

/// Signals the listener subscribes to.
pub const SIGNALS: [c_int; 3] = [SIGINT, SIGTERM, SIGHUP];

/// A running signal listener. Stops when closed or dropped.
pub struct SignalListener {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalListener {
    /// Registers for [`SIGNALS`] and starts forwarding them to `shutdown`.
    ///
    /// # Errors
    ///
    /// Fails if the signal handlers cannot be installed or the thread cannot
    /// be spawned.
    pub fn spawn(shutdown: ShutdownHandle) -> io::Result<Self> {
        let mut signals = Signals::new(SIGNALS)?;
        let handle = signals.handle();

        let thread = thread::Builder::new()
            .name(SIGNAL_THREAD.into())
            .spawn(move || {
                for signal in signals.forever() {
                    match signal {
                        SIGINT | SIGTERM => {
                            info!(signal, "shutdown signal received");
                            shutdown.trigger();
                        }
                        other => warn!(signal = other, "ignoring signal"),
                    }
                }
                debug!("signal listener exiting");
            });
        let thread = match thread {
            Ok(thread) => thread,
            Err(err) => {
                handle.close();
                return Err(err);
            }
        };

        debug!(signals = ?SIGNALS, "signal listener started");
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Unregisters and joins the listener thread.
    pub fn close(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.stop();
    }
}

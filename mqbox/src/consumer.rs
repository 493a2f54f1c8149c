//! Consumer loop: receives messages and dispatches on their kind.

use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::ipc::shmem::{Creator, ShmMode};
use crate::mailbox::{Mailbox, ReceiveError};
use crate::message::Message;
use crate::trace::{debug, error, info};

/// Poll period used by [`ReceiveMode::polling`].
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_millis(10);

/// How the consumer waits for messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiveMode {
    /// Block in [`Mailbox::receive`] until a message arrives or the mailbox
    /// closes.
    #[default]
    Blocking,
    /// Try to receive, then sleep for the period, forever.
    Polling(Duration),
}

impl ReceiveMode {
    /// Polling at [`DEFAULT_POLL_PERIOD`].
    #[must_use]
    pub const fn polling() -> Self {
        Self::Polling(DEFAULT_POLL_PERIOD)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumerConfig {
    pub mode: ReceiveMode,
}

/// Counters returned when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Messages decoded and handed to the handler.
    pub received: u64,
    /// Slots that could not be decoded and were skipped.
    pub malformed: u64,
}

/// The receiving side of the demo pipeline.
///
/// In blocking mode cancellation reaches a consumer parked in `receive`
/// through [`Mailbox::close`], which the shutdown path always calls.
pub struct Consumer<M: ShmMode = Creator> {
    mailbox: Arc<Mailbox<M>>,
    config: ConsumerConfig,
    cancel: CancelToken,
}

impl<M: ShmMode> Consumer<M> {
    #[must_use]
    pub const fn new(mailbox: Arc<Mailbox<M>>, config: ConsumerConfig, cancel: CancelToken) -> Self {
        Self {
            mailbox,
            config,
            cancel,
        }
    }

    fn next(&self) -> Result<Option<Message>, ReceiveError> {
        match self.config.mode {
            ReceiveMode::Blocking => self.mailbox.receive().map(Some),
            ReceiveMode::Polling(_) => self.mailbox.try_receive(),
        }
    }

    /// Runs until cancelled or until the mailbox is closed, passing every
    /// message to `handler`.
    ///
    /// # Panics
    ///
    /// Panics on a message whose kind tag is unknown; the producer and
    /// consumer disagree about the wire format and nothing sensible can be
    /// done with the payload.
    pub fn run<F: FnMut(&Message)>(self, mut handler: F) -> ConsumerStats {
        let mut stats = ConsumerStats::default();
        debug!(name = %self.mailbox.name(), mode = ?self.config.mode, "consumer running");

        while !self.cancel.is_cancelled() {
            match self.next() {
                Ok(Some(msg)) => {
                    stats.received += 1;
                    info!(kind = %msg.kind(), value = %msg.value(), "message received");
                    handler(&msg);
                }
                Ok(None) => {}
                Err(ReceiveError::Closed) => {
                    debug!("mailbox closed, consumer stopping");
                    break;
                }
                Err(ReceiveError::UnknownVariant(tag)) => {
                    error!(tag, "message with unknown kind tag");
                    panic!("received message with unknown kind tag {tag}");
                }
                Err(ReceiveError::Frame(err)) => {
                    stats.malformed += 1;
                    error!(error = %err, "skipping undecodable message");
                }
            }

            if let ReceiveMode::Polling(period) = self.config.mode
                && !self.cancel.sleep(period)
            {
                break;
            }
        }

        info!(received = stats.received, "consumer stopped");
        stats
    }
}

//! Producer loop: sends one message of each kind in turn at a fixed period.
//!
//! A full mailbox never stalls the loop: the message is dropped, counted and
//! logged, and the rotation moves on to the next kind.

use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::ipc::shmem::{Creator, ShmMode};
use crate::mailbox::{Mailbox, SendError};
use crate::message::{Kind, Message};
use crate::trace::{debug, error, info, warn};

/// Period used when none is configured.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerConfig {
    /// Pause after each send attempt.
    pub period: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
        }
    }
}

/// The value sent for each kind.
#[must_use]
#[allow(clippy::approx_constant)]
pub fn sample(kind: Kind) -> Message {
    match kind {
        Kind::U32 => Message::U32(99_999_999),
        Kind::I32 => Message::I32(-1_324_287),
        Kind::U16 => Message::U16(100),
        Kind::I16 => Message::I16(-45),
        Kind::U8 => Message::U8(5),
        Kind::F32 => Message::F32(3.1415),
        Kind::Str => Message::text("This is a test str\n"),
    }
}

/// Round-robin over every [`Kind`], starting at `U32`.
///
/// Never ends; each step yields the [`sample`] of the current kind.
#[derive(Debug, Clone)]
pub struct Rotation {
    next: Kind,
}

impl Default for Rotation {
    fn default() -> Self {
        Self::new()
    }
}

impl Rotation {
    #[must_use]
    pub const fn new() -> Self {
        Self { next: Kind::U32 }
    }

    /// The kind the next step will produce.
    #[must_use]
    pub const fn peek(&self) -> Kind {
        self.next
    }

    /// Produces the current sample and advances.
    pub fn step(&mut self) -> Message {
        let msg = sample(self.next);
        self.next = self.next.next();
        msg
    }
}

impl Iterator for Rotation {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        Some(self.step())
    }
}

/// Counters returned when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    /// Messages enqueued.
    pub sent: u64,
    /// Messages discarded because the mailbox was full.
    pub dropped: u64,
}

/// The sending side of the demo pipeline.
pub struct Producer<M: ShmMode = Creator> {
    mailbox: Arc<Mailbox<M>>,
    config: ProducerConfig,
    cancel: CancelToken,
}

impl<M: ShmMode> Producer<M> {
    #[must_use]
    pub const fn new(mailbox: Arc<Mailbox<M>>, config: ProducerConfig, cancel: CancelToken) -> Self {
        Self {
            mailbox,
            config,
            cancel,
        }
    }

    /// Runs until cancelled or until the mailbox is closed.
    pub fn run(self) -> ProducerStats {
        let mut rotation = Rotation::new();
        let mut stats = ProducerStats::default();
        debug!(
            name = %self.mailbox.name(),
            period_us = u64::try_from(self.config.period.as_micros()).unwrap_or(u64::MAX),
            "producer running"
        );

        while !self.cancel.is_cancelled() {
            let msg = rotation.step();
            match self.mailbox.send(&msg) {
                Ok(()) => {
                    stats.sent += 1;
                    debug!(kind = %msg.kind(), "message sent");
                }
                Err(SendError::WouldBlock) => {
                    stats.dropped += 1;
                    warn!(kind = %msg.kind(), dropped = stats.dropped, "mailbox full, message dropped");
                }
                Err(SendError::Closed) => {
                    debug!("mailbox closed, producer stopping");
                    break;
                }
                Err(err @ SendError::Frame(_)) => {
                    stats.dropped += 1;
                    error!(kind = %msg.kind(), error = %err, "failed to encode message");
                }
            }

            if !self.cancel.sleep(self.config.period) {
                break;
            }
        }

        info!(sent = stats.sent, dropped = stats.dropped, "producer stopped");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::frame::MESSAGE_SIZE;
    use std::thread;

    fn unique_name(tag: &str) -> String {
        let nonce: u32 = rand::random();
        format!("/mqbox-producer-{tag}-{}-{nonce}", std::process::id())
    }

    fn create_or_skip(name: &str, capacity: usize) -> Option<Arc<Mailbox>> {
        match Mailbox::create(name, capacity, MESSAGE_SIZE) {
            Ok(mailbox) => Some(Arc::new(mailbox)),
            Err(err) if err.errno() == Some(rustix::io::Errno::ACCESS) => {
                eprintln!("Skipping: {err}");
                None
            }
            Err(err) => panic!("{err}"),
        }
    }

    #[test]
    fn rotation_visits_every_kind_then_wraps() {
        let kinds: Vec<Kind> = Rotation::new().take(9).map(|msg| msg.kind()).collect();
        assert_eq!(
            kinds,
            [
                Kind::U32,
                Kind::I32,
                Kind::U16,
                Kind::I16,
                Kind::U8,
                Kind::F32,
                Kind::Str,
                Kind::U32,
                Kind::I32,
            ]
        );
    }

    #[test]
    fn rotation_peek_tracks_step() {
        let mut rotation = Rotation::new();
        for _ in 0..20 {
            let kind = rotation.peek();
            assert_eq!(rotation.step().kind(), kind);
        }
    }

    #[test]
    fn samples_match_kinds() {
        for kind in Kind::ALL {
            assert_eq!(sample(kind).kind(), kind);
        }
        assert_eq!(sample(Kind::U32), Message::U32(99_999_999));
        let Message::Str(text) = sample(Kind::Str) else {
            panic!("wrong kind");
        };
        assert_eq!(text.as_str(), "This is a test str\n");
    }

    #[test]
    fn full_mailbox_drops_and_continues() {
        let Some(mailbox) = create_or_skip(&unique_name("full"), 2) else {
            return;
        };
        let cancel = CancelToken::new();
        let producer = Producer::new(
            Arc::clone(&mailbox),
            ProducerConfig {
                period: Duration::from_millis(1),
            },
            cancel.clone(),
        );

        let worker = thread::spawn(move || producer.run());
        while mailbox.len() < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        let stats = worker.join().unwrap();

        assert_eq!(stats.sent, 2);
        assert!(stats.dropped >= 1, "expected drops, got {stats:?}");

        // Exactly the first two samples were kept, in order.
        assert_eq!(mailbox.receive().unwrap(), sample(Kind::U32));
        assert_eq!(mailbox.receive().unwrap(), sample(Kind::I32));
        assert!(mailbox.is_empty());
    }

    #[test]
    fn closed_mailbox_stops_producer() {
        let Some(mailbox) = create_or_skip(&unique_name("closed"), 2) else {
            return;
        };
        mailbox.close();
        let producer = Producer::new(mailbox, ProducerConfig::default(), CancelToken::new());
        assert_eq!(producer.run(), ProducerStats::default());
    }

    #[test]
    fn cancel_interrupts_period() {
        let Some(mailbox) = create_or_skip(&unique_name("cancel"), 2) else {
            return;
        };
        let cancel = CancelToken::new();
        let producer = Producer::new(
            Arc::clone(&mailbox),
            ProducerConfig {
                period: Duration::from_secs(60),
            },
            cancel.clone(),
        );

        let worker = thread::spawn(move || producer.run());
        while mailbox.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        cancel.cancel();
        let stats = worker.join().unwrap();
        assert_eq!(stats, ProducerStats { sent: 1, dropped: 0 });
    }
}

//! End-to-end scenarios over the public API: a mailbox shared between
//! threads, the runtime lifecycle and name reuse.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=mqbox=debug cargo test -p mqbox --test mailbox_scenarios -- --nocapture
//! ```

use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use mqbox::data::{Frame, MESSAGE_SIZE};
use mqbox::mailbox::{self, Mailbox, MailboxConfig, MailboxError, ReceiveError, SendError};
use mqbox::message::{Kind, Message};
use mqbox::producer::ProducerConfig;
use mqbox::runtime::{Runtime, RuntimeConfig, StartupError};

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        mqbox::init_tracing();
    });
}

fn unique_name(tag: &str) -> String {
    let nonce: u32 = rand::random();
    format!("/mqbox-it-{tag}-{}-{nonce}", std::process::id())
}

fn permission_denied(err: &MailboxError) -> bool {
    err.errno() == Some(rustix::io::Errno::ACCESS)
}

fn create_or_skip(name: &str, capacity: usize, test: &str) -> Option<Mailbox> {
    match Mailbox::create(name, capacity, MESSAGE_SIZE) {
        Ok(mailbox) => Some(mailbox),
        Err(err) if permission_denied(&err) => {
            eprintln!("Skipping {test}: {err}");
            None
        }
        Err(err) => panic!("{test}: {err}"),
    }
}

#[test]
fn capacity_two_rejects_third_and_keeps_order() {
    init_test_tracing();
    let name = unique_name("cap2");
    let Some(mailbox) = create_or_skip(&name, 2, "capacity_two_rejects_third_and_keeps_order")
    else {
        return;
    };

    mailbox.send(&Message::U32(99_999_999)).unwrap();
    mailbox.send(&Message::I32(-1_324_287)).unwrap();
    assert!(matches!(mailbox.send(&Message::U16(100)), Err(SendError::WouldBlock)));
    assert_eq!(mailbox.len(), 2);

    assert_eq!(mailbox.receive().unwrap(), Message::U32(99_999_999));
    assert_eq!(mailbox.receive().unwrap(), Message::I32(-1_324_287));
    assert!(mailbox.try_receive().unwrap().is_none());

    mailbox.close();
    assert!(mailbox.destroy().unwrap());
}

#[test]
fn text_round_trips_exactly() {
    init_test_tracing();
    let name = unique_name("hello");
    let Some(mailbox) = create_or_skip(&name, 10, "text_round_trips_exactly") else {
        return;
    };

    mailbox.send(&Message::text("hello")).unwrap();
    let received = mailbox.receive().unwrap();
    assert_eq!(received.kind(), Kind::Str);
    let Message::Str(text) = received else {
        panic!("expected text, got {received:?}");
    };
    assert_eq!(text.as_str(), "hello");
    assert_eq!(
        Frame::encode(&received).unwrap(),
        Frame::encode(&Message::text("hello")).unwrap()
    );
}

#[test]
fn threads_exchange_every_kind_in_order() {
    init_test_tracing();
    let name = unique_name("threads");
    let Some(mailbox) = create_or_skip(&name, 10, "threads_exchange_every_kind_in_order") else {
        return;
    };
    let mailbox = Arc::new(mailbox);
    let expected: Vec<Message> = mqbox::producer::Rotation::new().take(50).collect();

    let consumer = {
        let mailbox = Arc::clone(&mailbox);
        thread::spawn(move || {
            let mut seen = Vec::new();
            loop {
                match mailbox.receive() {
                    Ok(msg) => seen.push(msg),
                    Err(ReceiveError::Closed) => return seen,
                    Err(err) => panic!("receive failed: {err}"),
                }
            }
        })
    };

    for msg in &expected {
        loop {
            match mailbox.send(msg) {
                Ok(()) => break,
                Err(SendError::WouldBlock) => thread::sleep(Duration::from_millis(1)),
                Err(err) => panic!("send failed: {err}"),
            }
        }
    }
    while !mailbox.is_empty() {
        thread::sleep(Duration::from_millis(1));
    }
    thread::sleep(Duration::from_millis(10));
    mailbox.close();

    assert_eq!(consumer.join().unwrap(), expected);
}

#[test]
fn destroy_then_create_gives_empty_mailbox() {
    init_test_tracing();
    let name = unique_name("recreate");
    let Some(first) = create_or_skip(&name, 4, "destroy_then_create_gives_empty_mailbox") else {
        return;
    };
    first.send(&Message::U8(1)).unwrap();
    first.send(&Message::U8(2)).unwrap();
    first.close();
    assert!(first.destroy().unwrap());

    let second = Mailbox::create(&name, 4, MESSAGE_SIZE).unwrap();
    assert!(second.is_empty());
    assert!(second.try_receive().unwrap().is_none());

    // Destroying an unknown name is a no-op.
    second.close();
    assert!(second.destroy().unwrap());
    assert!(!mailbox::destroy(&name).unwrap());
}

#[test]
fn runtime_releases_name_on_shutdown() {
    init_test_tracing();
    let name = unique_name("runtime");
    let config = RuntimeConfig {
        mailbox: MailboxConfig {
            name: name.clone(),
            ..MailboxConfig::default()
        },
        producer: ProducerConfig {
            period: Duration::from_millis(5),
        },
        ..RuntimeConfig::default()
    };

    let runtime = match Runtime::spawn(config) {
        Ok(runtime) => runtime,
        Err(StartupError::Mailbox(err)) if permission_denied(&err) => {
            eprintln!("Skipping runtime_releases_name_on_shutdown: {err}");
            return;
        }
        Err(err) => panic!("{err}"),
    };

    // A peer attached by name sees the same queue while the runtime runs.
    let peer = Mailbox::open(&name).unwrap();
    assert_eq!(peer.capacity(), 10);

    thread::sleep(Duration::from_millis(30));
    let handle = runtime.handle();
    assert!(handle.trigger());
    assert!(!handle.trigger());
    assert!(peer.is_closed());

    let report = runtime.shutdown();
    assert!(report.released);
    assert!(report.producer.stats().unwrap().sent >= 1);
    assert!(matches!(Mailbox::open(&name), Err(MailboxError::NotFound { .. })));
    drop(peer);

    let again = Mailbox::create(&name, 2, MESSAGE_SIZE).unwrap();
    again.close();
    assert!(again.destroy().unwrap());
}

//! Producer/consumer demo over a named mailbox.
//!
//! Sends one message of each kind per period and logs every message the
//! consumer receives, until interrupted.
//!
//! # Usage
//!
//! ```sh
//! cargo run -p mqbox --features cli --bin mqbox-demo -- --run-for-secs 5
//! mqbox-demo --name /my_mq --capacity 10 --producer-period-us 1000000
//! RUST_LOG=mqbox=debug mqbox-demo --poll-period-us 10000 --run-for-secs 5
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: graceful shutdown
//! - `SIGHUP`: ignored
//!
//! The demo also stops when a loop ends on its own, exiting with status 1 if
//! it panicked.

use std::time::Duration;

use clap::Parser;

use mqbox::consumer::{ConsumerConfig, ReceiveMode};
use mqbox::data::MESSAGE_SIZE;
use mqbox::mailbox::{self, DEFAULT_CAPACITY, DEFAULT_MAILBOX_NAME, MailboxConfig};
use mqbox::producer::ProducerConfig;
use mqbox::runtime::{Runtime, RuntimeConfig, ThreadExit};
use mqbox::signal::SignalListener;

#[derive(Debug, Parser)]
#[command(name = "mqbox-demo", version, about = "Producer/consumer demo over a named mailbox")]
struct Args {
    /// Mailbox name (POSIX shared memory name).
    #[arg(long, default_value = DEFAULT_MAILBOX_NAME)]
    name: String,

    /// Maximum number of buffered messages.
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    capacity: usize,

    /// Producer period in microseconds.
    #[arg(long, default_value_t = 1_000_000)]
    producer_period_us: u64,

    /// Poll the mailbox at this period (microseconds) instead of blocking.
    #[arg(long)]
    poll_period_us: Option<u64>,

    /// Shut down after this many seconds instead of waiting for a signal.
    #[arg(long)]
    run_for_secs: Option<u64>,

    /// Remove a mailbox left behind under the same name before starting.
    #[arg(long)]
    clean: bool,
}

impl Args {
    fn runtime_config(&self) -> RuntimeConfig {
        let mode = self
            .poll_period_us
            .map_or(ReceiveMode::Blocking, |us| ReceiveMode::Polling(Duration::from_micros(us)));
        RuntimeConfig {
            mailbox: MailboxConfig {
                name: self.name.clone(),
                capacity: self.capacity,
                slot_size: MESSAGE_SIZE,
            },
            producer: ProducerConfig {
                period: Duration::from_micros(self.producer_period_us),
            },
            consumer: ConsumerConfig { mode },
        }
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("mqbox-demo: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    mqbox::init_tracing();

    if args.clean && mailbox::destroy(&args.name)? {
        eprintln!("mqbox-demo: removed stale mailbox {}", args.name);
    }

    let runtime = Runtime::spawn(args.runtime_config())?;
    let handle = runtime.handle();
    let listener = SignalListener::spawn(handle.clone())?;

    eprintln!(
        "mqbox-demo: running on {} (capacity {}), Ctrl+C to stop",
        args.name, args.capacity
    );

    match args.run_for_secs {
        Some(secs) => {
            if !handle.wait_timeout(Duration::from_secs(secs)) {
                eprintln!("mqbox-demo: run time elapsed");
            }
        }
        None => handle.wait(),
    }

    eprintln!("mqbox-demo: shutting down...");
    listener.close();
    let report = runtime.shutdown();

    match &report.producer {
        ThreadExit::Finished(stats) => eprintln!(
            "mqbox-demo: producer sent {} dropped {}",
            stats.sent, stats.dropped
        ),
        ThreadExit::Panicked(msg) => eprintln!("mqbox-demo: producer panicked: {msg}"),
    }
    match &report.consumer {
        ThreadExit::Finished(stats) => {
            eprintln!("mqbox-demo: consumer received {}", stats.received);
        }
        ThreadExit::Panicked(msg) => eprintln!("mqbox-demo: consumer panicked: {msg}"),
    }
    if report.producer.is_panicked() || report.consumer.is_panicked() {
        return Err("a loop thread panicked".into());
    }
    eprintln!("mqbox-demo: stopped");
    Ok(())
}

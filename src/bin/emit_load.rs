// In src/bin/emit_load.rs
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use sha2::{Digest, Sha256};
use share_emit::Ring::Structs::{DecodedEvent, OwnedValue};
use share_emit::{
    EmitterBuilder, EmitterConfig, Event, EventKind, Field, FieldValue, Sink, SinkError,
    WriterSink,
};
use tracing_subscriber::{fmt, EnvFilter};

/// Drive the share-event emitter with synthetic share submissions.
#[derive(Parser)]
#[command(name = "emit_load", about)]
struct Cli {
    /// Path to a YAML emitter config. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of producer threads.
    #[arg(short, long, default_value_t = 8)]
    producers: usize,

    /// Total events across all producers.
    #[arg(short, long, default_value_t = 10_000)]
    events: u64,

    /// Send batches to this TCP collector instead of verifying in-process.
    #[arg(long)]
    tcp: Option<String>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn share_digest(connection_id: u64, nonce: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(connection_id.to_le_bytes());
    hasher.update(nonce.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Default)]
struct VerifyStats {
    records: AtomicU64,
    corrupt: AtomicU64,
}

/// Decodes every record and checks its share digest.
#[derive(Clone, Default)]
struct VerifyingSink {
    stats: Arc<VerifyStats>,
}

impl VerifyingSink {
    fn intact(record: &[u8]) -> bool {
        let Ok(ev) = DecodedEvent::decode(record) else {
            return false;
        };
        match (ev.field("nonce"), ev.field("digest")) {
            (Some(OwnedValue::U64(nonce)), Some(OwnedValue::Str(digest))) => {
                *digest == share_digest(ev.connection_id, *nonce)
            }
            _ => false,
        }
    }
}

impl Sink for VerifyingSink {
    fn write_batch(&mut self, records: &[&[u8]], _timeout: Duration) -> Result<(), SinkError> {
        for record in records {
            if !Self::intact(record) {
                self.stats.corrupt.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.stats
            .records
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn name(&self) -> &str {
        "verify"
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    if cli.producers == 0 {
        bail!("--producers must be at least 1");
    }

    let config = match &cli.config {
        Some(path) => EmitterConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EmitterConfig::default(),
    };
    let builder = EmitterBuilder::new().with_config(config);

    let verify = VerifyingSink::default();
    let (emitter, flusher) = match &cli.tcp {
        Some(addr) => {
            let timeout = builder.config().sink_timeout;
            let sink = WriterSink::connect_tcp(addr.as_str(), timeout)
                .with_context(|| format!("connecting to {addr}"))?;
            builder.build(sink)?
        }
        None => builder.build(verify.clone())?,
    };

    let running = Arc::new(AtomicBool::new(true));
    let running_for_handler = Arc::clone(&running);
    ctrlc::set_handler(move || {
        running_for_handler.store(false, Ordering::SeqCst);
    })
    .context("setting Ctrl+C handler")?;

    tracing::info!(producers = cli.producers, events = cli.events, "emitting");

    let emitted = Arc::new(AtomicU64::new(0));
    let start = Instant::now();
    let mut workers = Vec::with_capacity(cli.producers);
    for p in 0..cli.producers {
        let emitter = emitter.clone();
        let running = Arc::clone(&running);
        let emitted = Arc::clone(&emitted);
        let share = cli.events / cli.producers as u64
            + u64::from((p as u64) < cli.events % cli.producers as u64);

        let worker = thread::Builder::new()
            .name(format!("producer-{p}"))
            .spawn(move || {
                let connection_id = p as u64;
                let worker_name = format!("rig-{p}");
                // Digests are computed up front so the loop only measures emit cost.
                let digests: Vec<String> =
                    (0..share).map(|n| share_digest(connection_id, n)).collect();

                for (nonce, digest) in digests.iter().enumerate() {
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                    let fields = [
                        Field::new("nonce", FieldValue::U64(nonce as u64)),
                        Field::new("difficulty", FieldValue::F64(1024.0)),
                        Field::new("digest", FieldValue::Str(digest)),
                    ];
                    let event = Event::new(EventKind::ShareAccepted, connection_id, &worker_name)
                        .with_fields(&fields);
                    let _ = emitter.try_emit(&event);
                    emitted.fetch_add(1, Ordering::Relaxed);
                }
            })
            .context("spawning producer thread")?;
        workers.push(worker);
    }

    for worker in workers {
        if worker.join().is_err() {
            bail!("producer thread panicked");
        }
    }
    let emit_time = start.elapsed();

    let report = flusher.shutdown()?;
    let snap = emitter.metrics();
    let emitted = emitted.load(Ordering::Relaxed);

    println!("emitted:        {emitted} in {emit_time:.2?}");
    println!("queued:         {}", snap.queued);
    println!("sent:           {} in {} batches", snap.sent, snap.batches);
    println!("dropped:        {}", snap.dropped);
    println!("pool fallbacks: {}", snap.pool_fallbacks);
    println!("sink failures:  {}", snap.sink_failures);
    println!("abandoned:      {}", report.abandoned);

    if cli.tcp.is_none() {
        let corrupt = verify.stats.corrupt.load(Ordering::Relaxed);
        let seen = verify.stats.records.load(Ordering::Relaxed);
        println!("verified:       {seen} ({corrupt} corrupt)");
        if corrupt > 0 {
            bail!("{corrupt} records failed digest verification");
        }
    }

    if snap.accounted() != emitted {
        bail!(
            "accounting mismatch: sent {} + dropped {} != emitted {}",
            snap.sent,
            snap.dropped,
            emitted
        );
    }
    Ok(())
}

use std::{process::exit, thread, time::Duration};

use anyhow::Context;
use clap::Parser;
use shmcast::{ImuSample, PublishError, Publisher};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod cli;

use cli::Args;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let publisher = Publisher::<ImuSample>::create(&args.name, args.capacity)
        .with_context(|| format!("Creating channel {} failed", args.name))?;

    let token = publisher.token().clone();
    ctrlc::set_handler(move || {
        // Second interrupt while draining
        if token.cancel() {
            exit(1);
        }
    })?;

    info!(name = %args.name, capacity = args.capacity, "publishing");

    let interval = Duration::from_millis(args.interval_ms);
    let mut seq = 0u32;
    while args.count.is_none_or(|count| seq < count) {
        match publisher.publish(ImuSample::new(seq, &args.frame)) {
            Ok(()) => info!(seq, "published"),
            Err(PublishError::Shutdown) => break,
            Err(err) => return Err(err).context("Publishing failed"),
        }
        seq = seq.wrapping_add(1);
        thread::sleep(interval);
    }

    if let Err(err) = publisher.shutdown() {
        warn!(%err, "shutdown failed");
    }
    thread::sleep(Duration::from_millis(args.grace_ms));
    info!(published = seq, "done");
    Ok(())
}

use std::{
    process::exit,
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use clap::Parser;
use shmcast::{ConsumeError, ImuSample, ShutdownToken, Subscriber};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod cli;

use cli::Args;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let token = ShutdownToken::new();
    let handler = token.clone();
    ctrlc::set_handler(move || {
        if handler.cancel() {
            exit(1);
        }
    })?;

    let timeout = Duration::from_millis(args.timeout_ms);
    let pause = Duration::from_millis(args.pause_ms);
    let mut subscriber = Subscriber::<ImuSample>::new(&args.name)?;
    let mut received = 0u64;

    while !token.is_cancelled() {
        match subscriber.consume(Some(timeout)) {
            Ok(sample) => {
                received += 1;
                info!(
                    seq = sample.seq,
                    frame = %sample.frame,
                    accel = ?sample.accel,
                    gyro = ?sample.gyro,
                    latency_us = now_us().saturating_sub(sample.stamp_us),
                    "received"
                );
            }
            Err(ConsumeError::Empty) => {}
            Err(ConsumeError::Shutdown) => {
                info!(received, lost = subscriber.overruns(), "publisher shut down, waiting for the next one");
                subscriber = Subscriber::new(&args.name)?;
            }
            Err(ConsumeError::Attach(err)) if err.is_retryable() => {
                debug!(%err, "channel not available yet");
            }
            Err(err) if err.is_permanent() => return Err(err.into()),
            Err(err) => {
                warn!(%err, "read failed");
                thread::sleep(pause);
            }
        }
    }

    info!(received, lost = subscriber.overruns(), "stopped");
    Ok(())
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as u64)
}

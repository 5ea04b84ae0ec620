use clap::Parser;

/// Prints IMU samples received from a shared memory channel
#[derive(Debug, Clone, Parser)]
pub struct Args {
    /// Channel name
    #[arg(short, long, default_value = "imu_msg")]
    pub name: String,
    /// Milliseconds a single read waits for data
    #[arg(short, long, default_value_t = shmcast::DEFAULT_TIMEOUT.as_millis() as u64)]
    pub timeout_ms: u64,
    /// Milliseconds to pause after a failed read
    #[arg(short, long, default_value_t = 100)]
    pub pause_ms: u64,
}

use clap::Parser;

/// Publishes synthetic IMU samples on a shared memory channel
#[derive(Debug, Clone, Parser)]
pub struct Args {
    /// Channel name
    #[arg(short, long, default_value = "imu_msg")]
    pub name: String,
    /// Number of slots in the ring
    #[arg(short, long, default_value_t = 10)]
    pub capacity: usize,
    /// Milliseconds between two samples
    #[arg(short, long, default_value_t = 500)]
    pub interval_ms: u64,
    /// Stop after this many samples
    #[arg(long)]
    pub count: Option<u32>,
    /// Frame name put into every sample
    #[arg(short, long, default_value = "imu_link")]
    pub frame: String,
    /// Milliseconds to keep the channel around after shutting down
    #[arg(long, default_value_t = 200)]
    pub grace_ms: u64,
}

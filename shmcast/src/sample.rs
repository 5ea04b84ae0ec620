use std::time::{SystemTime, UNIX_EPOCH};

use arrayvec::ArrayString;

use crate::shm::ShmSafe;

/// Inertial measurement the demo binaries exchange.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub seq: u32,
    /// Microseconds since the Unix epoch.
    pub stamp_us: u64,
    pub accel: [f32; 3],
    pub gyro: [f32; 3],
    pub frame: ArrayString<16>,
}

impl ImuSample {
    /// Builds a synthetic sample. Frame names longer than 16 bytes are cut
    /// at the last character that fits.
    pub fn new(seq: u32, frame: &str) -> Self {
        let stamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_micros() as u64);

        let mut name = ArrayString::new();
        for c in frame.chars() {
            if name.try_push(c).is_err() {
                break;
            }
        }

        let t = seq as f32 * 0.01;
        Self {
            seq,
            stamp_us,
            accel: [t.sin(), t.cos(), 9.81],
            gyro: [0.0, 0.0, t],
            frame: name,
        }
    }
}

unsafe impl ShmSafe for ImuSample {}

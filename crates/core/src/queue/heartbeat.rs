//! Keep-alive frames for streaming requests that are waiting in the queue, and the stall
//! detector that decides when such a connection is dead weight.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;

/// Sent right after the SSE headers so clients see bytes before the first heartbeat.
pub const INIT_FRAME: &[u8] = b": joining queue\n\n";

const MIN_HEARTBEAT_BYTES: usize = 512;
const FULL_WRITES_BEFORE_DESTROY: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSettings {
    pub interval: Duration,
    pub load_threshold: usize,
    pub scale_factor: usize,
    pub max_payload_bytes: usize,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            load_threshold: 50,
            scale_factor: 6,
            max_payload_bytes: 1024 * 1024,
        }
    }
}

impl HeartbeatSettings {
    /// The stall monitor samples every two heartbeat intervals.
    pub fn monitor_interval(&self) -> Duration {
        self.interval * 2
    }
}

/// Payload size for the current load: flat until the threshold, then quadratic in the excess.
pub fn heartbeat_size(settings: &HeartbeatSettings, load: usize) -> usize {
    let max = settings.max_payload_bytes.max(MIN_HEARTBEAT_BYTES);
    if load <= settings.load_threshold {
        return MIN_HEARTBEAT_BYTES.min(max);
    }
    let scaled = (load - settings.load_threshold).saturating_mul(settings.scale_factor);
    MIN_HEARTBEAT_BYTES
        .saturating_add(scaled.saturating_mul(scaled))
        .min(max)
}

/// An SSE comment frame of roughly `size` bytes.
pub fn heartbeat_frame(size: usize) -> Vec<u8> {
    const PREFIX: &str = ": queue heartbeat ";
    let payload_len = size.saturating_sub(PREFIX.len() + 2) * 3 / 4;
    let mut raw = vec![0u8; payload_len];
    rand::rng().fill_bytes(&mut raw);
    let mut frame = String::with_capacity(size + 4);
    frame.push_str(PREFIX);
    frame.push_str(&STANDARD.encode(&raw));
    frame.push_str("\n\n");
    frame.into_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallReason {
    BufferFull,
    SlowConsumer { flushed: u64, expected: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Continue,
    Destroy(StallReason),
}

/// Per-connection stall detector. Pure state machine; the caller owns the timers.
#[derive(Debug, Default)]
pub struct HeartbeatMonitor {
    consecutive_full: u32,
    last_flushed: u64,
}

impl HeartbeatMonitor {
    pub fn new(already_flushed: u64) -> Self {
        Self {
            consecutive_full: 0,
            last_flushed: already_flushed,
        }
    }

    /// Report whether the latest heartbeat write was accepted by the transport.
    pub fn on_write(&mut self, accepted: bool) -> HeartbeatAction {
        if accepted {
            self.consecutive_full = 0;
            return HeartbeatAction::Continue;
        }
        self.consecutive_full += 1;
        if self.consecutive_full >= FULL_WRITES_BEFORE_DESTROY {
            HeartbeatAction::Destroy(StallReason::BufferFull)
        } else {
            HeartbeatAction::Continue
        }
    }

    /// Compare bytes flushed since the previous sample against half a heartbeat.
    pub fn on_monitor(&mut self, total_flushed: u64, heartbeat_size: usize) -> HeartbeatAction {
        let flushed = total_flushed.saturating_sub(self.last_flushed);
        self.last_flushed = total_flushed;
        let expected = (heartbeat_size / 2) as u64;
        if flushed < expected {
            HeartbeatAction::Destroy(StallReason::SlowConsumer { flushed, expected })
        } else {
            HeartbeatAction::Continue
        }
    }
}

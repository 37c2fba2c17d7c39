//! FIFO fullness estimation and refill scheduling.
//!
//! The DAC only reports its buffer level inside ACK frames, so between
//! frames the worker extrapolates: the last reported fullness decays at the
//! playback rate. All queries take `now` explicitly, which keeps the
//! arithmetic deterministic under test.

use std::time::{Duration, Instant};

use crate::protocol::{BUFFER_CAPACITY, MIN_PACKET_POINTS};

/// Fullness floor the device reports even when nearly drained.
const MIN_FLOOR_BUFFER: usize = 256;

/// Upper bound on a single pacing sleep, in milliseconds.
const MAX_SLEEP_MS: u64 = 5;

/// Tracks the last reported FIFO state and answers scheduling queries.
#[derive(Debug, Clone)]
pub struct BufferEstimator {
    capacity: u16,
    last_fullness: u16,
    point_rate: u32,
    last_receive_time: Option<Instant>,
}

impl BufferEstimator {
    pub fn new() -> Self {
        BufferEstimator {
            capacity: BUFFER_CAPACITY,
            last_fullness: 0,
            point_rate: 0,
            last_receive_time: None,
        }
    }

    /// Record the FIFO level and playback rate from a fresh status frame.
    pub fn record_status(&mut self, buffer_fullness: u16, point_rate: u32, now: Instant) {
        self.last_fullness = buffer_fullness.min(self.capacity);
        self.point_rate = point_rate;
        self.last_receive_time = Some(now);
    }

    /// Playback rate from the last status frame, or 0 before the first one.
    pub fn point_rate(&self) -> u32 {
        self.point_rate
    }

    /// The last reported fullness corrected for points consumed since.
    ///
    /// Returns the raw report when the rate is zero or nothing has been
    /// received yet. The result is always within `0..=capacity`.
    pub fn estimated_fullness(&self, now: Instant) -> u16 {
        if self.point_rate == 0 {
            return self.last_fullness;
        }
        let Some(received) = self.last_receive_time else {
            return self.last_fullness;
        };

        let elapsed = now.saturating_duration_since(received);
        if elapsed.is_zero() {
            return self.last_fullness;
        }

        let consumed = self.point_rate as f64 * elapsed.as_secs_f64();
        let estimated = self.last_fullness as f64 - consumed;
        estimated.clamp(0.0, self.capacity as f64).round() as u16
    }

    /// Free FIFO space under the current estimate.
    pub fn free_space(&self, now: Instant) -> usize {
        (self.capacity as usize).saturating_sub(self.estimated_fullness(now) as usize)
    }

    /// How many points must be shipped now to honor the latency budget.
    ///
    /// The budget requires `MIN_FLOOR_BUFFER + rate * latency` points queued
    /// (capped at the FIFO capacity); the result is the shortfall against
    /// the current estimate, or 0 when the buffer is already deep enough.
    pub fn minimum_points_required(&self, latency_ms: i64, now: Instant) -> usize {
        if self.point_rate == 0 || latency_ms <= 0 {
            return 0;
        }

        let fullness = self.estimated_fullness(now) as f64;
        let mut required =
            MIN_FLOOR_BUFFER as f64 + self.point_rate as f64 * latency_ms as f64 / 1000.0;
        if required <= fullness {
            return 0;
        }
        if required > self.capacity as f64 {
            required = self.capacity as f64;
        }

        let deficit = required - fullness;
        if deficit <= 0.0 {
            0
        } else {
            deficit.ceil() as usize
        }
    }

    /// Refill bounds for the next fill request: `(minimum, free_space)`.
    ///
    /// The minimum never exceeds the free space, so a conforming callback
    /// can always satisfy it.
    pub fn fill_bounds(&self, latency_ms: i64, now: Instant) -> (usize, usize) {
        let free = self.free_space(now);
        let minimum = self.minimum_points_required(latency_ms, now).min(free);
        (minimum, free)
    }

    /// How long the worker may sleep before the FIFO needs attention.
    ///
    /// Waits for the buffer to drain toward the latency floor, never for
    /// more than one minimum packet's worth of points, and never longer
    /// than 5 ms so control traffic stays responsive.
    pub fn sleep_duration(&self, latency_ms: i64, now: Instant) -> Duration {
        if latency_ms <= 0 || self.point_rate == 0 {
            return Duration::ZERO;
        }

        let min_points_in_buffer = millis_to_points(latency_ms as f64, self.point_rate) as i64;
        let deficit = self.estimated_fullness(now) as i64 - min_points_in_buffer;
        let points_to_wait = deficit.clamp(0, MIN_PACKET_POINTS as i64) as usize;

        let millis = points_to_millis(points_to_wait, self.point_rate) as u64;
        Duration::from_millis(millis.min(MAX_SLEEP_MS))
    }
}

impl Default for BufferEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Playback time of `points` samples, in milliseconds.
pub(crate) fn points_to_millis(points: usize, rate: u32) -> f64 {
    if rate == 0 || points == 0 {
        return 0.0;
    }
    points as f64 * 1000.0 / rate as f64
}

/// Samples consumed in `millis` at `rate`, rounded to the nearest point.
pub(crate) fn millis_to_points(millis: f64, rate: u32) -> usize {
    if rate == 0 || millis <= 0.0 {
        return 0;
    }
    (millis / 1000.0 * rate as f64).round() as usize
}

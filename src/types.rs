//! Core sample and refill-request types shared by every device.
//!
//! Provides the device-agnostic laser point representation and the
//! fill-request contract between a device worker and the user-supplied
//! point generator.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// A single sample to be sent to a laser DAC.
///
/// Coordinates are normalized:
/// - x: -1.0 (left) to 1.0 (right)
/// - y: -1.0 (bottom) to 1.0 (top)
///
/// Color channels, intensity and the two user channels are normalized to
/// 0.0..=1.0. Out-of-range values are accepted here and clamped when the
/// point is encoded for the wire, never at ingest.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LaserPoint {
    /// X coordinate, -1.0 to 1.0.
    pub x: f32,
    /// Y coordinate, -1.0 to 1.0.
    pub y: f32,
    /// Red channel, 0.0 to 1.0.
    pub r: f32,
    /// Green channel, 0.0 to 1.0.
    pub g: f32,
    /// Blue channel, 0.0 to 1.0.
    pub b: f32,
    /// Intensity / brightness, 0.0 to 1.0.
    pub i: f32,
    /// User channel 1 (waveforms, safety masks, extra outputs).
    pub u1: f32,
    /// User channel 2.
    pub u2: f32,
}

impl LaserPoint {
    /// Creates a new laser point with both user channels at zero.
    pub fn new(x: f32, y: f32, r: f32, g: f32, b: f32, i: f32) -> Self {
        Self {
            x,
            y,
            r,
            g,
            b,
            i,
            ..Default::default()
        }
    }

    /// Creates a blanked point (laser off) at the given position.
    pub fn blanked(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            ..Default::default()
        }
    }
}

/// A refill order handed to the point generator callback.
///
/// Built per worker iteration from the latest device FIFO estimate and
/// discarded after the callback returns.
#[derive(Debug, Clone, Copy)]
pub struct PointFillRequest {
    /// Minimum number of points the callback must append.
    pub minimum_points_required: usize,
    /// Maximum number of points the callback should append.
    ///
    /// A value of 0 means "no upper bound"; devices with limited FIFO space
    /// tighten this to cap buffer growth.
    pub maximum_points_required: usize,
    /// Host-side estimate of when the first point of this batch will reach
    /// the mirrors. Advisory; generators may use it for scheduling.
    pub estimated_first_point_render_time: Instant,
    /// Absolute index of the first requested point since the stream started.
    pub current_point_index: u64,
}

impl PointFillRequest {
    /// Whether this request asks for at least `threshold` points, either as
    /// a hard minimum or as available room to top up.
    pub fn needs_points(&self, threshold: usize) -> bool {
        self.minimum_points_required >= threshold || self.maximum_points_required >= threshold
    }
}

/// Contract for point generation.
///
/// The callback must:
/// - Append new points to the output buffer with `push` / `extend`.
/// - Produce at least `request.minimum_points_required` points.
/// - Produce no more than `request.maximum_points_required` when non-zero.
/// - Not call `reserve()` or `resize()` on the buffer; the device
///   pre-reserves a large capacity so the hot path stays allocation-free.
/// - Return promptly; the worker thread is paced around it.
///
/// The caller reads the buffer length after the callback to know how many
/// points were produced.
pub type RequestPointsCallback = dyn Fn(&PointFillRequest, &mut Vec<LaserPoint>) + Send + Sync;

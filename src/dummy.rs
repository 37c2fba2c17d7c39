//! A device stand-in that exercises the point generator without hardware.
//!
//! `DummyDevice` shares the owner-facing surface of the real device
//! (install a callback, `start()`, `stop()`) but never opens a socket. Its
//! worker ticks at a fixed interval, asks the callback for a batch, and
//! discards the result. Useful for developing generators on machines
//! without a DAC on the network.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::debug;

use crate::device::DeviceShared;
use crate::types::{LaserPoint, PointFillRequest, RequestPointsCallback};

/// ~30 Hz, in the ballpark of a frame-oriented generator.
const TICK_INTERVAL: Duration = Duration::from_millis(33);

/// Fixed batch size requested per tick.
const POINTS_PER_TICK: usize = 1000;

/// Timer-driven callback exerciser with the same control surface as the
/// real device.
pub struct DummyDevice {
    shared: Arc<DeviceShared>,
    callback: Option<Arc<RequestPointsCallback>>,
    worker: Option<JoinHandle<()>>,
}

impl DummyDevice {
    pub fn new() -> Self {
        DummyDevice {
            shared: Arc::new(DeviceShared::new()),
            callback: None,
            worker: None,
        }
    }

    /// Install or replace the point generator. Only while stopped.
    pub fn set_request_points_callback<F>(&mut self, callback: F)
    where
        F: Fn(&PointFillRequest, &mut Vec<LaserPoint>) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
    }

    /// Latency budget echoed into the fill requests. Clamped to >= 1 ms.
    pub fn set_latency(&self, latency_ms: i64) {
        self.shared
            .latency_ms
            .store(latency_ms.max(1), Ordering::Relaxed);
    }

    pub fn get_latency(&self) -> i64 {
        self.shared.latency_ms()
    }

    /// Launch the tick loop. No-op when already running.
    pub fn start(&mut self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }

        let shared = self.shared.clone();
        let callback = self.callback.clone();
        self.worker = Some(thread::spawn(move || run(shared, callback)));
    }

    /// Stop the tick loop and join the worker.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Default for DummyDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DummyDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<DeviceShared>, callback: Option<Arc<RequestPointsCallback>>) {
    let mut buffer: Vec<LaserPoint> = Vec::with_capacity(30_000);
    let mut produced: u64 = 0;

    while shared.is_running() {
        let latency = Duration::from_millis(shared.latency_ms().max(0) as u64);
        let request = PointFillRequest {
            minimum_points_required: POINTS_PER_TICK,
            maximum_points_required: 0,
            estimated_first_point_render_time: Instant::now() + latency,
            current_point_index: produced,
        };

        if let Some(callback) = callback.as_ref() {
            buffer.clear();
            callback(&request, &mut buffer);
            debug!("pulled {} new points", buffer.len());
            produced += buffer.len() as u64;
        }

        thread::sleep(TICK_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn ticks_invoke_the_callback_with_the_fixed_request() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let mut dummy = DummyDevice::new();
        dummy.set_request_points_callback(move |request, points| {
            assert_eq!(request.minimum_points_required, POINTS_PER_TICK);
            assert_eq!(request.maximum_points_required, 0);
            for _ in 0..request.minimum_points_required {
                points.push(LaserPoint::blanked(0.0, 0.0));
            }
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        dummy.start();
        thread::sleep(Duration::from_millis(150));
        dummy.stop();

        let count = calls.load(Ordering::SeqCst);
        assert!(count >= 2, "expected at least two ticks, got {count}");
    }

    #[test]
    fn start_twice_is_a_noop_and_stop_joins() {
        let mut dummy = DummyDevice::new();
        dummy.start();
        dummy.start();
        dummy.stop();
        dummy.stop();
    }

    #[test]
    fn point_index_advances_across_ticks() {
        let max_seen = Arc::new(AtomicUsize::new(0));
        let max_clone = max_seen.clone();

        let mut dummy = DummyDevice::new();
        dummy.set_request_points_callback(move |request, points| {
            max_clone.fetch_max(request.current_point_index as usize, Ordering::SeqCst);
            for _ in 0..request.minimum_points_required {
                points.push(LaserPoint::blanked(0.0, 0.0));
            }
        });

        dummy.start();
        thread::sleep(Duration::from_millis(150));
        dummy.stop();

        assert!(max_seen.load(Ordering::SeqCst) >= POINTS_PER_TICK);
    }
}

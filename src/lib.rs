//! Streaming client for the Ether Dream laser DAC.
//!
//! The Ether Dream holds a small on-board FIFO of laser samples and drains
//! it at a configurable point rate; the host's job is to keep that FIFO
//! topped up over a single TCP connection while honoring the device's
//! safety and playback state machines. This crate implements that host
//! side: a deadline-enforcing transport, the command/ACK wire protocol, a
//! refill scheduler, and a worker-thread driver that pulls samples from a
//! user-supplied generator callback.
//!
//! # Getting started
//!
//! ```no_run
//! use etherdream_client::{EtherDreamDevice, LaserPoint, COMMUNICATION_PORT};
//!
//! let mut device = EtherDreamDevice::new();
//! device.set_latency(50);
//! device.set_request_points_callback(|request, points| {
//!     // Append at least `minimum_points_required` samples. Here: park
//!     // the beam at the center with the laser off.
//!     for _ in 0..request.minimum_points_required.max(300) {
//!         points.push(LaserPoint::blanked(0.0, 0.0));
//!     }
//! });
//!
//! device.connect_host("192.168.1.77", COMMUNICATION_PORT)?;
//! device.start();
//! // ... stream until done ...
//! device.stop();
//! device.close();
//! # Ok::<(), etherdream_client::Error>(())
//! ```
//!
//! The worker streams until `stop()` or the first unrecoverable failure;
//! there is no built-in reconnection. Inspect
//! [`EtherDreamDevice::last_network_error`] after the worker exits and
//! reconnect from the owning side if desired.
//!
//! Logging goes through the [`log`](https://docs.rs/log) facade; install
//! any logger implementation to see TX/RX traffic at `debug` level.

pub mod device;
pub mod dummy;
pub mod error;
pub mod estimator;
pub mod protocol;
pub mod transport;
pub mod types;

pub use device::EtherDreamDevice;
pub use dummy::DummyDevice;
pub use error::{Error, Result};
pub use estimator::BufferEstimator;
pub use protocol::{
    DacPoint, DacResponse, DacStatus, LightEngineState, PlaybackState, BUFFER_CAPACITY,
    COMMUNICATION_PORT, MIN_PACKET_POINTS, TARGET_POINT_RATE,
};
pub use transport::{TcpTransport, TimeoutConfig};
pub use types::{LaserPoint, PointFillRequest, RequestPointsCallback};

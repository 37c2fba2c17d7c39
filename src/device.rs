//! Ether Dream device: connection management, the worker thread, and the
//! streaming control loop.
//!
//! # Threading model
//!
//! - The **owner thread** calls [`EtherDreamDevice::connect`], `start`,
//!   `stop`, `close`, `set_latency` and installs the callback. None of
//!   these may race with themselves.
//! - A single **worker thread**, launched by `start()`, runs the streaming
//!   loop. All driver state other than the `running` flag and the latency
//!   budget is touched only there.
//!
//! The worker polls the DAC by exchanging commands and 22-byte ACK frames,
//! strictly one at a time. Each ACK refreshes the FIFO estimate and the
//! playback requirement flags; each loop iteration acts on the first
//! applicable flag, tops the FIFO up from the user callback, and paces
//! itself against the estimated drain time.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::estimator::BufferEstimator;
use crate::protocol::{
    CommandPacket, DacResponse, DacStatus, LightEngineState, PlaybackState, SizeBytes,
    COMMAND_CLEAR, COMMAND_PING, COMMAND_PREPARE, MIN_PACKET_POINTS, PLAYBACK_FLAG_UNDERFLOW,
    RESPONSE_ACK, TARGET_POINT_RATE,
};
use crate::transport::TcpTransport;
use crate::types::{LaserPoint, PointFillRequest, RequestPointsCallback};

/// Capacity pre-reserved for the transmission buffer. Generous compared to
/// any hardware FIFO, so callbacks never trigger a reallocation.
const POINT_BUFFER_RESERVE: usize = 30_000;

/// Latency budget applied until the owner picks one, in milliseconds.
const DEFAULT_LATENCY_MS: i64 = 50;

/// Connection establishment gets a few round-trips' worth of budget.
const CONNECT_TIMEOUT_FACTOR: u64 = 4;

/// State shared between the owner thread and the worker.
pub(crate) struct DeviceShared {
    pub(crate) running: AtomicBool,
    pub(crate) latency_ms: AtomicI64,
    pub(crate) last_error: Mutex<Option<Error>>,
}

impl DeviceShared {
    pub(crate) fn new() -> Self {
        DeviceShared {
            running: AtomicBool::new(false),
            latency_ms: AtomicI64::new(DEFAULT_LATENCY_MS),
            last_error: Mutex::new(None),
        }
    }

    pub(crate) fn latency_ms(&self) -> i64 {
        self.latency_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Playback requirements
// =============================================================================

/// Coordination flags re-derived from every status frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PlaybackRequirements {
    /// The FIFO must be reset (`c`) before anything else.
    pub clear_required: bool,
    /// The playback system must be armed (`p`).
    pub prepare_required: bool,
    /// Playback must be started (`b`).
    pub begin_required: bool,
}

impl PlaybackRequirements {
    /// Recompute the flags from a fresh status frame.
    ///
    /// `command_acked` is false when the reply was a NAK or echoed the wrong
    /// command; that forces a clear, which suppresses the other two flags.
    pub(crate) fn update(&mut self, status: &DacStatus, command_acked: bool) {
        let estop = status.light_engine_state == LightEngineState::Estop;
        let underflow = status.playback_flags & PLAYBACK_FLAG_UNDERFLOW != 0;
        self.clear_required = estop || underflow || !command_acked;

        self.prepare_required = !self.clear_required
            && status.light_engine_state == LightEngineState::Ready
            && status.playback_state == PlaybackState::Idle;

        self.begin_required = !self.clear_required
            && status.playback_state == PlaybackState::Prepared
            && status.buffer_fullness as usize >= MIN_PACKET_POINTS;
    }
}

// =============================================================================
// Device
// =============================================================================

/// Streaming client for one Ether Dream DAC.
///
/// Construct, install a point generator, connect, then `start()` the worker:
///
/// ```no_run
/// use etherdream_client::{EtherDreamDevice, LaserPoint, COMMUNICATION_PORT};
///
/// let mut device = EtherDreamDevice::new();
/// device.set_request_points_callback(|request, points| {
///     for _ in 0..request.minimum_points_required.max(300) {
///         points.push(LaserPoint::blanked(0.0, 0.0));
///     }
/// });
/// device
///     .connect_host("192.168.1.77", COMMUNICATION_PORT)
///     .expect("DAC unreachable");
/// device.start();
/// ```
///
/// The worker streams until `stop()` is called or a failure ends the
/// session; [`EtherDreamDevice::last_network_error`] then reports what went
/// wrong, and the owner decides whether to reconnect.
pub struct EtherDreamDevice {
    shared: Arc<DeviceShared>,
    transport: TcpTransport,
    callback: Option<Arc<RequestPointsCallback>>,
    worker: Option<JoinHandle<()>>,
    remembered_address: Option<SocketAddr>,
}

impl EtherDreamDevice {
    /// Construct a device. Performs no I/O.
    pub fn new() -> Self {
        EtherDreamDevice {
            shared: Arc::new(DeviceShared::new()),
            transport: TcpTransport::new(),
            callback: None,
            worker: None,
            remembered_address: None,
        }
    }

    /// Connect to the DAC at `address:port`.
    pub fn connect(&mut self, address: IpAddr, port: u16) -> Result<()> {
        let endpoint = SocketAddr::new(address, port);
        let connect_timeout =
            Duration::from_millis(self.shared.latency_ms().max(1) as u64 * CONNECT_TIMEOUT_FACTOR);

        if let Err(err) = self.transport.connect_with_timeout(endpoint, connect_timeout) {
            error!("connect to {endpoint} failed: {err}");
            return Err(err);
        }
        self.transport.set_low_latency();
        self.remembered_address = Some(endpoint);
        info!("connected to {endpoint}");
        Ok(())
    }

    /// Connect to a literal IPv4/IPv6 address given as a string.
    ///
    /// No name resolution is performed.
    pub fn connect_host(&mut self, address: &str, port: u16) -> Result<()> {
        let parsed: IpAddr = address.parse().map_err(|_| {
            error!("invalid IP address '{address}'");
            Error::Io {
                kind: std::io::ErrorKind::InvalidInput,
                message: format!("invalid IP address '{address}'"),
            }
        })?;
        self.connect(parsed, port)
    }

    /// Close the connection and forget the remembered address.
    ///
    /// Stops the worker first. Idempotent; harmless when not connected.
    pub fn close(&mut self) {
        self.stop();
        self.transport.close();
        self.remembered_address = None;
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    /// Address of the last successful `connect`, until `close()`.
    pub fn remembered_address(&self) -> Option<SocketAddr> {
        self.remembered_address
    }

    /// Set the latency budget between point submission and playback.
    ///
    /// The worker uses this to size refill batches and socket deadlines.
    /// Values below 1 ms are clamped to 1. Safe to adjust while streaming.
    pub fn set_latency(&self, latency_ms: i64) {
        self.shared
            .latency_ms
            .store(latency_ms.max(1), Ordering::Relaxed);
    }

    /// The currently configured latency budget in milliseconds.
    pub fn get_latency(&self) -> i64 {
        self.shared.latency_ms()
    }

    /// Install or replace the point generator.
    ///
    /// Must only be called while the worker is stopped; the worker reads
    /// the callback without synchronization.
    pub fn set_request_points_callback<F>(&mut self, callback: F)
    where
        F: Fn(&PointFillRequest, &mut Vec<LaserPoint>) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
    }

    /// Launch the worker thread. No-op when already running.
    pub fn start(&mut self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        // A previous worker may have exited on failure; reap it first.
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        if let Ok(mut guard) = self.shared.last_error.lock() {
            *guard = None;
        }

        let mut worker = StreamWorker::new(
            self.transport.clone(),
            self.shared.clone(),
            self.callback.clone(),
        );
        self.worker = Some(thread::spawn(move || worker.run()));
    }

    /// Signal the worker to stop and wait for it to finish.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    /// The failure that ended the last streaming session, if any.
    ///
    /// Meaningful once `stop()` has returned or the worker has exited.
    pub fn last_network_error(&self) -> Option<Error> {
        self.shared
            .last_error
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }
}

impl Default for EtherDreamDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EtherDreamDevice {
    fn drop(&mut self) {
        self.stop();
        self.transport.close();
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Worker-side streaming state; lives on the worker thread for the
/// duration of one `run()`.
struct StreamWorker {
    transport: TcpTransport,
    shared: Arc<DeviceShared>,
    callback: Option<Arc<RequestPointsCallback>>,
    estimator: BufferEstimator,
    requirements: PlaybackRequirements,
    rate_change_pending: bool,
    last_status: Option<DacStatus>,
    packet: CommandPacket,
    points_to_send: Vec<LaserPoint>,
    points_sent: u64,
    failure_encountered: bool,
}

impl StreamWorker {
    fn new(
        transport: TcpTransport,
        shared: Arc<DeviceShared>,
        callback: Option<Arc<RequestPointsCallback>>,
    ) -> Self {
        StreamWorker {
            transport,
            shared,
            callback,
            estimator: BufferEstimator::new(),
            requirements: PlaybackRequirements::default(),
            rate_change_pending: false,
            last_status: None,
            packet: CommandPacket::new(),
            points_to_send: Vec::with_capacity(POINT_BUFFER_RESERVE),
            points_sent: 0,
            failure_encountered: false,
        }
    }

    fn run(&mut self) {
        self.failure_encountered = false;

        if !self.transport.is_open() {
            error!("run() called without an active connection");
            self.record_failure("startup", Error::NotConnected);
            return;
        }

        if let Err(err) = self.bootstrap() {
            if err != Error::OperationCanceled {
                self.record_failure("bootstrap", err);
            }
        } else {
            while self.shared.is_running() {
                match self.iterate() {
                    Ok(()) => {}
                    Err(Error::OperationCanceled) => break,
                    Err(err) => {
                        self.record_failure("streaming", err);
                        break;
                    }
                }
            }
        }

        // A failed session leaves the socket in an indeterminate state;
        // a plain stop() leaves it open for the owner to reuse or close.
        if self.failure_encountered && self.transport.is_open() {
            self.transport.close();
        }
    }

    /// First contact: the DAC greets a fresh connection with an unsolicited
    /// ACK whose echo is `?`. A missed or malformed greeting falls back to
    /// an explicit ping; only a failing fallback is fatal.
    fn bootstrap(&mut self) -> Result<()> {
        match self.wait_for_response(COMMAND_PING) {
            Ok(_) => Ok(()),
            Err(Error::OperationCanceled) => Err(Error::OperationCanceled),
            Err(err) => {
                debug!("no greeting ({err}); falling back to an explicit ping");
                self.send_single_command(COMMAND_PING).map(|_| ())
            }
        }
    }

    /// One pass of the streaming loop.
    fn iterate(&mut self) -> Result<()> {
        if self.requirements.clear_required {
            debug!("clear required -> 'c'");
            self.send_single_command(COMMAND_CLEAR)?;
        }

        if self.requirements.prepare_required {
            debug!("prepare required -> 'p'");
            self.send_single_command(COMMAND_PREPARE)?;
        }

        self.sleep_until_next_points();

        let request = self.fill_request();
        if request.needs_points(MIN_PACKET_POINTS) && self.request_points(&request)? {
            self.send_points()?;
        }

        if self.requirements.begin_required {
            debug!("begin required -> 'b' (rate={TARGET_POINT_RATE})");
            self.send_begin(TARGET_POINT_RATE)?;
        }

        self.ensure_target_point_rate()
    }

    // -------------------------------------------------------------------------
    // Command / ACK exchanges
    // -------------------------------------------------------------------------

    /// Per-exchange deadline, tied to the latency budget.
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.shared.latency_ms().max(1) as u64)
    }

    /// Read and validate one 22-byte ACK for `command`.
    ///
    /// The status snapshot and requirement flags are refreshed from every
    /// decodable frame, including NAKs and mismatched echoes, before the
    /// validation verdict is returned.
    fn wait_for_response(&mut self, command: u8) -> Result<DacResponse> {
        if !self.shared.is_running() {
            return Err(Error::OperationCanceled);
        }
        if !self.transport.is_open() {
            return Err(Error::NotConnected);
        }

        let mut raw = [0u8; DacResponse::SIZE_BYTES];
        self.transport.read_exact(&mut raw, self.timeout())?;
        let response = DacResponse::decode(&raw)?;

        let acked = response.response == RESPONSE_ACK && response.command == command;
        self.apply_status(&response.status, acked);

        debug!(
            "rx '{}' for '{}' | {}",
            response.response as char, command as char, response.status
        );

        if !acked {
            warn!(
                "unexpected reply: '{}' for '{}' while '{}' was in flight",
                response.response as char, response.command as char, command as char
            );
            if response.response != RESPONSE_ACK {
                return Err(Error::BadAckResponse {
                    response: response.response,
                    command: command as char,
                });
            }
            return Err(Error::CommandMismatch {
                expected: command as char,
                received: response.command as char,
            });
        }

        Ok(response)
    }

    /// Stage a single-byte command and ship it.
    fn send_single_command(&mut self, opcode: u8) -> Result<DacResponse> {
        debug!("tx '{}' (timeout {:?})", opcode as char, self.timeout());
        self.packet.set_single(opcode);
        self.send_packet()
    }

    /// Ship the staged frame and await its ACK. The staging buffer is
    /// reset once the bytes are on the wire.
    fn send_packet(&mut self) -> Result<DacResponse> {
        if !self.shared.is_running() {
            return Err(Error::OperationCanceled);
        }
        let opcode = self.packet.opcode();
        self.transport.write_all(self.packet.bytes(), self.timeout())?;
        self.packet.clear();
        self.wait_for_response(opcode)
    }

    fn apply_status(&mut self, status: &DacStatus, command_acked: bool) {
        let now = Instant::now();
        self.estimator
            .record_status(status.buffer_fullness, status.point_rate, now);
        self.requirements.update(status, command_acked);
        self.last_status = Some(*status);
    }

    // -------------------------------------------------------------------------
    // Point flow
    // -------------------------------------------------------------------------

    fn sleep_until_next_points(&self) {
        let duration = self
            .estimator
            .sleep_duration(self.shared.latency_ms(), Instant::now());
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }

    /// Size the next refill from the FIFO estimate and clear the staging
    /// buffer for the callback.
    fn fill_request(&mut self) -> PointFillRequest {
        let now = Instant::now();
        let latency_ms = self.shared.latency_ms();
        let (minimum, free) = self.estimator.fill_bounds(latency_ms, now);

        self.points_to_send.clear();
        PointFillRequest {
            minimum_points_required: minimum,
            maximum_points_required: free,
            estimated_first_point_render_time: now
                + Duration::from_millis(latency_ms.max(0) as u64),
            current_point_index: self.points_sent,
        }
    }

    /// Invoke the generator callback and enforce its contract.
    ///
    /// Returns false when no callback is installed.
    fn request_points(&mut self, request: &PointFillRequest) -> Result<bool> {
        let Some(callback) = self.callback.clone() else {
            return Ok(false);
        };

        self.points_to_send.clear();
        callback(request, &mut self.points_to_send);

        if self.points_to_send.len() < request.minimum_points_required {
            return Err(Error::CallbackUnderfill {
                required: request.minimum_points_required,
                provided: self.points_to_send.len(),
            });
        }
        Ok(true)
    }

    /// Serialize the staged points into a data frame and ship it.
    fn send_points(&mut self) -> Result<()> {
        // A clear or prepare scheduled by the last ACK outranks data.
        if self.requirements.clear_required || self.requirements.prepare_required {
            self.points_to_send.clear();
            return Ok(());
        }
        if self.points_to_send.is_empty() {
            return Ok(());
        }

        // Cap the frame to the free FIFO space and the u16 count field.
        let free = self.estimator.free_space(Instant::now());
        let max_points = free.min(u16::MAX as usize);
        if self.points_to_send.len() > max_points {
            self.points_to_send.truncate(max_points);
        }
        if self.points_to_send.is_empty() {
            return Ok(());
        }

        let inject_rate_change = self.rate_change_pending;
        let count = self.points_to_send.len() as u16;

        let StreamWorker {
            ref mut packet,
            ref points_to_send,
            ..
        } = *self;
        packet.set_data(count).map_err(Error::from_io)?;
        for (index, point) in points_to_send.iter().enumerate() {
            packet
                .push_point(point, inject_rate_change && index == 0)
                .map_err(Error::from_io)?;
        }

        if self.packet.is_empty() {
            self.points_to_send.clear();
            return Err(Error::SerializationEmpty);
        }

        debug!("tx data: points={count} bytes={}", self.packet.len());
        self.send_packet()?;

        self.points_sent += count as u64;
        if inject_rate_change {
            self.rate_change_pending = false;
        }
        self.points_to_send.clear();
        Ok(())
    }

    fn send_begin(&mut self, point_rate: u32) -> Result<()> {
        self.packet.set_begin(point_rate).map_err(Error::from_io)?;
        self.send_packet().map(|_| ())
    }

    /// Queue a rate change when the DAC is playing at the wrong rate.
    ///
    /// The new rate only takes effect once a data frame carries the
    /// rate-change control bit, so a successful `q` arms
    /// `rate_change_pending` for the next frame.
    fn ensure_target_point_rate(&mut self) -> Result<()> {
        if self.requirements.clear_required
            || self.requirements.prepare_required
            || self.requirements.begin_required
        {
            return Ok(());
        }
        let Some(status) = self.last_status else {
            return Ok(());
        };
        if status.playback_state == PlaybackState::Playing
            && status.point_rate != TARGET_POINT_RATE
        {
            info!(
                "queueing point rate change {} -> {}",
                status.point_rate, TARGET_POINT_RATE
            );
            self.packet
                .set_point_rate(TARGET_POINT_RATE)
                .map_err(Error::from_io)?;
            self.send_packet()?;
            self.rate_change_pending = true;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Failure handling
    // -------------------------------------------------------------------------

    fn record_failure(&mut self, context: &str, err: Error) {
        error!("{context} failed: {err}");
        if let Ok(mut guard) = self.shared.last_error.lock() {
            *guard = Some(err);
        }
        self.failure_encountered = true;
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LightEngineState, PlaybackState};

    fn status(
        light: LightEngineState,
        playback: PlaybackState,
        buffer_fullness: u16,
    ) -> DacStatus {
        DacStatus {
            protocol: 1,
            light_engine_state: light,
            playback_state: playback,
            source: 0,
            light_engine_flags: 0,
            playback_flags: 0,
            source_flags: 0,
            buffer_fullness,
            point_rate: 30_000,
            point_count: 0,
        }
    }

    #[test]
    fn estop_forces_clear_and_suppresses_everything_else() {
        let mut requirements = PlaybackRequirements::default();
        requirements.update(&status(LightEngineState::Estop, PlaybackState::Idle, 0), true);
        assert!(requirements.clear_required);
        assert!(!requirements.prepare_required);
        assert!(!requirements.begin_required);
    }

    #[test]
    fn underflow_flag_forces_clear() {
        let mut requirements = PlaybackRequirements::default();
        let mut st = status(LightEngineState::Ready, PlaybackState::Prepared, 1000);
        st.playback_flags = PLAYBACK_FLAG_UNDERFLOW;
        requirements.update(&st, true);
        assert!(requirements.clear_required);
        assert!(!requirements.prepare_required);
        assert!(!requirements.begin_required);

        // Other playback flag bits do not trigger a clear.
        st.playback_flags = 0x01;
        requirements.update(&st, true);
        assert!(!requirements.clear_required);
    }

    #[test]
    fn missing_ack_forces_clear() {
        let mut requirements = PlaybackRequirements::default();
        requirements.update(
            &status(LightEngineState::Ready, PlaybackState::Idle, 0),
            false,
        );
        assert!(requirements.clear_required);
        assert!(!requirements.prepare_required);
        assert!(!requirements.begin_required);
    }

    #[test]
    fn ready_and_idle_wants_prepare() {
        let mut requirements = PlaybackRequirements::default();
        requirements.update(&status(LightEngineState::Ready, PlaybackState::Idle, 0), true);
        assert!(!requirements.clear_required);
        assert!(requirements.prepare_required);
        assert!(!requirements.begin_required);
    }

    #[test]
    fn begin_waits_for_the_packet_floor() {
        let mut requirements = PlaybackRequirements::default();

        requirements.update(
            &status(LightEngineState::Ready, PlaybackState::Prepared, 149),
            true,
        );
        assert!(!requirements.begin_required);

        requirements.update(
            &status(LightEngineState::Ready, PlaybackState::Prepared, 150),
            true,
        );
        assert!(requirements.begin_required);
        assert!(!requirements.prepare_required);
    }

    #[test]
    fn playing_needs_nothing() {
        let mut requirements = PlaybackRequirements::default();
        requirements.update(
            &status(LightEngineState::Ready, PlaybackState::Playing, 1500),
            true,
        );
        assert_eq!(requirements, PlaybackRequirements::default());
    }

    #[test]
    fn requirement_update_is_idempotent() {
        let inputs = [
            (status(LightEngineState::Ready, PlaybackState::Idle, 0), true),
            (status(LightEngineState::Estop, PlaybackState::Idle, 0), true),
            (
                status(LightEngineState::Ready, PlaybackState::Prepared, 500),
                true,
            ),
            (
                status(LightEngineState::Ready, PlaybackState::Playing, 1500),
                false,
            ),
        ];

        for (st, acked) in inputs {
            let mut first = PlaybackRequirements::default();
            first.update(&st, acked);
            let snapshot = first;
            first.update(&st, acked);
            assert_eq!(first, snapshot, "update not idempotent for {st:?}");
        }
    }

    #[test]
    fn latency_is_clamped_to_at_least_one_millisecond() {
        let device = EtherDreamDevice::new();
        device.set_latency(0);
        assert_eq!(device.get_latency(), 1);
        device.set_latency(-20);
        assert_eq!(device.get_latency(), 1);
        device.set_latency(75);
        assert_eq!(device.get_latency(), 75);
    }

    #[test]
    fn start_without_a_connection_fails_fast() {
        let mut device = EtherDreamDevice::new();
        device.start();
        device.stop();
        assert_eq!(device.last_network_error(), Some(Error::NotConnected));
        assert!(!device.is_connected());
    }

    #[test]
    fn stop_and_close_are_idempotent() {
        let mut device = EtherDreamDevice::new();
        device.stop();
        device.stop();
        device.close();
        device.close();
        assert!(!device.is_connected());
        assert!(device.remembered_address().is_none());
    }

    #[test]
    fn connect_host_rejects_non_literal_addresses() {
        let mut device = EtherDreamDevice::new();
        let err = device.connect_host("laser.local", 7765).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}

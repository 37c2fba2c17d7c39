//! Synchronous TCP transport with a hard deadline on every call.
//!
//! The driver needs blocking reads and writes that cannot stall past the
//! latency budget: the OS-level socket deadline is re-armed with the
//! remaining budget before every syscall and partial transfers loop until
//! the frame is complete or the deadline passes.
//!
//! The socket handle is shared behind an `Arc` so that `close()` and
//! `cancel()` issued from the owner thread shut the socket down and wake a
//! worker blocked mid-operation. The worker is the only caller that
//! performs I/O, which keeps operations naturally serialized; each call
//! owns its accumulation state, so a deadline expiry can never corrupt the
//! result of a later call.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::debug;
use socket2::SockRef;

use crate::error::{Error, Result};

/// Fallback per-operation deadline when the caller does not pass one.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Fallback connection deadline.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Smallest deadline the OS accepts; zero would disable the timeout.
const MIN_DEADLINE: Duration = Duration::from_millis(1);

/// Per-operation timeout configuration.
///
/// Millisecond inputs are sanitized to be non-negative; the values are used
/// whenever the caller does not pass an explicit timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub default_timeout: Duration,
    pub connect_timeout: Duration,
}

impl TimeoutConfig {
    /// Build a configuration from millisecond values, clamping negatives to 0.
    pub fn from_millis(default_ms: i64, connect_ms: i64) -> Self {
        TimeoutConfig {
            default_timeout: Duration::from_millis(default_ms.max(0) as u64),
            connect_timeout: Duration::from_millis(connect_ms.max(0) as u64),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            default_timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Deadline-enforcing TCP client.
///
/// Cloning yields another handle to the same socket; this is how the owner
/// thread can close a connection the worker thread is blocked on.
#[derive(Clone)]
pub struct TcpTransport {
    socket: Arc<Mutex<Option<TcpStream>>>,
    timeouts: TimeoutConfig,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::with_timeouts(TimeoutConfig::default())
    }

    pub fn with_timeouts(timeouts: TimeoutConfig) -> Self {
        TcpTransport {
            socket: Arc::new(Mutex::new(None)),
            timeouts,
        }
    }

    pub fn timeouts(&self) -> TimeoutConfig {
        self.timeouts
    }

    /// Connect using the configured connect timeout.
    pub fn connect(&self, endpoint: SocketAddr) -> Result<()> {
        self.connect_with_timeout(endpoint, self.timeouts.connect_timeout)
    }

    /// Connect with an explicit deadline, replacing any previous socket.
    ///
    /// `TCP_NODELAY` is enabled on success; data frames must not sit in
    /// Nagle buffers while the DAC drains its FIFO.
    pub fn connect_with_timeout(&self, endpoint: SocketAddr, timeout: Duration) -> Result<()> {
        self.close();

        let timeout = timeout.max(MIN_DEADLINE);
        let stream = TcpStream::connect_timeout(&endpoint, timeout).map_err(Error::from_io)?;
        stream.set_nodelay(true).map_err(Error::from_io)?;

        if let Ok(mut guard) = self.socket.lock() {
            *guard = Some(stream);
        }
        Ok(())
    }

    /// Try a sequence of endpoints in order; the first success wins.
    ///
    /// Returns the last connection error, or [`Error::HostNotFound`] when
    /// the sequence is empty.
    pub fn connect_many(&self, endpoints: &[SocketAddr], timeout: Duration) -> Result<()> {
        let mut last = Error::HostNotFound;
        for &endpoint in endpoints {
            match self.connect_with_timeout(endpoint, timeout) {
                Ok(()) => return Ok(()),
                Err(err) => last = err,
            }
        }
        Err(last)
    }

    /// Read exactly `buf.len()` bytes before the deadline.
    ///
    /// Returns the number of bytes read on success. A deadline expiry logs
    /// how much of the frame had arrived and yields [`Error::TimedOut`]; the
    /// stream is then mid-frame and only fit for closing.
    pub fn read_exact(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let stream = self.stream_handle()?;
        let deadline = Instant::now() + timeout;
        let mut filled = 0;

        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("read timed out with {filled} of {} bytes received", buf.len());
                return Err(Error::TimedOut);
            }
            stream
                .set_read_timeout(Some(remaining.max(MIN_DEADLINE)))
                .map_err(Error::from_io)?;

            match (&stream).read(&mut buf[filled..]) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => filled += n,
                Err(err)
                    if err.kind() == std::io::ErrorKind::TimedOut
                        || err.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    debug!("read timed out with {filled} of {} bytes received", buf.len());
                    return Err(Error::TimedOut);
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::from_io(err)),
            }
        }
        Ok(filled)
    }

    /// [`Self::read_exact`] with the configured default timeout.
    pub fn read_exact_default(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_exact(buf, self.timeouts.default_timeout)
    }

    /// [`Self::write_all`] with the configured default timeout.
    pub fn write_all_default(&self, buf: &[u8]) -> Result<()> {
        self.write_all(buf, self.timeouts.default_timeout)
    }

    /// Write all of `buf` before the deadline.
    pub fn write_all(&self, buf: &[u8], timeout: Duration) -> Result<()> {
        let stream = self.stream_handle()?;
        let deadline = Instant::now() + timeout;
        let mut written = 0;

        while written < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::TimedOut);
            }
            stream
                .set_write_timeout(Some(remaining.max(MIN_DEADLINE)))
                .map_err(Error::from_io)?;

            match (&stream).write(&buf[written..]) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => written += n,
                Err(err)
                    if err.kind() == std::io::ErrorKind::TimedOut
                        || err.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    return Err(Error::TimedOut);
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::from_io(err)),
            }
        }
        Ok(())
    }

    /// Enable the low-latency socket options on an open connection:
    /// `TCP_NODELAY` plus `SO_KEEPALIVE`, so a dead link is noticed even
    /// when the stream goes quiet.
    pub fn set_low_latency(&self) {
        if let Ok(guard) = self.socket.lock() {
            if let Some(stream) = guard.as_ref() {
                let _ = stream.set_nodelay(true);
                let _ = SockRef::from(stream).set_keepalive(true);
            }
        }
    }

    /// Best-effort cancellation of in-flight operations.
    ///
    /// Shuts the socket down in both directions so a blocked read or write
    /// completes now instead of waiting for its deadline. The socket stays
    /// registered until `close()`.
    pub fn cancel(&self) {
        if let Ok(guard) = self.socket.lock() {
            if let Some(stream) = guard.as_ref() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }

    /// Close the connection. Idempotent; never fails observably.
    pub fn close(&self) {
        if let Ok(mut guard) = self.socket.lock() {
            if let Some(stream) = guard.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.socket
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Clone the underlying socket handle for one operation, holding the
    /// lock only for the clone so `close()` is never blocked behind I/O.
    fn stream_handle(&self) -> Result<TcpStream> {
        let guard = self.socket.lock().map_err(|_| Error::Cancelled)?;
        let stream = guard.as_ref().ok_or(Error::NotConnected)?;
        stream.try_clone().map_err(Error::from_io)
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpListener;
    use std::thread;

    fn local_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        (listener, addr)
    }

    #[test]
    fn timeout_config_sanitizes_negative_values() {
        let config = TimeoutConfig::from_millis(-50, -1);
        assert_eq!(config.default_timeout, Duration::ZERO);
        assert_eq!(config.connect_timeout, Duration::ZERO);

        let config = TimeoutConfig::from_millis(250, 1000);
        assert_eq!(config.default_timeout, Duration::from_millis(250));
        assert_eq!(config.connect_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn read_times_out_against_a_silent_peer() {
        let (listener, addr) = local_listener();
        let server = thread::spawn(move || {
            // Accept and hold the connection open without writing.
            let (stream, _) = listener.accept().expect("accept");
            thread::sleep(Duration::from_millis(500));
            drop(stream);
        });

        let transport = TcpTransport::new();
        transport
            .connect_with_timeout(addr, Duration::from_millis(500))
            .expect("connect");

        let timeout = Duration::from_millis(100);
        let started = Instant::now();
        let mut buf = [0u8; 22];
        let err = transport.read_exact(&mut buf, timeout).unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_timed_out());
        // Allow a little slack below the deadline for OS timer granularity.
        assert!(
            elapsed >= timeout - Duration::from_millis(20),
            "returned early: {elapsed:?}"
        );
        assert!(
            elapsed < timeout + Duration::from_millis(400),
            "deadline overshot: {elapsed:?}"
        );

        // The socket must still be closable after a timeout.
        transport.close();
        assert!(!transport.is_open());
        server.join().expect("server thread");
    }

    #[test]
    fn read_reports_connection_closed_on_peer_disconnect() {
        let (listener, addr) = local_listener();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            drop(stream);
        });

        let transport = TcpTransport::new();
        transport
            .connect_with_timeout(addr, Duration::from_millis(500))
            .expect("connect");
        server.join().expect("server thread");

        let mut buf = [0u8; 4];
        let err = transport
            .read_exact(&mut buf, Duration::from_millis(500))
            .unwrap_err();
        assert_eq!(err, Error::ConnectionClosed);
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (listener, addr) = local_listener();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).expect("server read");
            stream.write_all(&buf).expect("server write");
        });

        let transport = TcpTransport::with_timeouts(TimeoutConfig::from_millis(500, 500));
        transport.connect(addr).expect("connect");
        transport.set_low_latency();

        transport.write_all_default(b"hello").expect("write");

        let mut buf = [0u8; 5];
        let read = transport.read_exact_default(&mut buf).expect("read");
        assert_eq!(read, 5);
        assert_eq!(&buf, b"hello");
        server.join().expect("server thread");
    }

    #[test]
    fn connect_refused_maps_onto_the_taxonomy() {
        // Bind then drop to obtain a port with nothing listening.
        let (listener, addr) = local_listener();
        drop(listener);

        let transport = TcpTransport::new();
        let err = transport
            .connect_with_timeout(addr, Duration::from_millis(500))
            .unwrap_err();
        assert_eq!(err, Error::ConnectRefused);
        assert!(!transport.is_open());
    }

    #[test]
    fn connect_many_returns_host_not_found_for_empty_sequence() {
        let transport = TcpTransport::new();
        let err = transport
            .connect_many(&[], Duration::from_millis(100))
            .unwrap_err();
        assert_eq!(err, Error::HostNotFound);
    }

    #[test]
    fn connect_many_falls_through_to_a_live_endpoint() {
        let (dead, dead_addr) = local_listener();
        drop(dead);
        let (listener, live_addr) = local_listener();
        let server = thread::spawn(move || {
            let _ = listener.accept();
        });

        let transport = TcpTransport::new();
        transport
            .connect_many(&[dead_addr, live_addr], Duration::from_millis(500))
            .expect("second endpoint should win");
        assert!(transport.is_open());
        transport.close();
        server.join().expect("server thread");
    }

    #[test]
    fn close_is_idempotent() {
        let transport = TcpTransport::new();
        transport.close();
        transport.close();
        assert!(!transport.is_open());

        let mut buf = [0u8; 1];
        let err = transport
            .read_exact(&mut buf, Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err, Error::NotConnected);
    }

    #[test]
    fn close_from_a_clone_wakes_a_blocked_reader() {
        let (listener, addr) = local_listener();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            thread::sleep(Duration::from_millis(800));
            drop(stream);
        });

        let transport = TcpTransport::new();
        transport
            .connect_with_timeout(addr, Duration::from_millis(500))
            .expect("connect");

        let handle = transport.clone();
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.cancel();
        });

        let started = Instant::now();
        let mut buf = [0u8; 22];
        let err = transport
            .read_exact(&mut buf, Duration::from_millis(2000))
            .unwrap_err();

        // The shutdown must end the read well before the 2s deadline.
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert!(matches!(err, Error::ConnectionClosed | Error::Io { .. }));

        closer.join().expect("closer thread");
        server.join().expect("server thread");
    }
}

//! Byte-stream endpoints driven by the Raw-REPL engine.
//!
//! Two traits with identical observable semantics:
//!
//! - [`Transport`]: blocking reads guarded by a readiness check with a timeout
//! - [`AsyncTransport`]: non-blocking reads that suspend only while waiting
//!   for peer bytes
//!
//! Both provide `read_until`, `read_exact` and `drain` on top of a minimal
//! `read`/`write_all` core. A timeout never closes the endpoint; the caller
//! decides whether to retry or give up.
//!
//! Concrete endpoints:
//!
//! - [`fd::FdStream`]: serial line or PTY master
//! - [`tcp::TcpTransport`]: raw socket or telnet-framed socket
//! - [`crate::process::SoftResetEmulator`]: PTY child behind the reset interceptor

pub mod fd;
pub mod tcp;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Phase, ProtocolError, TransportError};

/// A read that failed part-way, together with what did arrive.
#[derive(Debug)]
pub struct PartialRead {
    /// Why the read stopped.
    pub error: TransportError,
    /// Bytes received before the failure.
    pub received: Vec<u8>,
}

impl PartialRead {
    fn new(error: TransportError, received: Vec<u8>) -> Self {
        Self { error, received }
    }

    /// Convert into a protocol error for the given phase.
    pub fn into_protocol(self, phase: Phase) -> ProtocolError {
        ProtocolError::from_transport(phase, self.error, self.received)
    }
}

/// Blocking byte-stream endpoint.
pub trait Transport: Send {
    /// Read at least one byte, waiting up to `timeout` for the first.
    ///
    /// Never returns `Ok(0)`; end of stream is [`TransportError::Closed`].
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Write the whole buffer in order.
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Close the endpoint. Idempotent.
    fn close(&mut self);

    /// Whether [`close`](Self::close) was called or the peer went away.
    fn is_closed(&self) -> bool;

    /// Read one byte.
    fn read_byte(&mut self, timeout: Duration) -> Result<u8, TransportError> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte, timeout)? {
            0 => Err(TransportError::Closed),
            _ => Ok(byte[0]),
        }
    }

    /// Read exactly `n` bytes; `timeout` applies to each byte.
    fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, PartialRead> {
        let mut data = Vec::with_capacity(n);
        while data.len() < n {
            match self.read_byte(timeout) {
                Ok(byte) => data.push(byte),
                Err(e) => return Err(PartialRead::new(e, data)),
            }
        }
        Ok(data)
    }

    /// Read until `marker` has been received, returning everything up to and
    /// including it. `timeout` is an inactivity timeout: it restarts with
    /// every byte.
    ///
    /// When `consumer` is given, bytes are handed to it as they arrive
    /// (excluding the marker) instead of being accumulated, and the returned
    /// buffer holds only the marker. Streaming requires a single-byte marker.
    fn read_until(
        &mut self,
        marker: &[u8],
        timeout: Duration,
        mut consumer: Option<&mut (dyn for<'a> FnMut(&'a [u8]) + Send)>,
    ) -> Result<Vec<u8>, PartialRead> {
        debug_assert!(consumer.is_none() || marker.len() == 1);
        let mut data = Vec::new();
        loop {
            let byte = match self.read_byte(timeout) {
                Ok(byte) => byte,
                Err(e) => return Err(PartialRead::new(e, data)),
            };
            if let Some(consume) = consumer.as_mut() {
                if byte == marker[0] {
                    return Ok(vec![byte]);
                }
                consume(&[byte]);
                continue;
            }
            data.push(byte);
            if data.ends_with(marker) {
                return Ok(data);
            }
        }
    }

    /// Discard input until nothing arrives for `quiet`. Returns the number of
    /// bytes dropped.
    fn drain(&mut self, quiet: Duration) -> Result<usize, TransportError> {
        let mut buf = [0u8; 256];
        let mut dropped = 0;
        loop {
            match self.read(&mut buf, quiet) {
                Ok(n) => dropped += n,
                Err(TransportError::Timeout) => return Ok(dropped),
                Err(e) => return Err(e),
            }
        }
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).read(buf, timeout)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write_all(data)
    }

    fn close(&mut self) {
        (**self).close();
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

/// Cooperatively scheduled byte-stream endpoint.
///
/// `read` is cancellation safe: dropping its future before completion loses
/// no bytes. This lets it sit in a `tokio::select!` next to other branches.
#[async_trait]
pub trait AsyncTransport: Send {
    /// Read at least one byte, suspending until data is available.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write the whole buffer in order.
    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Close the endpoint. Idempotent.
    async fn close(&mut self);

    /// Whether the endpoint is closed.
    fn is_closed(&self) -> bool;

    /// Read one byte within `timeout`.
    async fn read_byte(&mut self, timeout: Duration) -> Result<u8, TransportError> {
        let mut byte = [0u8; 1];
        match tokio::time::timeout(timeout, self.read(&mut byte)).await {
            Ok(Ok(0)) => Err(TransportError::Closed),
            Ok(Ok(_)) => Ok(byte[0]),
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => Err(TransportError::Timeout),
        }
    }

    /// Read exactly `n` bytes; `timeout` applies to each byte.
    async fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, PartialRead> {
        let mut data = Vec::with_capacity(n);
        while data.len() < n {
            match self.read_byte(timeout).await {
                Ok(byte) => data.push(byte),
                Err(e) => return Err(PartialRead::new(e, data)),
            }
        }
        Ok(data)
    }

    /// Same contract as [`Transport::read_until`].
    async fn read_until(
        &mut self,
        marker: &[u8],
        timeout: Duration,
        mut consumer: Option<&mut (dyn for<'a> FnMut(&'a [u8]) + Send)>,
    ) -> Result<Vec<u8>, PartialRead> {
        debug_assert!(consumer.is_none() || marker.len() == 1);
        let mut data = Vec::new();
        loop {
            let byte = match self.read_byte(timeout).await {
                Ok(byte) => byte,
                Err(e) => return Err(PartialRead::new(e, data)),
            };
            if let Some(consume) = consumer.as_mut() {
                if byte == marker[0] {
                    return Ok(vec![byte]);
                }
                consume(&[byte]);
                continue;
            }
            data.push(byte);
            if data.ends_with(marker) {
                return Ok(data);
            }
        }
    }

    /// Discard input until nothing arrives for `quiet`.
    async fn drain(&mut self, quiet: Duration) -> Result<usize, TransportError> {
        let mut buf = [0u8; 256];
        let mut dropped = 0;
        loop {
            match tokio::time::timeout(quiet, self.read(&mut buf)).await {
                Ok(Ok(n)) => dropped += n,
                Ok(Err(TransportError::Timeout)) | Err(_) => return Ok(dropped),
                Ok(Err(e)) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<T: AsyncTransport + ?Sized> AsyncTransport for Box<T> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).read(buf).await
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write_all(data).await
    }

    async fn close(&mut self) {
        (**self).close().await;
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

// ============================================================================
// Read buffering
// ============================================================================

/// Bytes read from the OS but not yet handed to the caller.
///
/// Endpoints read in bulk and serve `read_until` byte by byte from here, so
/// nothing past a marker is ever consumed from the kernel and lost.
#[derive(Debug, Default)]
pub(crate) struct InputBuffer {
    data: Vec<u8>,
    pos: usize,
}

impl InputBuffer {
    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Copy buffered bytes into `buf`, returning how many were copied.
    pub(crate) fn take_into(&mut self, buf: &mut [u8]) -> usize {
        let available = &self.data[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        if self.is_empty() {
            self.data.clear();
            self.pos = 0;
        }
        n
    }

    /// Append freshly read bytes.
    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub(crate) fn clear(&mut self) {
        self.data.clear();
        self.pos = 0;
    }
}

// ============================================================================
// Connection targets
// ============================================================================

/// Where the client-side engine connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Serial line (or any character device) at the given baud rate.
    Serial {
        /// Device path.
        path: PathBuf,
        /// Line speed.
        baud: u32,
    },
    /// Plain TCP socket carrying the REPL stream unescaped.
    Tcp {
        /// `host:port`.
        addr: String,
    },
    /// Telnet/RFC 2217 framed TCP socket.
    Rfc2217 {
        /// `host:port`.
        addr: String,
    },
    /// Interpreter subprocess on a local PTY, behind the soft-reset emulator.
    Exec {
        /// Interpreter executable.
        program: String,
        /// Arguments passed through unchanged.
        args: Vec<String>,
    },
}

impl Target {
    /// Parse a target string.
    ///
    /// Accepted forms: `serial:/dev/ttyACM0[@baud]`, a bare `/dev/...` path,
    /// `tcp://host:port`, `rfc2217://host:port`, `exec:PROGRAM [ARGS...]`.
    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        let spec = spec.trim();
        if let Some(addr) = spec.strip_prefix("tcp://") {
            return Ok(Self::Tcp { addr: non_empty_addr(addr, spec)? });
        }
        if let Some(addr) = spec.strip_prefix("rfc2217://") {
            return Ok(Self::Rfc2217 { addr: non_empty_addr(addr, spec)? });
        }
        if let Some(command) = spec.strip_prefix("exec:") {
            let mut words = command.split_whitespace().map(str::to_string);
            let program = words
                .next()
                .ok_or_else(|| anyhow::anyhow!("exec target needs a program: {spec}"))?;
            let program = shellexpand::tilde(&program).into_owned();
            return Ok(Self::Exec { program, args: words.collect() });
        }
        let device = spec.strip_prefix("serial:").unwrap_or(spec);
        if !spec.starts_with("serial:") && !device.starts_with("/dev/") {
            anyhow::bail!("Unrecognized target: {spec}");
        }
        let (path, baud) = match device.rsplit_once('@') {
            Some((path, baud)) => {
                let baud = baud
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid baud rate in {spec}: {e}"))?;
                (path, baud)
            }
            None => (device, crate::constants::DEFAULT_BAUD_RATE),
        };
        if path.is_empty() {
            anyhow::bail!("serial target needs a device path: {spec}");
        }
        Ok(Self::Serial { path: PathBuf::from(shellexpand::tilde(path).as_ref()), baud })
    }

    /// Open a blocking endpoint for this target.
    pub fn open(&self) -> anyhow::Result<Box<dyn Transport>> {
        use anyhow::Context;

        Ok(match self {
            Self::Serial { path, baud } => Box::new(
                fd::FdStream::open_serial(path, *baud)
                    .with_context(|| format!("Failed to open {}", path.display()))?,
            ),
            Self::Tcp { addr } => Box::new(
                tcp::TcpTransport::connect(addr, tcp::Framing::Raw)
                    .with_context(|| format!("Failed to connect to {addr}"))?,
            ),
            Self::Rfc2217 { addr } => Box::new(
                tcp::TcpTransport::connect(addr, tcp::Framing::Telnet)
                    .with_context(|| format!("Failed to connect to {addr}"))?,
            ),
            Self::Exec { program, args } => Box::new(Self::open_emulator(program, args)?),
        })
    }

    /// Open a cooperatively scheduled endpoint for this target.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn open_async(&self) -> anyhow::Result<Box<dyn AsyncTransport>> {
        use anyhow::Context;

        Ok(match self {
            Self::Serial { path, baud } => Box::new(
                fd::FdStream::open_serial(path, *baud)
                    .with_context(|| format!("Failed to open {}", path.display()))?,
            ),
            Self::Tcp { addr } => Box::new(
                tcp::AsyncTcpTransport::connect(addr, tcp::Framing::Raw)
                    .await
                    .with_context(|| format!("Failed to connect to {addr}"))?,
            ),
            Self::Rfc2217 { addr } => Box::new(
                tcp::AsyncTcpTransport::connect(addr, tcp::Framing::Telnet)
                    .await
                    .with_context(|| format!("Failed to connect to {addr}"))?,
            ),
            Self::Exec { program, args } => Box::new(Self::open_emulator(program, args)?),
        })
    }

    fn open_emulator(
        program: &str,
        args: &[String],
    ) -> anyhow::Result<crate::process::SoftResetEmulator> {
        let config = crate::process::SessionConfig::new(program).args(args.iter().cloned());
        let mut emulator = crate::process::SoftResetEmulator::new(config);
        emulator.start()?;
        Ok(emulator)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial { path, baud } => write!(f, "serial:{}@{baud}", path.display()),
            Self::Tcp { addr } => write!(f, "tcp://{addr}"),
            Self::Rfc2217 { addr } => write!(f, "rfc2217://{addr}"),
            Self::Exec { program, args } if args.is_empty() => write!(f, "exec:{program}"),
            Self::Exec { program, args } => write!(f, "exec:{program} {}", args.join(" ")),
        }
    }
}

fn non_empty_addr(addr: &str, spec: &str) -> anyhow::Result<String> {
    if addr.is_empty() || !addr.contains(':') {
        anyhow::bail!("Expected host:port in {spec}");
    }
    Ok(addr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory endpoint serving scripted bytes.
    struct Script {
        input: VecDeque<u8>,
        written: Vec<u8>,
    }

    impl Script {
        fn new(input: &[u8]) -> Self {
            Self { input: input.iter().copied().collect(), written: Vec::new() }
        }
    }

    impl Transport for Script {
        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
            let mut n = 0;
            while n < buf.len() {
                match self.input.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            if n == 0 {
                Err(TransportError::Timeout)
            } else {
                Ok(n)
            }
        }

        fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
            self.written.extend_from_slice(data);
            Ok(())
        }

        fn close(&mut self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    const T: Duration = Duration::from_millis(10);

    #[test]
    fn test_read_until_stops_at_marker() {
        let mut s = Script::new(b"abc>def");
        assert_eq!(s.read_until(b">", T, None).unwrap(), b"abc>");
        // Bytes after the marker stay unread.
        assert_eq!(s.read_exact(3, T).unwrap(), b"def");
    }

    #[test]
    fn test_read_until_multi_byte_marker() {
        let mut s = Script::new(b"xxraw REPL; CTRL-B to exit\r\n>");
        let data = s.read_until(b"raw REPL; CTRL-B to exit\r\n", T, None).unwrap();
        assert!(data.ends_with(b"exit\r\n"));
        assert_eq!(s.read_byte(T).unwrap(), b'>');
    }

    #[test]
    fn test_read_until_timeout_keeps_partial() {
        let mut s = Script::new(b"partial");
        let err = s.read_until(b"\x04", T, None).unwrap_err();
        assert!(matches!(err.error, TransportError::Timeout));
        assert_eq!(err.received, b"partial");
    }

    #[test]
    fn test_read_until_streams_to_consumer() {
        let mut s = Script::new(b"hello\x04rest");
        let mut seen = Vec::new();
        let mut consume = |b: &[u8]| seen.extend_from_slice(b);
        let data = s.read_until(b"\x04", T, Some(&mut consume)).unwrap();
        assert_eq!(data, b"\x04");
        assert_eq!(seen, b"hello");
    }

    #[test]
    fn test_drain_discards_everything() {
        let mut s = Script::new(b"stale output");
        assert_eq!(s.drain(T).unwrap(), 12);
        assert!(matches!(s.read_byte(T), Err(TransportError::Timeout)));
    }

    #[test]
    fn test_input_buffer_take_into() {
        let mut b = InputBuffer::default();
        b.extend(b"abcdef");
        let mut out = [0u8; 4];
        assert_eq!(b.take_into(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(b.take_into(&mut out), 2);
        assert_eq!(&out[..2], b"ef");
        assert!(b.is_empty());
    }

    #[test]
    fn test_target_parse() {
        assert_eq!(
            Target::parse("serial:/dev/ttyACM0@9600").unwrap(),
            Target::Serial { path: PathBuf::from("/dev/ttyACM0"), baud: 9600 }
        );
        assert_eq!(
            Target::parse("/dev/ttyUSB1").unwrap(),
            Target::Serial { path: PathBuf::from("/dev/ttyUSB1"), baud: 115_200 }
        );
        assert_eq!(
            Target::parse("tcp://localhost:2218").unwrap(),
            Target::Tcp { addr: "localhost:2218".to_string() }
        );
        assert_eq!(
            Target::parse("rfc2217://127.0.0.1:2217").unwrap(),
            Target::Rfc2217 { addr: "127.0.0.1:2217".to_string() }
        );
        assert_eq!(
            Target::parse("exec:micropython -X heapsize=1M").unwrap(),
            Target::Exec {
                program: "micropython".to_string(),
                args: vec!["-X".to_string(), "heapsize=1M".to_string()],
            }
        );
    }

    #[test]
    fn test_target_parse_rejects_garbage() {
        assert!(Target::parse("COM3").is_err());
        assert!(Target::parse("tcp://").is_err());
        assert!(Target::parse("exec:").is_err());
        assert!(Target::parse("serial:/dev/ttyACM0@fast").is_err());
    }

    #[test]
    fn test_target_display_round_trips() {
        for spec in ["serial:/dev/ttyACM0@9600", "tcp://h:1", "rfc2217://h:2", "exec:mp -i"] {
            let target = Target::parse(spec).unwrap();
            assert_eq!(Target::parse(&target.to_string()).unwrap(), target);
        }
    }
}

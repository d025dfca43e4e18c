//! TCP client endpoints, plain or telnet-framed.
//!
//! `tcp://` targets carry the REPL byte stream unmodified. `rfc2217://`
//! targets run the client role of [`TelnetCodec`]: outbound bytes are
//! IAC-escaped, inbound bytes are stripped of negotiation and any protocol
//! replies are written back before the payload is handed to the caller.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{AsyncTransport, InputBuffer, Transport};
use crate::bridge::telnet::{self, Role, TelnetCodec};
use crate::constants::{COPY_BUFFER_SIZE, WRITE_TIMEOUT};
use crate::error::TransportError;

/// Byte-level framing of a TCP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No escaping.
    Raw,
    /// Telnet with RFC 2217 negotiation.
    Telnet,
}

/// Applies the configured framing to both directions.
#[derive(Debug)]
struct Framer {
    codec: Option<TelnetCodec>,
}

impl Framer {
    fn new(framing: Framing) -> Self {
        Self {
            codec: match framing {
                Framing::Raw => None,
                Framing::Telnet => Some(TelnetCodec::new(Role::Client)),
            },
        }
    }

    fn greeting(&mut self) -> Vec<u8> {
        self.codec.as_mut().map(TelnetCodec::initial_negotiation).unwrap_or_default()
    }

    /// Returns `(payload, reply)`.
    fn inbound(&mut self, bytes: &[u8]) -> (Vec<u8>, Vec<u8>) {
        match self.codec.as_mut() {
            Some(codec) => {
                let decoded = codec.decode(bytes);
                (decoded.data, decoded.reply)
            }
            None => (bytes.to_vec(), Vec::new()),
        }
    }

    fn outbound(&self, bytes: &[u8]) -> Vec<u8> {
        match self.codec {
            Some(_) => telnet::escape(bytes),
            None => bytes.to_vec(),
        }
    }
}

/// Blocking TCP endpoint.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    framer: Framer,
    input: InputBuffer,
}

impl TcpTransport {
    /// Connect to `addr` (`host:port`).
    pub fn connect(addr: &str, framing: Framing) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        let mut transport = Self {
            stream: Some(stream),
            framer: Framer::new(framing),
            input: InputBuffer::default(),
        };
        let greeting = transport.framer.greeting();
        if !greeting.is_empty() {
            transport.raw_write(&greeting).map_err(|e| io::Error::other(e.to_string()))?;
        }
        log::debug!("Connected to {addr} ({framing:?})");
        Ok(transport)
    }

    fn raw_write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let result = stream.write_all(data).map_err(TransportError::from);
        if matches!(result, Err(TransportError::Closed)) {
            self.stream = None;
        }
        result
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; COPY_BUFFER_SIZE];
        // Negotiation-only segments carry no payload, so keep reading until
        // data arrives or the deadline passes.
        while self.input.is_empty() {
            let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout);
            }
            stream.set_read_timeout(Some(remaining))?;
            let n = match stream.read(&mut chunk) {
                Ok(0) => {
                    self.stream = None;
                    return Err(TransportError::Closed);
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let e = TransportError::from(e);
                    if e.is_fatal() {
                        self.stream = None;
                    }
                    return Err(e);
                }
            };
            let (payload, reply) = self.framer.inbound(&chunk[..n]);
            self.input.extend(&payload);
            if !reply.is_empty() {
                self.raw_write(&reply)?;
            }
        }
        Ok(self.input.take_into(buf))
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let framed = self.framer.outbound(data);
        self.raw_write(&framed)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.input.clear();
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

/// Cooperatively scheduled TCP endpoint.
#[derive(Debug)]
pub struct AsyncTcpTransport {
    stream: Option<tokio::net::TcpStream>,
    framer: Framer,
    input: InputBuffer,
}

impl AsyncTcpTransport {
    /// Connect to `addr` (`host:port`).
    pub async fn connect(addr: &str, framing: Framing) -> io::Result<Self> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let mut transport = Self {
            stream: Some(stream),
            framer: Framer::new(framing),
            input: InputBuffer::default(),
        };
        let greeting = transport.framer.greeting();
        if !greeting.is_empty() {
            transport.raw_write(&greeting).await.map_err(|e| io::Error::other(e.to_string()))?;
        }
        log::debug!("Connected to {addr} ({framing:?})");
        Ok(transport)
    }

    async fn raw_write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let result = stream.write_all(data).await.map_err(TransportError::from);
        if matches!(result, Err(TransportError::Closed)) {
            self.stream = None;
        }
        result
    }
}

#[async_trait]
impl AsyncTransport for AsyncTcpTransport {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut chunk = [0u8; COPY_BUFFER_SIZE];
        while self.input.is_empty() {
            let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
            // `read` on a tokio TcpStream is cancellation safe.
            let n = match stream.read(&mut chunk).await {
                Ok(0) => {
                    self.stream = None;
                    return Err(TransportError::Closed);
                }
                Ok(n) => n,
                Err(e) => {
                    let e = TransportError::from(e);
                    if e.is_fatal() {
                        self.stream = None;
                    }
                    return Err(e);
                }
            };
            let (payload, reply) = self.framer.inbound(&chunk[..n]);
            self.input.extend(&payload);
            if !reply.is_empty() {
                self.raw_write(&reply).await?;
            }
        }
        Ok(self.input.take_into(buf))
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let framed = self.framer.outbound(data);
        self.raw_write(&framed).await
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.input.clear();
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::telnet::cmd::{DO, IAC, WILL};
    use crate::bridge::telnet::option::{BINARY, COM_PORT, SGA};
    use std::net::TcpListener;

    #[test]
    fn test_raw_framing_is_transparent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(&[0xFF, b'a', 0x04]).unwrap();
            let mut got = [0u8; 2];
            sock.read_exact(&mut got).unwrap();
            got
        });

        let mut transport = TcpTransport::connect(&addr, Framing::Raw).unwrap();
        let data = transport.read_until(b"\x04", Duration::from_secs(2), None).unwrap();
        assert_eq!(data, vec![0xFF, b'a', 0x04]);
        transport.write_all(&[0xFF, b'b']).unwrap();
        assert_eq!(server.join().unwrap(), [0xFF, b'b']);
    }

    #[test]
    fn test_telnet_framing_escapes_and_answers() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            // Unsolicited offer the client has not asked for, then escaped payload.
            sock.write_all(&[IAC, WILL, COM_PORT, b'x', IAC, IAC, b'\n']).unwrap();
            sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 64];
            while !received.ends_with(&[IAC, IAC]) {
                let n = sock.read(&mut buf).unwrap();
                assert!(n > 0, "client closed early");
                received.extend_from_slice(&buf[..n]);
            }
            received
        });

        let mut transport = TcpTransport::connect(&addr, Framing::Telnet).unwrap();
        let data = transport.read_until(b"\n", Duration::from_secs(2), None).unwrap();
        assert_eq!(data, vec![b'x', 0xFF, b'\n']);
        transport.write_all(&[0xFF]).unwrap();

        let received = server.join().unwrap();
        // Greeting, the DO answering the unsolicited WILL, then the escaped byte.
        assert!(received.starts_with(&[IAC, WILL, SGA, IAC, WILL, BINARY, IAC, WILL, COM_PORT]));
        assert!(received.windows(3).any(|w| w == [IAC, DO, COM_PORT]));
        assert!(received.ends_with(&[IAC, IAC]));
    }

    #[tokio::test]
    async fn test_async_raw_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"OK\x04").await.unwrap();
            let mut got = [0u8; 3];
            sock.read_exact(&mut got).await.unwrap();
            got
        });

        let mut transport = AsyncTcpTransport::connect(&addr, Framing::Raw).await.unwrap();
        let data = AsyncTransport::read_until(&mut transport, b"\x04", Duration::from_secs(2), None)
            .await
            .unwrap();
        assert_eq!(data, b"OK\x04");
        AsyncTransport::write_all(&mut transport, b"abc").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"abc");
    }
}

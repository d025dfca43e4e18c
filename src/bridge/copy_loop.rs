//! Bidirectional pump between one client socket and the interpreter.
//!
//! Both directions are branches of a single `select!`, so cancelling the
//! token or losing either side ends the whole connection at once. Writes
//! inside a branch also race the token, so a client that stops reading
//! cannot hold the interpreter past its displacement.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::telnet::{self, Role, TelnetCodec};
use super::ProtocolKind;
use crate::constants::COPY_BUFFER_SIZE;
use crate::error::TransportError;
use crate::transport::AsyncTransport;

/// Why a copy loop stopped.
#[derive(Debug)]
pub enum CopyEnd {
    /// The token was cancelled (displaced by another client or shutdown).
    Cancelled,
    /// The client closed its side.
    ClientClosed,
    /// Reading from or writing to the client failed.
    ClientError(std::io::Error),
    /// The interpreter side failed, usually because the child exited.
    Device(TransportError),
}

/// Byte-level framing for one listener kind.
#[derive(Debug)]
struct Filter {
    codec: Option<TelnetCodec>,
}

impl Filter {
    fn new(kind: ProtocolKind) -> Self {
        let codec = match kind {
            ProtocolKind::Rfc2217 => Some(TelnetCodec::new(Role::Server)),
            ProtocolKind::RawSocket => None,
        };
        Self { codec }
    }

    fn greeting(&mut self) -> Vec<u8> {
        self.codec.as_mut().map(TelnetCodec::initial_negotiation).unwrap_or_default()
    }

    /// Client bytes to `(payload for the interpreter, reply for the client)`.
    fn inbound(&mut self, data: &[u8]) -> (Vec<u8>, Vec<u8>) {
        match self.codec.as_mut() {
            Some(codec) => {
                let decoded = codec.decode(data);
                (decoded.data, decoded.reply)
            }
            None => (data.to_vec(), Vec::new()),
        }
    }

    fn outbound(&self, data: &[u8]) -> Vec<u8> {
        match self.codec {
            Some(_) => telnet::escape(data),
            None => data.to_vec(),
        }
    }
}

/// Await `op` unless `cancel` fires first.
async fn unless_cancelled<T>(cancel: &CancellationToken, op: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        () = cancel.cancelled() => None,
        out = op => Some(out),
    }
}

/// Pump bytes until either side goes away or `cancel` fires.
pub async fn run<S, D>(
    client: S,
    device: &mut D,
    kind: ProtocolKind,
    cancel: &CancellationToken,
) -> CopyEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
    D: AsyncTransport + ?Sized,
{
    let (mut reader, mut writer) = tokio::io::split(client);
    let mut filter = Filter::new(kind);
    let greeting = filter.greeting();
    if !greeting.is_empty() {
        match unless_cancelled(cancel, writer.write_all(&greeting)).await {
            None => return CopyEnd::Cancelled,
            Some(Err(e)) => return CopyEnd::ClientError(e),
            Some(Ok(())) => {}
        }
    }

    let mut client_buf = [0u8; COPY_BUFFER_SIZE];
    let mut device_buf = [0u8; COPY_BUFFER_SIZE];
    loop {
        tokio::select! {
            () = cancel.cancelled() => return CopyEnd::Cancelled,

            result = reader.read(&mut client_buf) => {
                let n = match result {
                    Ok(0) => return CopyEnd::ClientClosed,
                    Ok(n) => n,
                    Err(e) => return CopyEnd::ClientError(e),
                };
                let (payload, reply) = filter.inbound(&client_buf[..n]);
                if !reply.is_empty() {
                    match unless_cancelled(cancel, writer.write_all(&reply)).await {
                        None => return CopyEnd::Cancelled,
                        Some(Err(e)) => return CopyEnd::ClientError(e),
                        Some(Ok(())) => {}
                    }
                }
                if !payload.is_empty() {
                    match unless_cancelled(cancel, device.write_all(&payload)).await {
                        None => return CopyEnd::Cancelled,
                        Some(Err(e)) => return CopyEnd::Device(e),
                        Some(Ok(())) => {}
                    }
                }
            }

            result = device.read(&mut device_buf) => {
                let n = match result {
                    Ok(n) => n,
                    Err(e) => return CopyEnd::Device(e),
                };
                let out = filter.outbound(&device_buf[..n]);
                match unless_cancelled(cancel, writer.write_all(&out)).await {
                    None => return CopyEnd::Cancelled,
                    Some(Err(e)) => return CopyEnd::ClientError(e),
                    Some(Ok(())) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::duplex;

    /// Interpreter that never prints and swallows input.
    struct Silent;

    #[async_trait]
    impl AsyncTransport for Silent {
        async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, TransportError> {
            std::future::pending().await
        }

        async fn write_all(&mut self, _data: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&mut self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    /// Interpreter that prints as fast as it is read.
    struct Chatty;

    #[async_trait]
    impl AsyncTransport for Chatty {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
            buf.fill(b'y');
            Ok(buf.len())
        }

        async fn write_all(&mut self, _data: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&mut self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_raw_filter_is_transparent() {
        let mut filter = Filter::new(ProtocolKind::RawSocket);
        assert!(filter.greeting().is_empty());
        assert_eq!(filter.inbound(b"\xff\x01"), (b"\xff\x01".to_vec(), Vec::new()));
        assert_eq!(filter.outbound(b"\xff"), b"\xff");
    }

    #[test]
    fn test_telnet_filter_escapes() {
        let mut filter = Filter::new(ProtocolKind::Rfc2217);
        assert!(!filter.greeting().is_empty());
        assert_eq!(filter.inbound(b"a\xff\xffb").0, b"a\xffb");
        assert_eq!(filter.outbound(b"a\xffb"), b"a\xff\xffb");
    }

    #[tokio::test]
    async fn test_cancel_ends_loop() {
        let (client, _peer) = duplex(64);
        let mut device = Silent;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let end = run(client, &mut device, ProtocolKind::RawSocket, &cancel).await;
        assert!(matches!(end, CopyEnd::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_ends_loop_blocked_on_stalled_client() {
        // The peer never reads, so the client write fills the pipe and blocks.
        let (client, _peer) = duplex(64);
        let mut device = Chatty;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let end = tokio::time::timeout(
            Duration::from_secs(2),
            run(client, &mut device, ProtocolKind::RawSocket, &cancel),
        )
        .await
        .expect("copy loop stayed blocked writing to a stalled client");
        assert!(matches!(end, CopyEnd::Cancelled));
    }

    #[tokio::test]
    async fn test_client_close_ends_loop() {
        let (client, peer) = duplex(64);
        drop(peer);
        let mut device = Silent;
        let cancel = CancellationToken::new();
        let end = tokio::time::timeout(
            Duration::from_secs(2),
            run(client, &mut device, ProtocolKind::RawSocket, &cancel),
        )
        .await
        .expect("copy loop did not notice the closed client");
        assert!(matches!(end, CopyEnd::ClientClosed | CopyEnd::ClientError(_)));
    }
}

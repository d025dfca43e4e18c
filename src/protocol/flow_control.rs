//! Raw-paste upload with credit-based flow control.
//!
//! ```text
//! peer -> R \x01 <u16 LE window>
//! host -> up to `window` bytes
//! peer -> \x01                      (another window of credit)
//! host -> ...
//! host -> \x04                      (end of payload)
//! peer -> \x04                      (acknowledged)
//! ```
//!
//! The peer may send `\x04` instead of a credit byte to close the window
//! early. The host acknowledges with its own `\x04` and abandons the upload.
//!
//! [`PasteUpload`] holds the accounting and is driven by the blocking
//! [`upload`] and the async [`upload_async`].

use std::ops::Range;
use std::time::Duration;

use super::control::{CREDIT, END_OF_TRANSMISSION, WINDOW_CLOSED};
use crate::error::{TransportError, UploadError};
use crate::transport::{AsyncTransport, Transport};

/// Credit available to the sender.
///
/// `credit_remaining` never exceeds `window_size`: credit is only requested
/// once the current window is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlWindow {
    window_size: u32,
    credit_remaining: u32,
}

impl FlowControlWindow {
    /// A full window as announced by the peer's header.
    pub fn new(window_size: u16) -> Self {
        let window_size = u32::from(window_size);
        Self { window_size, credit_remaining: window_size }
    }

    /// Window size announced by the peer.
    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    /// Bytes that may be sent before more credit is needed.
    pub fn credit_remaining(&self) -> u32 {
        self.credit_remaining
    }

    /// Whether the sender must wait for credit.
    pub fn is_exhausted(&self) -> bool {
        self.credit_remaining == 0
    }

    /// Apply a credit grant from the peer.
    pub fn grant(&mut self) {
        self.credit_remaining = (self.credit_remaining + self.window_size).min(self.window_size);
    }

    /// Reserve up to `wanted` bytes of credit, returning how many may be sent.
    pub fn consume(&mut self, wanted: usize) -> usize {
        let n = u32::try_from(wanted).unwrap_or(u32::MAX).min(self.credit_remaining);
        self.credit_remaining -= n;
        n as usize
    }
}

/// Next action for the driver of a [`PasteUpload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UploadStep {
    /// Write this range of the payload. Credit is already deducted.
    Send(Range<usize>),
    /// Read one byte from the peer and hand it to `on_peer_byte`.
    AwaitCredit,
    /// Payload fully sent; write end-of-transmission and await the ack.
    Finished,
}

/// Upload progress over one payload.
#[derive(Debug)]
pub(crate) struct PasteUpload<'a> {
    payload: &'a [u8],
    cursor: usize,
    window: FlowControlWindow,
}

impl<'a> PasteUpload<'a> {
    /// Start an upload from the two header bytes.
    ///
    /// A zero window can never be replenished, so it is treated as the peer
    /// closing the window immediately.
    pub(crate) fn new(payload: &'a [u8], header: [u8; 2]) -> Result<Self, UploadError> {
        let window = FlowControlWindow::new(u16::from_le_bytes(header));
        if window.window_size() == 0 {
            return Err(UploadError::PeerAborted);
        }
        Ok(Self { payload, cursor: 0, window })
    }

    pub(crate) fn window(&self) -> &FlowControlWindow {
        &self.window
    }

    pub(crate) fn next_step(&mut self) -> UploadStep {
        let remaining = self.payload.len() - self.cursor;
        if remaining == 0 {
            return UploadStep::Finished;
        }
        if self.window.is_exhausted() {
            return UploadStep::AwaitCredit;
        }
        let n = self.window.consume(remaining);
        let range = self.cursor..self.cursor + n;
        self.cursor += n;
        UploadStep::Send(range)
    }

    pub(crate) fn on_peer_byte(&mut self, byte: u8) -> Result<(), UploadError> {
        match byte {
            CREDIT => {
                self.window.grant();
                Ok(())
            }
            WINDOW_CLOSED => Err(UploadError::PeerAborted),
            other => Err(UploadError::UnexpectedByte(other)),
        }
    }

    pub(crate) fn chunk(&self, range: Range<usize>) -> &'a [u8] {
        &self.payload[range]
    }
}

/// Classify a byte received while waiting for the end-of-transmission ack.
///
/// Returns `Ok(true)` on the ack, `Ok(false)` for a late credit grant that
/// can be skipped.
fn ack_byte(byte: u8, received: &mut Vec<u8>) -> Result<bool, UploadError> {
    match byte {
        END_OF_TRANSMISSION => Ok(true),
        CREDIT => Ok(false),
        other => {
            received.push(other);
            Err(UploadError::NotAcknowledged { received: std::mem::take(received) })
        }
    }
}

fn credit_error(e: TransportError) -> UploadError {
    match e {
        TransportError::Timeout => UploadError::CreditTimeout,
        e => UploadError::Transport(e),
    }
}

fn ack_error(e: TransportError, received: Vec<u8>) -> UploadError {
    match e {
        TransportError::Timeout => UploadError::NotAcknowledged { received },
        e => UploadError::Transport(e),
    }
}

/// Upload `payload` over a blocking transport.
///
/// Call right after the peer answered `R\x01`; the two header bytes are read
/// here. On success the peer has acknowledged the whole payload.
pub fn upload<T: Transport + ?Sized>(
    payload: &[u8],
    transport: &mut T,
    credit_timeout: Duration,
    ack_timeout: Duration,
) -> Result<(), UploadError> {
    let header = transport
        .read_exact(2, credit_timeout)
        .map_err(|e| credit_error(e.error))?;
    let mut upload = match PasteUpload::new(payload, [header[0], header[1]]) {
        Ok(upload) => upload,
        Err(e) => {
            transport.write_all(&[END_OF_TRANSMISSION])?;
            return Err(e);
        }
    };
    log::trace!("Raw paste: window {} for {} bytes", upload.window().window_size(), payload.len());

    loop {
        match upload.next_step() {
            UploadStep::Send(range) => transport.write_all(upload.chunk(range))?,
            UploadStep::AwaitCredit => {
                let byte = transport.read_byte(credit_timeout).map_err(credit_error)?;
                if let Err(e) = upload.on_peer_byte(byte) {
                    if matches!(e, UploadError::PeerAborted) {
                        transport.write_all(&[END_OF_TRANSMISSION])?;
                    }
                    return Err(e);
                }
            }
            UploadStep::Finished => break,
        }
    }

    transport.write_all(&[END_OF_TRANSMISSION])?;
    let mut received = Vec::new();
    loop {
        let byte = transport
            .read_byte(ack_timeout)
            .map_err(|e| ack_error(e, std::mem::take(&mut received)))?;
        if ack_byte(byte, &mut received)? {
            return Ok(());
        }
    }
}

/// Upload `payload` over an async transport. Same contract as [`upload`].
pub async fn upload_async<T: AsyncTransport + ?Sized>(
    payload: &[u8],
    transport: &mut T,
    credit_timeout: Duration,
    ack_timeout: Duration,
) -> Result<(), UploadError> {
    let header = transport
        .read_exact(2, credit_timeout)
        .await
        .map_err(|e| credit_error(e.error))?;
    let mut upload = match PasteUpload::new(payload, [header[0], header[1]]) {
        Ok(upload) => upload,
        Err(e) => {
            transport.write_all(&[END_OF_TRANSMISSION]).await?;
            return Err(e);
        }
    };
    log::trace!("Raw paste: window {} for {} bytes", upload.window().window_size(), payload.len());

    loop {
        match upload.next_step() {
            UploadStep::Send(range) => transport.write_all(upload.chunk(range)).await?,
            UploadStep::AwaitCredit => {
                let byte = transport.read_byte(credit_timeout).await.map_err(credit_error)?;
                if let Err(e) = upload.on_peer_byte(byte) {
                    if matches!(e, UploadError::PeerAborted) {
                        transport.write_all(&[END_OF_TRANSMISSION]).await?;
                    }
                    return Err(e);
                }
            }
            UploadStep::Finished => break,
        }
    }

    transport.write_all(&[END_OF_TRANSMISSION]).await?;
    let mut received = Vec::new();
    loop {
        let byte = transport
            .read_byte(ack_timeout)
            .await
            .map_err(|e| ack_error(e, std::mem::take(&mut received)))?;
        if ack_byte(byte, &mut received)? {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::{FakeDevice, PasteMode};

    const T: Duration = Duration::from_millis(50);

    fn header(window: u16) -> [u8; 2] {
        window.to_le_bytes()
    }

    #[test]
    fn test_window_never_exceeds_size() {
        let mut w = FlowControlWindow::new(8);
        assert_eq!(w.consume(5), 5);
        w.grant();
        assert_eq!(w.credit_remaining(), 8);
        assert_eq!(w.consume(100), 8);
        assert!(w.is_exhausted());
        assert_eq!(w.consume(1), 0);
    }

    #[test]
    fn test_steps_respect_credit() {
        for window in [1u16, 3, 32] {
            for len in [0usize, 1, 31, 32, 33, 64, 100, 257] {
                let payload = vec![b'x'; len];
                let mut up = PasteUpload::new(&payload, header(window)).unwrap();
                let mut sent = 0;
                loop {
                    let credit_before = up.window().credit_remaining();
                    match up.next_step() {
                        UploadStep::Send(range) => {
                            assert!(credit_before > 0, "sent with no credit");
                            assert!(range.len() <= credit_before as usize);
                            assert_eq!(range.start, sent);
                            sent = range.end;
                        }
                        UploadStep::AwaitCredit => {
                            assert_eq!(credit_before, 0);
                            up.on_peer_byte(CREDIT).unwrap();
                        }
                        UploadStep::Finished => break,
                    }
                }
                assert_eq!(sent, len, "window {window} len {len}");
            }
        }
    }

    #[test]
    fn test_zero_window_is_peer_abort() {
        assert!(matches!(
            PasteUpload::new(b"code", header(0)),
            Err(UploadError::PeerAborted)
        ));
    }

    #[test]
    fn test_unexpected_byte_while_waiting() {
        let mut up = PasteUpload::new(b"ab", header(1)).unwrap();
        assert_eq!(up.next_step(), UploadStep::Send(0..1));
        assert_eq!(up.next_step(), UploadStep::AwaitCredit);
        assert!(matches!(up.on_peer_byte(b'?'), Err(UploadError::UnexpectedByte(b'?'))));
    }

    fn paste_device(window: u16) -> FakeDevice {
        let mut device = FakeDevice::new(PasteMode::Supported(window));
        device.enter_paste_directly();
        device
    }

    #[test]
    fn test_upload_against_device() {
        for len in [0usize, 1, 31, 32, 33, 96, 200] {
            let payload: Vec<u8> = (0..len).map(|i| b'a' + (i % 26) as u8).collect();
            let mut device = paste_device(32);
            upload(&payload, &mut device, T, T).unwrap();
            assert_eq!(device.pasted(), payload.as_slice());
            assert!(!device.overrun(), "sender exceeded granted credit");
            assert!(device.paste_writes().iter().all(|&n| n <= 32));
        }
    }

    #[test]
    fn test_upload_zero_window_does_not_hang() {
        let mut device = paste_device(0);
        let started = std::time::Instant::now();
        let err = upload(b"print(1)", &mut device, T, T).unwrap_err();
        assert!(matches!(err, UploadError::PeerAborted));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_upload_peer_abort_is_acknowledged() {
        let mut device = paste_device(4);
        device.abort_paste_after(4);
        let err = upload(b"0123456789", &mut device, T, T).unwrap_err();
        assert!(matches!(err, UploadError::PeerAborted));
        assert_eq!(device.written().last(), Some(&END_OF_TRANSMISSION));
    }

    #[test]
    fn test_upload_without_credit_times_out() {
        let mut device = paste_device(4);
        device.withhold_credit();
        let err = upload(b"0123456789", &mut device, T, T).unwrap_err();
        assert!(matches!(err, UploadError::CreditTimeout));
    }

    #[tokio::test]
    async fn test_upload_async_against_device() {
        let payload = vec![b'z'; 100];
        let mut device = paste_device(16);
        upload_async(&payload, &mut device, T, T).await.unwrap();
        assert_eq!(device.pasted(), payload.as_slice());
        assert!(!device.overrun());
    }
}

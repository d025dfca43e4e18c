//! File-descriptor endpoint for serial lines and PTY masters.
//!
//! The fd is always non-blocking. The blocking path waits with `libc::poll`
//! and then reads; the async path registers the same fd with tokio through
//! [`AsyncFd`] the first time it is used, so one `FdStream` can serve either
//! scheduling model.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;

use super::{AsyncTransport, InputBuffer, Transport};
use crate::constants::{COPY_BUFFER_SIZE, WRITE_TIMEOUT};
use crate::error::TransportError;

/// Non-blocking fd wrapped as a [`Transport`] and [`AsyncTransport`].
#[derive(Debug)]
pub struct FdStream {
    // Declared before `fd` so the registration is dropped before the close.
    async_fd: Option<AsyncFd<RawFd>>,
    fd: Option<OwnedFd>,
    input: InputBuffer,
    label: String,
}

impl FdStream {
    /// Wrap an already-open fd, switching it to non-blocking mode.
    pub fn from_owned(fd: OwnedFd, label: impl Into<String>) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            async_fd: None,
            fd: Some(fd),
            input: InputBuffer::default(),
            label: label.into(),
        })
    }

    /// Open a serial device in raw 8N1 mode at `baud`.
    pub fn open_serial(path: &Path, baud: u32) -> io::Result<Self> {
        use std::os::unix::ffi::OsStrExt;

        let speed = baud_to_speed(baud).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("Unsupported baud rate {baud}"))
        })?;
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        // SAFETY: `c_path` is a valid NUL-terminated string for the duration of the call.
        let raw = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `open` succeeded, so `raw` is a fresh fd owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        configure_termios(fd.as_raw_fd(), Some(speed))?;
        log::debug!("Opened serial device {} at {} baud", path.display(), baud);
        Self::from_owned(fd, path.display().to_string())
    }

    /// Put the terminal behind this fd into raw mode (no echo, no line
    /// discipline, no signal characters).
    pub fn make_raw(&self) -> io::Result<()> {
        let fd = self.fd.as_ref().ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        configure_termios(fd.as_raw_fd(), None)
    }

    /// Human-readable name of the endpoint.
    pub fn label(&self) -> &str {
        &self.label
    }

    fn raw_fd(&self) -> Result<RawFd, TransportError> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd).ok_or(TransportError::Closed)
    }

    fn registered(&mut self) -> Result<&AsyncFd<RawFd>, TransportError> {
        let fd = self.raw_fd()?;
        if self.async_fd.is_none() {
            self.async_fd = Some(AsyncFd::new(fd)?);
        }
        self.async_fd.as_ref().ok_or(TransportError::Closed)
    }

    fn shutdown(&mut self) {
        if self.fd.is_some() {
            log::debug!("Closing {}", self.label);
        }
        self.async_fd = None;
        self.fd = None;
        self.input.clear();
    }

    fn settle(
        &mut self,
        result: Result<usize, TransportError>,
        chunk: &[u8],
        buf: &mut [u8],
    ) -> Result<usize, TransportError> {
        match result {
            Ok(n) => {
                self.input.extend(&chunk[..n]);
                Ok(self.input.take_into(buf))
            }
            Err(e) => {
                if e.is_fatal() {
                    self.shutdown();
                }
                Err(e)
            }
        }
    }
}

impl Transport for FdStream {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        if !self.input.is_empty() {
            return Ok(self.input.take_into(buf));
        }
        let fd = self.raw_fd()?;
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; COPY_BUFFER_SIZE];
        let result = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match poll_fd(fd, libc::POLLIN, remaining) {
                Ok(true) => {}
                Ok(false) => break Err(TransportError::Timeout),
                Err(e) => break Err(e.into()),
            }
            match read_raw(fd, &mut chunk) {
                Ok(0) => break Err(TransportError::Closed),
                Ok(n) => break Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if remaining.is_zero() {
                        break Err(TransportError::Timeout);
                    }
                }
                Err(e) => break Err(map_fd_error(e)),
            }
        };
        self.settle(result, &chunk, buf)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let fd = self.raw_fd()?;
        let mut written = 0;
        while written < data.len() {
            match write_raw(fd, &data[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !poll_fd(fd, libc::POLLOUT, WRITE_TIMEOUT)? {
                        return Err(TransportError::Timeout);
                    }
                }
                Err(e) => {
                    let e = map_fd_error(e);
                    if e.is_fatal() {
                        self.shutdown();
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.shutdown();
    }

    fn is_closed(&self) -> bool {
        self.fd.is_none()
    }
}

#[async_trait]
impl AsyncTransport for FdStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if !self.input.is_empty() {
            return Ok(self.input.take_into(buf));
        }
        let mut chunk = [0u8; COPY_BUFFER_SIZE];
        let result = match self.registered() {
            Ok(async_fd) => loop {
                let mut guard = match async_fd.readable().await {
                    Ok(guard) => guard,
                    Err(e) => break Err(e.into()),
                };
                match guard.try_io(|inner| read_raw(*inner.get_ref(), &mut chunk)) {
                    Ok(Ok(0)) => break Err(TransportError::Closed),
                    Ok(Ok(n)) => break Ok(n),
                    Ok(Err(e)) => break Err(map_fd_error(e)),
                    Err(_would_block) => continue,
                }
            },
            Err(e) => Err(e),
        };
        self.settle(result, &chunk, buf)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut written = 0;
        let result = match self.registered() {
            Ok(async_fd) => loop {
                if written >= data.len() {
                    break Ok(());
                }
                let mut guard = match async_fd.writable().await {
                    Ok(guard) => guard,
                    Err(e) => break Err(e.into()),
                };
                match guard.try_io(|inner| write_raw(*inner.get_ref(), &data[written..])) {
                    Ok(Ok(n)) => written += n,
                    Ok(Err(e)) => break Err(map_fd_error(e)),
                    Err(_would_block) => continue,
                }
            },
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            if e.is_fatal() {
                self.shutdown();
            }
        }
        result
    }

    async fn close(&mut self) {
        self.shutdown();
    }

    fn is_closed(&self) -> bool {
        self.fd.is_none()
    }
}

// ============================================================================
// libc helpers
// ============================================================================

/// Wait until `fd` is ready for `events` or `timeout` passes.
///
/// Returns `Ok(true)` on readiness, including hang-up and error conditions,
/// so the following read or write reports them.
pub(crate) fn poll_fd(fd: RawFd, events: libc::c_short, timeout: Duration) -> io::Result<bool> {
    let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    let mut pollfd = libc::pollfd { fd, events, revents: 0 };
    loop {
        // SAFETY: `pollfd` is a single valid, initialized pollfd struct.
        let ready = unsafe { libc::poll(&mut pollfd, 1, millis) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(ready > 0);
    }
}

/// One `read(2)` call; `EAGAIN` surfaces as `WouldBlock`.
fn read_raw(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// One `write(2)` call; `EAGAIN` surfaces as `WouldBlock`.
fn write_raw(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    // SAFETY: `data` is valid for reads of `data.len()` bytes.
    let n = unsafe { libc::write(fd, data.as_ptr().cast::<libc::c_void>(), data.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// A PTY master reports `EIO` once the slave side has no process left.
fn map_fd_error(e: io::Error) -> TransportError {
    if e.raw_os_error() == Some(libc::EIO) {
        TransportError::Closed
    } else {
        e.into()
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFL on an fd we own has no memory-safety requirements.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above, F_SETFL only updates the fd's status flags.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Raw mode, optionally with a line speed for real serial devices.
fn configure_termios(fd: RawFd, speed: Option<libc::speed_t>) -> io::Result<()> {
    // SAFETY: termios is a plain C struct; all-zero is a valid value to fill in.
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };
    // SAFETY: `tio` is a valid termios out-parameter.
    if unsafe { libc::tcgetattr(fd, &mut tio) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `tio` was initialized by tcgetattr above.
    unsafe { libc::cfmakeraw(&mut tio) };
    if let Some(speed) = speed {
        tio.c_cflag |= libc::CLOCAL | libc::CREAD;
        // SAFETY: `tio` is initialized; the speed constant comes from libc.
        unsafe {
            libc::cfsetispeed(&mut tio, speed);
            libc::cfsetospeed(&mut tio, speed);
        }
    }
    // SAFETY: `tio` is a fully initialized termios struct.
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn baud_to_speed(baud: u32) -> Option<libc::speed_t> {
    let speed = match baud {
        1200 => libc::B1200,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        #[cfg(target_os = "linux")]
        460_800 => libc::B460800,
        #[cfg(target_os = "linux")]
        921_600 => libc::B921600,
        _ => return None,
    };
    Some(speed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (FdStream, FdStream) {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: `pipe` writes exactly two valid FDs into `fds` on success.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe failed");
        // SAFETY: both fds were just created and are owned by nobody else.
        let (r, w) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        (
            FdStream::from_owned(r, "pipe-read").unwrap(),
            FdStream::from_owned(w, "pipe-write").unwrap(),
        )
    }

    #[test]
    fn test_blocking_read_times_out_without_closing() {
        let (mut reader, _writer) = pipe_pair();
        let err = Transport::read(&mut reader, &mut [0u8; 8], Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
        assert!(!Transport::is_closed(&reader));
    }

    #[test]
    fn test_blocking_round_trip_keeps_bytes_after_marker() {
        let (mut reader, mut writer) = pipe_pair();
        Transport::write_all(&mut writer, b"OK>tail").unwrap();
        let head = Transport::read_until(&mut reader, b">", Duration::from_secs(1), None).unwrap();
        assert_eq!(head, b"OK>");
        let tail = Transport::read_exact(&mut reader, 4, Duration::from_secs(1)).unwrap();
        assert_eq!(tail, b"tail");
    }

    #[test]
    fn test_eof_is_closed() {
        let (mut reader, mut writer) = pipe_pair();
        Transport::close(&mut writer);
        assert!(Transport::is_closed(&writer));
        let err = Transport::read(&mut reader, &mut [0u8; 8], Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert!(Transport::is_closed(&reader));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut reader, _writer) = pipe_pair();
        Transport::close(&mut reader);
        Transport::close(&mut reader);
        assert!(matches!(
            Transport::write_all(&mut reader, b"x"),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_async_round_trip() {
        let (mut reader, mut writer) = pipe_pair();
        AsyncTransport::write_all(&mut writer, b"hello\x04").await.unwrap();
        let data = AsyncTransport::read_until(&mut reader, b"\x04", Duration::from_secs(1), None)
            .await
            .unwrap();
        assert_eq!(data, b"hello\x04");
    }

    #[tokio::test]
    async fn test_async_read_byte_times_out() {
        let (mut reader, _writer) = pipe_pair();
        let err = AsyncTransport::read_byte(&mut reader, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }

    #[test]
    fn test_baud_table() {
        assert_eq!(baud_to_speed(115_200), Some(libc::B115200));
        assert_eq!(baud_to_speed(12_345), None);
    }
}

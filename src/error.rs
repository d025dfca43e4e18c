//! Error types shared by transports, the Raw-REPL engine and the uploader.
//!
//! Errors carry the protocol [`Phase`] they occurred in so callers can decide
//! between retrying `enter`, reconnecting, or giving up on the session.

use std::fmt;

/// Errors raised by a byte-stream endpoint.
#[derive(Debug)]
pub enum TransportError {
    /// The fd or socket is gone. Fatal for this transport.
    Closed,
    /// No byte arrived before the deadline. The transport stays usable.
    Timeout,
    /// Underlying OS error.
    Io(std::io::Error),
    /// The PTY child died without a reset having been requested.
    ProcessExitedUnexpectedly {
        /// Exit code reported by the child, if it exited normally.
        status: Option<u32>,
    },
}

impl TransportError {
    /// Whether the transport can no longer be used.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Timeout)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Transport closed"),
            Self::Timeout => write!(f, "Transport read timed out"),
            Self::Io(e) => write!(f, "Transport I/O error: {e}"),
            Self::ProcessExitedUnexpectedly { status: Some(code) } => {
                write!(f, "Interpreter process exited unexpectedly (status {code})")
            }
            Self::ProcessExitedUnexpectedly { status: None } => {
                write!(f, "Interpreter process exited unexpectedly")
            }
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof => Self::Closed,
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::Timeout,
            _ => Self::Io(e),
        }
    }
}

/// Protocol step an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Entering raw REPL.
    Enter,
    /// Leaving raw REPL.
    Exit,
    /// Submitting code.
    Exec,
    /// Collecting stdout/stderr of a submitted program.
    Follow,
    /// Raw-paste upload.
    Upload,
    /// Evaluating an expression.
    Eval,
    /// Waiting for a soft reset to complete.
    SoftReset,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Enter => "enter",
            Self::Exit => "exit",
            Self::Exec => "exec",
            Self::Follow => "follow",
            Self::Upload => "upload",
            Self::Eval => "eval",
            Self::SoftReset => "soft reset",
        };
        f.write_str(name)
    }
}

/// Raw-REPL state machine errors.
#[derive(Debug)]
pub enum ProtocolError {
    /// Expected marker not seen in time. Recoverable: retry `enter`.
    Timeout {
        /// Phase that was waiting.
        phase: Phase,
        /// Bytes that did arrive before the deadline.
        received: Vec<u8>,
    },
    /// The peer answered with something the protocol does not allow here.
    Unexpected {
        /// Phase that received the bytes.
        phase: Phase,
        /// The offending bytes.
        received: Vec<u8>,
    },
    /// The transport failed underneath the protocol.
    Transport {
        /// Phase that was running.
        phase: Phase,
        /// Transport failure.
        source: TransportError,
    },
}

impl ProtocolError {
    /// Phase the error occurred in.
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            Self::Timeout { phase, .. }
            | Self::Unexpected { phase, .. }
            | Self::Transport { phase, .. } => *phase,
        }
    }

    /// Map a transport failure, turning read deadlines into protocol timeouts.
    pub(crate) fn from_transport(phase: Phase, source: TransportError, received: Vec<u8>) -> Self {
        match source {
            TransportError::Timeout => Self::Timeout { phase, received },
            source => Self::Transport { phase, source },
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { phase, received } => write!(
                f,
                "Timed out during {phase} (received {:?})",
                String::from_utf8_lossy(received)
            ),
            Self::Unexpected { phase, received } => write!(
                f,
                "Unexpected response during {phase}: {:?}",
                String::from_utf8_lossy(received)
            ),
            Self::Transport { phase, source } => write!(f, "Transport failed during {phase}: {source}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Raw-paste flow-control failures. The transport remains usable.
#[derive(Debug)]
pub enum UploadError {
    /// The peer closed the window (or offered a zero-size one).
    PeerAborted,
    /// The end-of-transmission acknowledgement did not arrive.
    NotAcknowledged {
        /// Bytes received instead of the acknowledgement.
        received: Vec<u8>,
    },
    /// A byte other than a credit grant or window close arrived.
    UnexpectedByte(u8),
    /// No credit arrived while the window was exhausted.
    CreditTimeout,
    /// The transport failed mid-upload.
    Transport(TransportError),
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerAborted => write!(f, "Upload aborted by peer"),
            Self::NotAcknowledged { received } => write!(
                f,
                "Upload not acknowledged (received {:?})",
                String::from_utf8_lossy(received)
            ),
            Self::UnexpectedByte(b) => write!(f, "Unexpected byte 0x{b:02x} during upload"),
            Self::CreditTimeout => write!(f, "Timed out waiting for upload credit"),
            Self::Transport(e) => write!(f, "Transport failed during upload: {e}"),
        }
    }
}

impl std::error::Error for UploadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for UploadError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Errors surfaced by `exec` and `eval`.
#[derive(Debug)]
pub enum ExecError {
    /// The peer raised an exception. `stderr` is passed through verbatim.
    Raised {
        /// Output printed before the exception.
        stdout: Vec<u8>,
        /// Exception text exactly as the peer reported it.
        stderr: Vec<u8>,
    },
    /// Framing or prompt failure.
    Protocol(ProtocolError),
    /// Raw-paste upload failure.
    Upload(UploadError),
    /// `eval` output was not a Python literal.
    Parse(String),
}

impl ExecError {
    /// Phase the error occurred in.
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            Self::Raised { .. } => Phase::Follow,
            Self::Protocol(e) => e.phase(),
            Self::Upload(_) => Phase::Upload,
            Self::Parse(_) => Phase::Eval,
        }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raised { stderr, .. } => write!(f, "{}", String::from_utf8_lossy(stderr).trim_end()),
            Self::Protocol(e) => write!(f, "{e}"),
            Self::Upload(e) => write!(f, "{e}"),
            Self::Parse(msg) => write!(f, "Could not parse eval result: {msg}"),
        }
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(e) => Some(e),
            Self::Upload(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for ExecError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<UploadError> for ExecError {
    fn from(e: UploadError) -> Self {
        Self::Upload(e)
    }
}

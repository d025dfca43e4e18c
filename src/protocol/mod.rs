//! Raw-REPL protocol: wire bytes, prompt markers and the engine state machine.
//!
//! The engine exists twice, once per scheduling model:
//!
//! - [`RawReplEngine`] drives a blocking [`Transport`](crate::transport::Transport)
//! - [`AsyncRawReplEngine`] drives an [`AsyncTransport`](crate::transport::AsyncTransport)
//!
//! Everything that does not touch I/O (reply classification, response
//! framing, flow-control accounting) lives here or in [`flow_control`] and is
//! shared by both, so the two engines only differ in where they `.await`.
//!
//! # Session shape
//!
//! ```text
//! Friendly --enter--> EnteringRaw --prompt--> Raw --exit--> ExitingRaw --> Friendly
//!                                              |  ^
//!                                        exec  v  | ack
//!                                          RawPasteUpload
//! ```

pub mod engine;
pub mod engine_async;
pub mod flow_control;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

pub use self::engine::RawReplEngine;
pub use self::engine_async::AsyncRawReplEngine;
pub use self::flow_control::FlowControlWindow;
pub use self::value::Value;

use crate::constants;
use crate::error::ExecError;

/// Control bytes written to the peer.
pub mod control {
    /// Interrupt whatever is running (Ctrl-C twice).
    pub const INTERRUPT: &[u8] = b"\r\x03\x03";
    /// Enter raw REPL (Ctrl-A).
    pub const RAW_ENTER: &[u8] = b"\r\x01";
    /// Leave raw REPL (Ctrl-B).
    pub const RAW_EXIT: &[u8] = b"\r\x02";
    /// Soft reset; also ends a raw-REPL code block (Ctrl-D).
    pub const RESET: u8 = 0x04;
    /// Ask to switch to raw-paste upload.
    pub const RAW_PASTE_REQUEST: &[u8] = b"\x05A\x01";
    /// Separates stdout from stderr and terminates a response.
    pub const SENTINEL: u8 = 0x04;
    /// Raw paste: the peer grants another window of credit.
    pub const CREDIT: u8 = 0x01;
    /// Raw paste: the peer closes the window early.
    pub const WINDOW_CLOSED: u8 = 0x04;
    /// Raw paste: end of the uploaded payload.
    pub const END_OF_TRANSMISSION: u8 = 0x04;
    /// Ctrl-A as a single byte.
    pub const CTRL_A: u8 = 0x01;
    /// Ctrl-B as a single byte.
    pub const CTRL_B: u8 = 0x02;
    /// Ctrl-C as a single byte.
    pub const CTRL_C: u8 = 0x03;
}

/// Text the peer prints at protocol transitions.
pub mod marker {
    /// Banner printed on entering raw REPL, without the trailing prompt.
    pub const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n";
    /// Banner plus the raw prompt.
    pub const RAW_PROMPT: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";
    /// Tail of the raw prompt, used when the start may have been consumed.
    pub const RAW_PROMPT_TAIL: &[u8] = b"w REPL; CTRL-B to exit\r\n>";
    /// Printed when a soft reset starts.
    pub const SOFT_REBOOT: &[u8] = b"soft reboot\r\n";
    /// Interactive prompt.
    pub const FRIENDLY_PROMPT: &[u8] = b">>> ";
    /// Raw prompt.
    pub const PROMPT: &[u8] = b">";
    /// Code accepted in plain raw mode.
    pub const EXEC_OK: &[u8] = b"OK";
    /// Raw paste accepted; a window header follows.
    pub const PASTE_SUPPORTED: &[u8] = b"R\x01";
    /// Raw paste understood but unavailable.
    pub const PASTE_UNSUPPORTED: &[u8] = b"R\x00";
}

/// Where the peer currently is in the Raw-REPL session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RawReplState {
    /// Interactive `>>> ` prompt.
    #[default]
    Friendly,
    /// Raw-enter written, waiting for the banner.
    EnteringRaw,
    /// Raw REPL, ready for code.
    Raw,
    /// A raw-paste upload is in flight.
    RawPasteUpload,
    /// Raw-exit written, waiting for the interactive prompt.
    ExitingRaw,
}

/// What we know about raw-paste support on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PasteSupport {
    /// Not probed yet.
    #[default]
    Unknown,
    /// The peer accepted a raw-paste request.
    Supported,
    /// The peer refused or did not understand. Never retried.
    Unsupported,
}

/// Interpretation of the two bytes that answer a raw-paste request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PasteReply {
    /// `R\x01`: a window header follows.
    Accepted,
    /// `R\x00`: fall back to chunked writes.
    Refused,
    /// Anything else: old firmware that re-printed the raw prompt.
    NotUnderstood,
}

pub(crate) fn classify_paste_reply(reply: &[u8]) -> PasteReply {
    if reply == marker::PASTE_SUPPORTED {
        PasteReply::Accepted
    } else if reply == marker::PASTE_UNSUPPORTED {
        PasteReply::Refused
    } else {
        PasteReply::NotUnderstood
    }
}

/// Client-side deadlines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Overall deadline for `enter`.
    pub enter: Duration,
    /// Inactivity deadline while waiting for a prompt or response.
    pub read: Duration,
    /// Deadline for `exit` to see the interactive prompt.
    pub exit: Duration,
    /// Deadline for the raw-paste end-of-transmission acknowledgement.
    pub paste_ack: Duration,
    /// Deadline for each credit grant while the window is exhausted.
    pub paste_credit: Duration,
    /// Quiet period that ends the input drain in `enter`.
    pub drain_quiet: Duration,
    /// Gap between fallback chunks.
    pub chunk_delay: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            enter: constants::ENTER_TIMEOUT,
            read: constants::EXEC_TIMEOUT,
            exit: constants::EXIT_TIMEOUT,
            paste_ack: constants::PASTE_ACK_TIMEOUT,
            paste_credit: constants::PASTE_CREDIT_TIMEOUT,
            drain_quiet: constants::DRAIN_QUIET_PERIOD,
            chunk_delay: constants::FALLBACK_CHUNK_DELAY,
        }
    }
}

/// Drop the sentinel that `read_until` leaves at the end of a response part.
pub(crate) fn strip_sentinel(mut part: Vec<u8>) -> Vec<u8> {
    if part.last() == Some(&control::SENTINEL) {
        part.pop();
    }
    part
}

/// Turn a framed response into the `exec` result.
pub(crate) fn exec_result(
    stdout: Vec<u8>,
    stderr: Vec<u8>,
) -> Result<(Vec<u8>, Vec<u8>), ExecError> {
    if stderr.is_empty() {
        Ok((stdout, stderr))
    } else {
        Err(ExecError::Raised { stdout, stderr })
    }
}

/// Code that prints the `repr` of an expression.
pub(crate) fn eval_source(expr: &str) -> Vec<u8> {
    format!("print(repr({expr}))").into_bytes()
}

/// Parse the output of [`eval_source`].
pub(crate) fn eval_result(stdout: &[u8]) -> Result<Value, ExecError> {
    let text = std::str::from_utf8(stdout).map_err(|e| ExecError::Parse(e.to_string()))?;
    Value::parse(text.trim_end_matches(['\r', '\n'])).map_err(ExecError::Parse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_paste_reply() {
        assert_eq!(classify_paste_reply(b"R\x01"), PasteReply::Accepted);
        assert_eq!(classify_paste_reply(b"R\x00"), PasteReply::Refused);
        assert_eq!(classify_paste_reply(b"ra"), PasteReply::NotUnderstood);
    }

    #[test]
    fn test_strip_sentinel() {
        assert_eq!(strip_sentinel(b"hi\n\x04".to_vec()), b"hi\n");
        assert_eq!(strip_sentinel(b"\x04".to_vec()), b"");
        assert_eq!(strip_sentinel(b"no sentinel".to_vec()), b"no sentinel");
    }

    #[test]
    fn test_exec_result_raises_on_stderr() {
        assert!(exec_result(b"out".to_vec(), Vec::new()).is_ok());
        let err = exec_result(Vec::new(), b"Traceback".to_vec()).unwrap_err();
        assert!(matches!(err, ExecError::Raised { .. }));
    }

    #[test]
    fn test_eval_round_trip_text() {
        assert_eq!(eval_source("1+1"), b"print(repr(1+1))");
        assert_eq!(eval_result(b"2\r\n").unwrap(), Value::Int(2));
        assert!(matches!(eval_result(b"<object>\n"), Err(ExecError::Parse(_))));
    }
}

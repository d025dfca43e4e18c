//! Blocking Raw-REPL engine.

use std::fmt;
use std::time::{Duration, Instant};

use super::control::{INTERRUPT, RAW_ENTER, RAW_EXIT, RAW_PASTE_REQUEST, RESET, SENTINEL};
use super::flow_control;
use super::marker::{
    EXEC_OK, FRIENDLY_PROMPT, PROMPT, RAW_BANNER, RAW_PROMPT, RAW_PROMPT_TAIL, SOFT_REBOOT,
};
use super::{
    classify_paste_reply, eval_result, eval_source, exec_result, strip_sentinel, PasteReply,
    PasteSupport, RawReplState, Timeouts, Value,
};
use crate::constants::FALLBACK_CHUNK_SIZE;
use crate::error::{ExecError, Phase, ProtocolError, TransportError};
use crate::transport::Transport;

/// Raw-REPL state machine over a blocking transport.
///
/// The engine owns its transport for its whole life. `exec`/`eval` are the
/// only operations higher-level tools (file copy, directory listing) need.
pub struct RawReplEngine<T: Transport = Box<dyn Transport>> {
    transport: T,
    state: RawReplState,
    paste: PasteSupport,
    timeouts: Timeouts,
}

impl<T: Transport> fmt::Debug for RawReplEngine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawReplEngine")
            .field("state", &self.state)
            .field("paste", &self.paste)
            .field("closed", &self.transport.is_closed())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> RawReplEngine<T> {
    /// Wrap a transport. The peer is assumed to be at the friendly prompt.
    pub fn new(transport: T) -> Self {
        Self::with_timeouts(transport, Timeouts::default())
    }

    /// Wrap a transport with custom deadlines.
    pub fn with_timeouts(transport: T, timeouts: Timeouts) -> Self {
        Self {
            transport,
            state: RawReplState::Friendly,
            paste: PasteSupport::Unknown,
            timeouts,
        }
    }

    /// Current protocol state.
    pub fn state(&self) -> RawReplState {
        self.state
    }

    /// What is known about raw-paste support.
    pub fn paste_support(&self) -> PasteSupport {
        self.paste
    }

    /// The underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give the transport back.
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Close the transport. The engine is unusable afterwards.
    pub fn close(&mut self) {
        self.transport.close();
        self.state = RawReplState::Friendly;
    }

    /// Enter raw REPL, optionally soft-resetting the peer first.
    ///
    /// Leaves the raw prompt `>` unread; `exec` consumes it.
    pub fn enter(&mut self, soft_reset: bool) -> Result<(), ProtocolError> {
        self.state = RawReplState::EnteringRaw;
        let result = self.enter_inner(soft_reset);
        self.state = if result.is_ok() { RawReplState::Raw } else { RawReplState::Friendly };
        result
    }

    fn enter_inner(&mut self, soft_reset: bool) -> Result<(), ProtocolError> {
        let deadline = Instant::now() + self.timeouts.enter;
        self.write(Phase::Enter, INTERRUPT)?;
        let dropped = self
            .transport
            .drain(self.timeouts.drain_quiet)
            .map_err(|source| ProtocolError::Transport { phase: Phase::Enter, source })?;
        if dropped > 0 {
            log::trace!("Discarded {dropped} stale bytes before raw REPL");
        }
        self.write(Phase::Enter, RAW_ENTER)?;

        if soft_reset {
            self.expect(RAW_PROMPT, Phase::Enter, deadline)?;
            self.write(Phase::SoftReset, &[RESET])?;
            // Boot output may appear between these two markers.
            self.expect(SOFT_REBOOT, Phase::SoftReset, deadline)?;
        }
        self.expect(RAW_BANNER, Phase::Enter, deadline)?;
        Ok(())
    }

    /// Leave raw REPL and wait for the interactive prompt.
    ///
    /// A timeout is not fatal; `enter` can be retried.
    pub fn exit(&mut self) -> Result<(), ProtocolError> {
        self.state = RawReplState::ExitingRaw;
        self.write(Phase::Exit, RAW_EXIT)?;
        let deadline = Instant::now() + self.timeouts.exit;
        self.expect(FRIENDLY_PROMPT, Phase::Exit, deadline)?;
        self.state = RawReplState::Friendly;
        Ok(())
    }

    /// Run `code` and return `(stdout, stderr)`.
    ///
    /// Enters raw REPL first if needed. A non-empty stderr is returned as
    /// [`ExecError::Raised`] with the text untouched.
    pub fn exec(
        &mut self,
        code: &[u8],
        timeout: Duration,
    ) -> Result<(Vec<u8>, Vec<u8>), ExecError> {
        self.exec_raw_no_follow(code)?;
        let (stdout, stderr) = self.follow(timeout, None)?;
        exec_result(stdout, stderr)
    }

    /// Evaluate a Python expression and parse its `repr`.
    pub fn eval(&mut self, expr: &str) -> Result<Value, ExecError> {
        let timeout = self.timeouts.read;
        let (stdout, _) = self.exec(&eval_source(expr), timeout)?;
        eval_result(&stdout)
    }

    /// Submit `code` without waiting for it to finish.
    ///
    /// Uses raw paste when the peer supports it, chunked writes otherwise.
    pub fn exec_raw_no_follow(&mut self, code: &[u8]) -> Result<(), ExecError> {
        if self.state == RawReplState::Friendly {
            self.enter(false)?;
        }
        let deadline = Instant::now() + self.timeouts.read;
        self.expect(PROMPT, Phase::Exec, deadline)?;

        if self.paste != PasteSupport::Unsupported {
            self.write(Phase::Exec, RAW_PASTE_REQUEST)?;
            let reply = self
                .transport
                .read_exact(2, self.timeouts.read)
                .map_err(|e| e.into_protocol(Phase::Exec))?;
            match classify_paste_reply(&reply) {
                PasteReply::Accepted => {
                    self.paste = PasteSupport::Supported;
                    self.state = RawReplState::RawPasteUpload;
                    let result = flow_control::upload(
                        code,
                        &mut self.transport,
                        self.timeouts.paste_credit,
                        self.timeouts.paste_ack,
                    );
                    self.state = RawReplState::Raw;
                    return result.map_err(ExecError::from);
                }
                PasteReply::Refused => {
                    log::debug!("Peer refused raw paste; using chunked writes");
                }
                PasteReply::NotUnderstood => {
                    log::debug!("Peer predates raw paste; using chunked writes");
                    let deadline = Instant::now() + self.timeouts.read;
                    self.expect(RAW_PROMPT_TAIL, Phase::Exec, deadline)?;
                }
            }
            self.paste = PasteSupport::Unsupported;
        }

        for chunk in code.chunks(FALLBACK_CHUNK_SIZE) {
            self.write(Phase::Upload, chunk)?;
            std::thread::sleep(self.timeouts.chunk_delay);
        }
        self.write(Phase::Exec, &[RESET])?;
        let ack = self
            .transport
            .read_exact(2, self.timeouts.read)
            .map_err(|e| e.into_protocol(Phase::Exec))?;
        if ack != EXEC_OK {
            return Err(ProtocolError::Unexpected { phase: Phase::Exec, received: ack }.into());
        }
        Ok(())
    }

    /// Collect the response of submitted code: `(stdout, stderr)`.
    ///
    /// `timeout` is an inactivity deadline. With a `consumer`, stdout is
    /// streamed to it as it arrives and the returned stdout is empty.
    pub fn follow(
        &mut self,
        timeout: Duration,
        consumer: Option<&mut (dyn for<'a> FnMut(&'a [u8]) + Send)>,
    ) -> Result<(Vec<u8>, Vec<u8>), ProtocolError> {
        let streaming = consumer.is_some();
        let stdout = self
            .transport
            .read_until(&[SENTINEL], timeout, consumer)
            .map_err(|e| e.into_protocol(Phase::Follow))?;
        let stderr = self
            .transport
            .read_until(&[SENTINEL], timeout, None)
            .map_err(|e| e.into_protocol(Phase::Follow))?;
        let stdout = if streaming { Vec::new() } else { strip_sentinel(stdout) };
        Ok((stdout, strip_sentinel(stderr)))
    }

    fn write(&mut self, phase: Phase, data: &[u8]) -> Result<(), ProtocolError> {
        self.transport
            .write_all(data)
            .map_err(|source| ProtocolError::Transport { phase, source })
    }

    /// Read until `marker` or the overall `deadline`.
    fn expect(
        &mut self,
        marker: &[u8],
        phase: Phase,
        deadline: Instant,
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut received = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.transport.read_byte(remaining) {
                Ok(byte) => {
                    received.push(byte);
                    if received.ends_with(marker) {
                        return Ok(received);
                    }
                }
                Err(TransportError::Timeout) => {
                    return Err(ProtocolError::Timeout { phase, received });
                }
                Err(source) => return Err(ProtocolError::Transport { phase, source }),
            }
        }
    }
}

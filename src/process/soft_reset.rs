//! Soft-reset emulation for interpreter processes.
//!
//! A real board answers a bare Ctrl-D at an empty prompt with a soft reboot.
//! An interpreter process reads it as end of input and exits, which would
//! end the session instead. [`SoftResetEmulator`] sits on the write path,
//! keeps the reset byte away from the child, restarts it, and replays the
//! output a board would have printed.
//!
//! Ctrl-D also ends a raw-REPL code block and a raw-paste upload, so
//! [`ResetClassifier`] watches both directions to tell the cases apart.

use std::time::Duration;

use async_trait::async_trait;

use super::session::ProcessSession;
use super::spawn::SessionConfig;
use crate::error::TransportError;
use crate::protocol::control::{CTRL_A, CTRL_B, CTRL_C, RAW_PASTE_REQUEST, RESET};
use crate::protocol::marker::{EXEC_OK, FRIENDLY_PROMPT, PASTE_UNSUPPORTED, RAW_PROMPT};
use crate::transport::{AsyncTransport, Transport};

/// Printed in place of the child's exit.
const REBOOT_NOTICE: &[u8] = b"MPY: soft reboot\r\n";

/// Longest marker the classifier has to recognise across reads.
const TAIL_LEN: usize = 32;

/// What to do with one outbound write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Pass the bytes to the child unchanged.
    Forward(Vec<u8>),
    /// A soft reset request. Nothing goes to the child.
    InterceptedReset,
}

/// Tracks just enough REPL state to tell a reset request from other uses of
/// Ctrl-D.
#[derive(Debug, Default)]
pub struct ResetClassifier {
    raw: bool,
    paste_active: bool,
    pending_input: bool,
    request_progress: usize,
    tail: Vec<u8>,
}

impl ResetClassifier {
    /// Whether the child is believed to be in raw REPL.
    pub fn in_raw_mode(&self) -> bool {
        self.raw
    }

    /// Whether a raw-paste upload is in flight.
    pub fn paste_active(&self) -> bool {
        self.paste_active
    }

    /// Classify a chunk written toward the child.
    ///
    /// A chunk is a reset when it is a lone Ctrl-D (line endings aside), no
    /// raw-paste upload is running and nothing was typed since the last
    /// prompt.
    pub fn classify(&mut self, data: &[u8]) -> Outbound {
        let mut meaningful = data.iter().filter(|&&b| b != b'\r' && b != b'\n');
        let lone_reset = meaningful.next() == Some(&RESET) && meaningful.next().is_none();
        if lone_reset && !self.paste_active && !self.pending_input {
            return Outbound::InterceptedReset;
        }
        for &byte in data {
            self.observe_outbound_byte(byte);
        }
        Outbound::Forward(data.to_vec())
    }

    fn observe_outbound_byte(&mut self, byte: u8) {
        if self.paste_active {
            if byte == RESET {
                self.paste_active = false;
                self.pending_input = false;
            }
            return;
        }

        if byte == RAW_PASTE_REQUEST[self.request_progress] {
            self.request_progress += 1;
            if self.request_progress == RAW_PASTE_REQUEST.len() {
                self.request_progress = 0;
                self.paste_active = true;
                self.pending_input = false;
                return;
            }
        } else {
            self.request_progress = usize::from(byte == RAW_PASTE_REQUEST[0]);
        }

        match byte {
            CTRL_A | CTRL_C | RESET => self.pending_input = false,
            CTRL_B => {
                self.raw = false;
                self.pending_input = false;
            }
            b'\r' | b'\n' => {}
            _ => self.pending_input = true,
        }
    }

    /// Feed bytes the child produced.
    pub fn observe_inbound(&mut self, data: &[u8]) {
        for &byte in data {
            self.tail.push(byte);
            if self.tail.len() > TAIL_LEN {
                self.tail.remove(0);
            }
            if self.tail.ends_with(RAW_PROMPT) {
                self.raw = true;
                self.pending_input = false;
            } else if self.tail.ends_with(FRIENDLY_PROMPT) {
                self.raw = false;
                self.pending_input = false;
            } else if self.raw && self.tail.ends_with(b"\x04>") {
                self.pending_input = false;
            } else if self.paste_active && self.tail.ends_with(PASTE_UNSUPPORTED) {
                self.paste_active = false;
            }
        }
    }

    /// Forget transient state after the child was replaced.
    fn after_restart(&mut self) {
        self.paste_active = false;
        self.pending_input = false;
        self.request_progress = 0;
        self.tail.clear();
    }
}

/// [`ProcessSession`] wrapper that turns reset requests into restarts.
#[derive(Debug)]
pub struct SoftResetEmulator {
    session: ProcessSession,
    classifier: ResetClassifier,
    resets: usize,
}

impl SoftResetEmulator {
    /// Wrap a not-yet-started session.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            session: ProcessSession::new(config),
            classifier: ResetClassifier::default(),
            resets: 0,
        }
    }

    /// Spawn the child. A failed spawn is retried once.
    pub fn start(&mut self) -> Result<(), TransportError> {
        self.classifier = ResetClassifier::default();
        start_with_retry(&mut self.session)
    }

    /// The wrapped session.
    pub fn session(&self) -> &ProcessSession {
        &self.session
    }

    /// PID of the current child.
    pub fn pid(&self) -> Option<u32> {
        self.session.pid()
    }

    /// Whether a child is running.
    pub fn is_running(&self) -> bool {
        self.session.is_running()
    }

    /// Number of soft resets emulated so far.
    pub fn resets(&self) -> usize {
        self.resets
    }

    /// Stop the child, two-phase.
    pub fn terminate(&mut self) {
        self.session.terminate();
    }

    /// [`terminate`](Self::terminate) for async callers.
    pub async fn terminate_async(&mut self) {
        self.session.terminate_async().await;
    }

    fn banner_timeout(&self) -> Duration {
        self.session.config().banner_timeout
    }

    fn begin_reset(&mut self) -> bool {
        self.resets += 1;
        let raw = self.classifier.in_raw_mode();
        log::info!(
            "[SoftReset] Intercepted reset #{} ({} mode), restarting child",
            self.resets,
            if raw { "raw" } else { "friendly" }
        );
        if raw {
            self.session.push_pending(EXEC_OK);
        }
        self.session.push_pending(REBOOT_NOTICE);
        raw
    }

    fn soft_reset(&mut self) -> Result<(), TransportError> {
        let raw = self.begin_reset();
        if let Err(e) = self.session.restart() {
            log::warn!("[SoftReset] Restart failed, retrying once: {e:#}");
            self.session.start().map_err(restart_failed)?;
        }
        self.classifier.after_restart();
        if !raw {
            return Ok(());
        }

        let timeout = self.banner_timeout();
        let stream = self.session.stream_mut()?;
        match Transport::read_until(stream, FRIENDLY_PROMPT, timeout, None) {
            Ok(_) => {}
            Err(e) if !e.error.is_fatal() => {
                log::warn!("[SoftReset] No banner from restarted child within {timeout:?}");
            }
            Err(e) => return Err(e.error),
        }
        Transport::write_all(stream, &[CTRL_A])?;
        Transport::read_until(stream, RAW_PROMPT, timeout, None).map_err(|e| e.error)?;
        self.finish_reset();
        Ok(())
    }

    async fn soft_reset_async(&mut self) -> Result<(), TransportError> {
        let raw = self.begin_reset();
        if let Err(e) = self.session.restart_async().await {
            log::warn!("[SoftReset] Restart failed, retrying once: {e:#}");
            self.session.start().map_err(restart_failed)?;
        }
        self.classifier.after_restart();
        if !raw {
            return Ok(());
        }

        let timeout = self.banner_timeout();
        let stream = self.session.stream_mut()?;
        match AsyncTransport::read_until(stream, FRIENDLY_PROMPT, timeout, None).await {
            Ok(_) => {}
            Err(e) if !e.error.is_fatal() => {
                log::warn!("[SoftReset] No banner from restarted child within {timeout:?}");
            }
            Err(e) => return Err(e.error),
        }
        AsyncTransport::write_all(stream, &[CTRL_A]).await?;
        AsyncTransport::read_until(stream, RAW_PROMPT, timeout, None)
            .await
            .map_err(|e| e.error)?;
        self.finish_reset();
        Ok(())
    }

    /// The restarted child is at the raw prompt; hand the prompt to the reader.
    fn finish_reset(&mut self) {
        self.session.push_pending(RAW_PROMPT);
        self.classifier.observe_inbound(RAW_PROMPT);
        log::debug!("[SoftReset] Child {:?} back in raw REPL", self.session.pid());
    }
}

fn start_with_retry(session: &mut ProcessSession) -> Result<(), TransportError> {
    match session.start() {
        Ok(()) => Ok(()),
        Err(first) => {
            log::warn!("[Process] Spawn failed, retrying once: {first:#}");
            session.start().map_err(|e| {
                log::error!("[Process] Spawn failed: {e:#}");
                TransportError::Io(std::io::Error::other(format!("{e:#}")))
            })
        }
    }
}

/// A reset whose retry also failed leaves no child behind.
fn restart_failed(e: anyhow::Error) -> TransportError {
    log::error!("[SoftReset] Restart retry failed: {e:#}");
    TransportError::ProcessExitedUnexpectedly { status: None }
}

impl Transport for SoftResetEmulator {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let n = Transport::read(&mut self.session, buf, timeout)?;
        self.classifier.observe_inbound(&buf[..n]);
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        match self.classifier.classify(data) {
            Outbound::Forward(bytes) => Transport::write_all(&mut self.session, &bytes),
            Outbound::InterceptedReset => self.soft_reset(),
        }
    }

    fn close(&mut self) {
        Transport::close(&mut self.session);
    }

    fn is_closed(&self) -> bool {
        Transport::is_closed(&self.session)
    }
}

#[async_trait]
impl AsyncTransport for SoftResetEmulator {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = AsyncTransport::read(&mut self.session, buf).await?;
        self.classifier.observe_inbound(&buf[..n]);
        Ok(n)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        match self.classifier.classify(data) {
            Outbound::Forward(bytes) => AsyncTransport::write_all(&mut self.session, &bytes).await,
            Outbound::InterceptedReset => self.soft_reset_async().await,
        }
    }

    async fn close(&mut self) {
        AsyncTransport::close(&mut self.session).await;
    }

    fn is_closed(&self) -> bool {
        AsyncTransport::is_closed(&self.session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_classifier() -> ResetClassifier {
        let mut c = ResetClassifier::default();
        c.observe_inbound(b"MicroPython\r\n>>> ");
        assert_eq!(c.classify(b"\r\x01"), Outbound::Forward(b"\r\x01".to_vec()));
        c.observe_inbound(RAW_PROMPT);
        assert!(c.in_raw_mode());
        c
    }

    #[test]
    fn test_lone_reset_at_prompt_is_intercepted() {
        let mut c = raw_classifier();
        assert_eq!(c.classify(b"\x04"), Outbound::InterceptedReset);
        assert_eq!(c.classify(b"\r\n\x04"), Outbound::InterceptedReset);
    }

    #[test]
    fn test_end_of_code_is_forwarded() {
        let mut c = raw_classifier();
        c.classify(b"print('hi')");
        assert_eq!(c.classify(b"\x04"), Outbound::Forward(vec![RESET]));
        c.observe_inbound(b"OKhi\r\n\x04\x04>");
        assert_eq!(c.classify(b"\x04"), Outbound::InterceptedReset);
    }

    #[test]
    fn test_code_with_reset_in_one_chunk_is_forwarded() {
        let mut c = raw_classifier();
        assert!(matches!(c.classify(b"x=1\x04"), Outbound::Forward(_)));
    }

    #[test]
    fn test_end_of_paste_is_forwarded() {
        let mut c = raw_classifier();
        c.classify(b"\x05A\x01");
        assert!(c.paste_active());
        c.observe_inbound(b"R\x01\x80\x00");
        assert_eq!(c.classify(b"\x04"), Outbound::Forward(vec![RESET]));
        assert!(!c.paste_active());
    }

    #[test]
    fn test_paste_request_split_across_writes() {
        let mut c = raw_classifier();
        c.classify(b"\x05");
        c.classify(b"A\x01");
        assert!(c.paste_active());
    }

    #[test]
    fn test_refused_paste_clears_flag() {
        let mut c = raw_classifier();
        c.classify(b"\x05A\x01");
        c.observe_inbound(b"R\x00");
        assert!(!c.paste_active());
    }

    #[test]
    fn test_friendly_mode_tracking() {
        let mut c = raw_classifier();
        c.classify(b"\r\x02");
        assert!(!c.in_raw_mode());
        c.observe_inbound(b"\r\n>>> ");
        assert_eq!(c.classify(b"\x04"), Outbound::InterceptedReset);
    }

    #[test]
    fn test_emulator_restarts_cat() {
        let config = SessionConfig::new("cat").grace(Duration::from_millis(200));
        let mut emulator = SoftResetEmulator::new(config);
        emulator.start().unwrap();
        let before = emulator.pid();
        Transport::write_all(&mut emulator, b"\x04").unwrap();
        assert_eq!(emulator.resets(), 1);
        assert!(emulator.is_running());
        assert_ne!(emulator.pid(), before);
        let notice =
            Transport::read_until(&mut emulator, b"\r\n", Duration::from_secs(1), None).unwrap();
        assert_eq!(notice, REBOOT_NOTICE);
        assert!(notice.ends_with(crate::protocol::marker::SOFT_REBOOT));
    }

    #[test]
    fn test_failed_restart_is_retried_once() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("interp.sh");
        std::fs::write(&script, "#!/bin/sh\nexec cat\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = SessionConfig::new(script.to_string_lossy()).grace(Duration::from_millis(200));
        let mut emulator = SoftResetEmulator::new(config);
        emulator.start().unwrap();
        assert_eq!(emulator.session().spawn_attempts(), 1);

        std::fs::remove_file(&script).unwrap();
        let err = Transport::write_all(&mut emulator, b"\x04").unwrap_err();
        assert!(matches!(err, TransportError::ProcessExitedUnexpectedly { status: None }));
        // Initial spawn, the restart, and exactly one retry.
        assert_eq!(emulator.session().spawn_attempts(), 3);
        assert!(!emulator.is_running());
    }
}

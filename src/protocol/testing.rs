//! Scripted in-memory device for engine and uploader tests.
//!
//! Emulates the peer side of the Raw-REPL protocol closely enough to drive
//! every engine path: friendly and raw modes, soft reset, raw-paste with a
//! configurable window, refused raw-paste, and firmware that predates it.
//! Reads never block: an empty output queue reads as a timeout.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;

use super::marker;
use crate::error::TransportError;
use crate::transport::{AsyncTransport, Transport};

/// How the device answers a raw-paste request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PasteMode {
    /// `R\x01` followed by this window size.
    Supported(u16),
    /// `R\x00`.
    Refused,
    /// No raw-paste at all; the request just resets the raw prompt.
    NotUnderstood,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Friendly,
    Raw,
    Paste,
    PasteAborted,
}

const FRIENDLY_BANNER: &[u8] = b"\r\nMicroPython fake; test device\r\nType \"help()\" for more information.\r\n>>> ";

#[derive(Debug)]
pub(crate) struct FakeDevice {
    paste_mode: PasteMode,
    mode: Mode,
    code: Vec<u8>,
    output: VecDeque<u8>,
    written: Vec<u8>,
    responses: Vec<(Vec<u8>, Vec<u8>, Vec<u8>)>,
    resets: usize,
    closed: bool,

    // Raw-paste bookkeeping for the current upload.
    pasted: Vec<u8>,
    in_window: u32,
    credits_sent: u32,
    overrun: bool,
    paste_writes: Vec<usize>,
    abort_after: Option<usize>,
    withhold_credit: bool,
}

impl FakeDevice {
    pub(crate) fn new(paste_mode: PasteMode) -> Self {
        Self {
            paste_mode,
            mode: Mode::Friendly,
            code: Vec::new(),
            output: VecDeque::new(),
            written: Vec::new(),
            responses: Vec::new(),
            resets: 0,
            closed: false,
            pasted: Vec::new(),
            in_window: 0,
            credits_sent: 0,
            overrun: false,
            paste_writes: Vec::new(),
            abort_after: None,
            withhold_credit: false,
        }
    }

    /// Register the output for a piece of code.
    pub(crate) fn respond(&mut self, code: &str, stdout: &[u8], stderr: &[u8]) {
        self.responses.push((code.as_bytes().to_vec(), stdout.to_vec(), stderr.to_vec()));
    }

    /// Skip straight to an accepted raw-paste request with the header queued.
    pub(crate) fn enter_paste_directly(&mut self) {
        let PasteMode::Supported(window) = self.paste_mode else {
            panic!("enter_paste_directly needs PasteMode::Supported");
        };
        self.start_paste();
        self.output.extend(window.to_le_bytes());
    }

    /// Close the window after `n` pasted bytes.
    pub(crate) fn abort_paste_after(&mut self, n: usize) {
        self.abort_after = Some(n);
    }

    /// Never grant more credit.
    pub(crate) fn withhold_credit(&mut self) {
        self.withhold_credit = true;
    }

    /// Queue unsolicited output, as if a program were still printing.
    pub(crate) fn push_output(&mut self, bytes: &[u8]) {
        self.output.extend(bytes);
    }

    pub(crate) fn pasted(&self) -> &[u8] {
        &self.pasted
    }

    pub(crate) fn overrun(&self) -> bool {
        self.overrun
    }

    pub(crate) fn paste_writes(&self) -> &[usize] {
        &self.paste_writes
    }

    pub(crate) fn written(&self) -> &[u8] {
        &self.written
    }

    pub(crate) fn resets(&self) -> usize {
        self.resets
    }

    pub(crate) fn in_raw_mode(&self) -> bool {
        self.mode == Mode::Raw
    }

    fn window(&self) -> u32 {
        match self.paste_mode {
            PasteMode::Supported(w) => u32::from(w),
            _ => 0,
        }
    }

    fn start_paste(&mut self) {
        self.mode = Mode::Paste;
        self.code.clear();
        self.pasted.clear();
        self.in_window = 0;
        self.credits_sent = 0;
        self.paste_writes.clear();
    }

    fn execute(&mut self, code: &[u8]) {
        let (stdout, stderr) = self
            .responses
            .iter()
            .find(|(c, _, _)| c == code)
            .map(|(_, out, err)| (out.clone(), err.clone()))
            .unwrap_or_default();
        self.output.extend(stdout);
        self.output.push_back(0x04);
        self.output.extend(stderr);
        self.output.push_back(0x04);
        self.output.push_back(b'>');
    }

    fn soft_reset(&mut self) {
        self.resets += 1;
        self.code.clear();
        self.output.extend(b"MPY: soft reboot\r\n");
    }

    fn feed(&mut self, byte: u8) {
        match self.mode {
            Mode::Friendly => match byte {
                0x01 => {
                    self.mode = Mode::Raw;
                    self.code.clear();
                    self.output.extend(marker::RAW_PROMPT);
                }
                0x03 => self.output.extend(b"\r\n>>> "),
                0x04 => {
                    self.soft_reset();
                    self.output.extend(FRIENDLY_BANNER);
                }
                other => self.output.push_back(other),
            },
            Mode::Raw => match byte {
                0x01 => {
                    let is_paste_request = self.code == b"\x05A";
                    self.code.clear();
                    match (is_paste_request, self.paste_mode) {
                        (true, PasteMode::Supported(window)) => {
                            self.output.extend(marker::PASTE_SUPPORTED);
                            self.output.extend(window.to_le_bytes());
                            self.start_paste();
                        }
                        (true, PasteMode::Refused) => self.output.extend(marker::PASTE_UNSUPPORTED),
                        _ => self.output.extend(marker::RAW_PROMPT),
                    }
                }
                0x02 => {
                    self.mode = Mode::Friendly;
                    self.code.clear();
                    self.output.extend(FRIENDLY_BANNER);
                }
                0x03 => self.code.clear(),
                0x04 if self.code.is_empty() => {
                    self.output.extend(b"OK");
                    self.soft_reset();
                    self.output.extend(marker::RAW_PROMPT);
                }
                0x04 => {
                    let code = std::mem::take(&mut self.code);
                    self.output.extend(b"OK");
                    self.execute(&code);
                }
                other => self.code.push(other),
            },
            Mode::Paste => {
                if byte == 0x04 {
                    self.output.push_back(0x04);
                    self.mode = Mode::Raw;
                    let code = self.pasted.clone();
                    self.execute(&code);
                    return;
                }
                self.pasted.push(byte);
                let allowance = self.window() * (1 + self.credits_sent);
                if self.pasted.len() > allowance as usize {
                    self.overrun = true;
                }
                self.in_window += 1;
                if self.abort_after == Some(self.pasted.len()) {
                    self.output.push_back(0x04);
                    self.mode = Mode::PasteAborted;
                } else if self.in_window == self.window() && !self.withhold_credit {
                    self.output.push_back(0x01);
                    self.credits_sent += 1;
                    self.in_window = 0;
                }
            }
            Mode::PasteAborted => {
                if byte == 0x04 {
                    self.mode = Mode::Raw;
                }
            }
        }
    }

    fn pop_into(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut n = 0;
        while n < buf.len() {
            let Some(byte) = self.output.pop_front() else { break };
            buf[n] = byte;
            n += 1;
        }
        if n == 0 {
            Err(TransportError::Timeout)
        } else {
            Ok(n)
        }
    }

    fn accept(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.written.extend_from_slice(data);
        let before = self.pasted.len();
        let was_pasting = self.mode == Mode::Paste;
        for &byte in data {
            self.feed(byte);
        }
        if was_pasting && self.pasted.len() > before {
            self.paste_writes.push(self.pasted.len() - before);
        }
        Ok(())
    }
}

impl Transport for FakeDevice {
    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        self.pop_into(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.accept(data)
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl AsyncTransport for FakeDevice {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.pop_into(buf)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.accept(data)
    }

    async fn close(&mut self) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

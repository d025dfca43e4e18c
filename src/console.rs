//! Interactive terminal attached to a device.
//!
//! The local terminal is put into raw mode and every key is forwarded to
//! the device as the byte sequence a serial terminal would send. Device
//! output is written straight to stdout (and optionally teed to a capture
//! file).
//!
//! Reserved keys:
//!
//! - `Ctrl-]` or `Ctrl-X` leaves the console
//! - `Ctrl-J` sends the configured code snippet
//! - `Ctrl-K` runs the configured file through the raw REPL

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tokio::sync::mpsc;

use crate::constants::COPY_BUFFER_SIZE;
use crate::error::{ExecError, TransportError};
use crate::protocol::AsyncRawReplEngine;
use crate::transport::AsyncTransport;

/// How often the keyboard thread checks whether the console has ended.
const KEY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Options for [`run`].
#[derive(Debug, Clone, Default)]
pub struct ConsoleOptions {
    /// Code sent verbatim on `Ctrl-J`.
    pub inject_code: Option<String>,
    /// File executed through the raw REPL on `Ctrl-K`.
    pub inject_file: Option<PathBuf>,
    /// Render bytes outside printable ASCII as `[xx]`.
    pub escape_non_printable: bool,
    /// Copy of everything the device prints.
    pub capture: Option<PathBuf>,
}

/// One decoded keyboard action.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Bytes(Vec<u8>),
    Exit,
    InjectCode,
    InjectFile,
}

/// What the main loop does after a `select!` round.
enum Step {
    Continue,
    Exit,
    InjectFile(PathBuf),
}

/// Run the console until the user exits or the device goes away.
pub async fn run(mut device: Box<dyn AsyncTransport>, options: ConsoleOptions) -> Result<()> {
    let mut capture = match &options.capture {
        Some(path) => Some(
            File::create(path)
                .with_context(|| format!("Failed to create capture file {}", path.display()))?,
        ),
        None => None,
    };

    eprintln!("Connected. Ctrl-] or Ctrl-X to exit.\r");
    enable_raw_mode().context("Failed to enable raw terminal mode")?;
    scopeguard::defer! {
        let _ = disable_raw_mode();
    }

    let (tx, mut rx) = mpsc::channel(64);
    let keyboard = KeyboardThread::spawn(move |stop| read_keys(&tx, &stop));

    let mut stdout = std::io::stdout();
    let mut buf = [0u8; COPY_BUFFER_SIZE];
    loop {
        let step = tokio::select! {
            input = rx.recv() => match input {
                None | Some(Input::Exit) => Step::Exit,
                Some(Input::Bytes(bytes)) => {
                    device.write_all(&bytes).await?;
                    Step::Continue
                }
                Some(Input::InjectCode) => {
                    match &options.inject_code {
                        Some(code) => device.write_all(code.as_bytes()).await?,
                        None => log::debug!("Ctrl-J pressed but no inject code configured"),
                    }
                    Step::Continue
                }
                Some(Input::InjectFile) => match &options.inject_file {
                    Some(path) => Step::InjectFile(path.clone()),
                    None => {
                        log::debug!("Ctrl-K pressed but no inject file configured");
                        Step::Continue
                    }
                },
            },

            result = device.read(&mut buf) => match result {
                Ok(n) => {
                    stdout.write_all(&render(&buf[..n], options.escape_non_printable))?;
                    stdout.flush()?;
                    if let Some(file) = capture.as_mut() {
                        file.write_all(&buf[..n])?;
                    }
                    Step::Continue
                }
                Err(
                    e @ (TransportError::Closed | TransportError::ProcessExitedUnexpectedly { .. }),
                ) => {
                    eprint!("\r\n{e}\r\n");
                    Step::Exit
                }
                Err(e) => return Err(e.into()),
            },
        };

        match step {
            Step::Continue => {}
            Step::Exit => break,
            Step::InjectFile(path) => {
                device = inject_file(device, &path, &mut stdout).await?;
            }
        }
    }

    device.close().await;
    drop(rx);
    keyboard.join();
    Ok(())
}

/// Run `path` through the raw REPL, streaming its output, then return to
/// the friendly prompt.
async fn inject_file(
    device: Box<dyn AsyncTransport>,
    path: &Path,
    stdout: &mut std::io::Stdout,
) -> Result<Box<dyn AsyncTransport>> {
    let code = std::fs::read(path)
        .with_context(|| format!("Failed to read inject file {}", path.display()))?;
    let mut engine = AsyncRawReplEngine::new(device);

    let result: Result<(), ExecError> = async {
        engine.enter(false).await?;
        engine.exec_raw_no_follow(&code).await?;
        let mut echo = |chunk: &[u8]| {
            let _ = stdout.write_all(chunk);
            let _ = stdout.flush();
        };
        let (_, stderr) = engine.follow(crate::constants::EXEC_TIMEOUT, Some(&mut echo)).await?;
        if !stderr.is_empty() {
            let _ = stdout.write_all(&stderr);
        }
        engine.exit().await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        log::warn!("Inject file {} failed: {e}", path.display());
        let _ = write!(stdout, "\r\n{e}\r\n");
        let _ = stdout.flush();
        if engine.state() != crate::protocol::RawReplState::Friendly {
            if let Err(e) = engine.exit().await {
                log::warn!("Could not leave raw REPL after inject: {e}");
            }
        }
    }
    Ok(engine.into_inner())
}

/// Thread reading keys; crossterm's reader blocks.
///
/// Dropping the handle tells the thread to stop, so an early return from
/// [`run`] cannot leave it polling the terminal.
struct KeyboardThread {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl KeyboardThread {
    fn spawn(body: impl FnOnce(Arc<AtomicBool>) + Send + 'static) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || body(flag));
        Self { stop, handle: Some(handle) }
    }

    /// Stop the thread and wait for it. The key channel's receiver must be
    /// gone first, or a blocked send keeps the thread alive.
    fn join(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("Keyboard thread panicked");
            }
        }
    }
}

impl Drop for KeyboardThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn read_keys(tx: &mpsc::Sender<Input>, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        match event::poll(KEY_POLL_INTERVAL) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                log::warn!("Keyboard poll failed: {e}");
                break;
            }
        }
        let input = match event::read() {
            Ok(Event::Key(key)) => classify_key(key),
            Ok(Event::Paste(text)) => Some(Input::Bytes(text.into_bytes())),
            Ok(_) => None,
            Err(e) => {
                log::warn!("Keyboard read failed: {e}");
                break;
            }
        };
        if let Some(input) = input {
            let exit = input == Input::Exit;
            if tx.blocking_send(input).is_err() || exit {
                break;
            }
        }
    }
}

fn classify_key(key: KeyEvent) -> Option<Input> {
    if key.kind == KeyEventKind::Release {
        return None;
    }
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        match key.code {
            KeyCode::Char(']' | '5' | 'x' | 'X') => return Some(Input::Exit),
            KeyCode::Char('j' | 'J') => return Some(Input::InjectCode),
            KeyCode::Char('k' | 'K') => return Some(Input::InjectFile),
            _ => {}
        }
    }
    key_bytes(key).map(Input::Bytes)
}

/// Bytes a VT100-style serial terminal sends for `key`.
fn key_bytes(key: KeyEvent) -> Option<Vec<u8>> {
    let bytes: &[u8] = match key.code {
        KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::CONTROL) => {
            let c = c.to_ascii_lowercase();
            if !c.is_ascii_lowercase() {
                return None;
            }
            return Some(vec![c as u8 & 0x1f]);
        }
        KeyCode::Char(c) => {
            let mut utf8 = [0u8; 4];
            return Some(c.encode_utf8(&mut utf8).as_bytes().to_vec());
        }
        KeyCode::Enter => b"\r",
        KeyCode::Backspace => b"\x7f",
        KeyCode::Tab => b"\t",
        KeyCode::Esc => b"\x1b",
        KeyCode::Up => b"\x1b[A",
        KeyCode::Down => b"\x1b[B",
        KeyCode::Right => b"\x1b[C",
        KeyCode::Left => b"\x1b[D",
        KeyCode::Home => b"\x1b[H",
        KeyCode::End => b"\x1b[F",
        KeyCode::Delete => b"\x1b[3~",
        KeyCode::PageUp => b"\x1b[5~",
        KeyCode::PageDown => b"\x1b[6~",
        _ => return None,
    };
    Some(bytes.to_vec())
}

/// Prepare device output for the local terminal.
fn render(data: &[u8], escape_non_printable: bool) -> Vec<u8> {
    if !escape_non_printable {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        if matches!(b, b'\x08' | b'\t' | b'\n' | b'\r' | 0x20..=0x7e) {
            out.push(b);
        } else {
            out.extend_from_slice(format!("[{b:02x}]").as_bytes());
        }
    }
    out
}

//! Network bridge that makes the interpreter look like a serial device.
//!
//! Up to two TCP listeners share one [`SoftResetEmulator`]:
//!
//! - the RFC 2217 listener speaks telnet, escaping IAC and answering
//!   COM-PORT-OPTION requests, for tools that expect a virtual serial port
//! - the raw listener passes bytes through untouched
//!
//! Only one client is served at a time. A new connection on either listener
//! displaces the current one: its copy loop is cancelled, both directions
//! end together, and the newcomer takes over the same interpreter.
//!
//! The interpreter is started lazily when the first client arrives so that
//! client sees the banner, and then kept alive across disconnects.

pub mod copy_loop;
pub mod telnet;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use self::copy_loop::CopyEnd;
use crate::config::BridgeConfig;
use crate::process::SoftResetEmulator;

/// Framing of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    /// Telnet with RFC 2217 COM-PORT-OPTION.
    Rfc2217,
    /// Plain bytes.
    RawSocket,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rfc2217 => write!(f, "rfc2217"),
            Self::RawSocket => write!(f, "raw"),
        }
    }
}

/// The connection currently being served.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    /// Connection number, unique for the life of the bridge.
    pub id: u64,
    /// Listener the client arrived on.
    pub kind: ProtocolKind,
    /// Remote address.
    pub peer: SocketAddr,
    cancel: CancellationToken,
}

/// State shared by the accept loops and connection tasks.
#[derive(Debug)]
struct Shared {
    emulator: tokio::sync::Mutex<SoftResetEmulator>,
    active: Mutex<Option<ClientHandle>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Shared {
    /// Make `stream` the active client, displacing any previous one.
    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, kind: ProtocolKind) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        let handle = ClientHandle { id, kind, peer, cancel: cancel.clone() };

        let previous = self.active.lock().expect("client slot lock poisoned").replace(handle);
        if let Some(previous) = previous {
            log::info!(
                "[Bridge] Client {} ({}) displaced by client {id} from {peer}",
                previous.id,
                previous.peer
            );
            previous.cancel.cancel();
        }
        log::info!("[Bridge] Client {id} connected from {peer} ({kind})");

        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[Bridge] Could not set TCP_NODELAY for client {id}: {e}");
        }
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            shared.serve(id, stream, kind, cancel).await;
        });
    }

    async fn serve(&self, id: u64, stream: TcpStream, kind: ProtocolKind, cancel: CancellationToken) {
        let mut emulator = tokio::select! {
            () = cancel.cancelled() => {
                log::debug!("[Bridge] Client {id} displaced before it was served");
                return;
            }
            guard = self.emulator.lock() => guard,
        };

        if !emulator.is_running() {
            if let Err(e) = emulator.start() {
                log::error!("[Bridge] Could not start interpreter for client {id}: {e}");
                self.release(id);
                return;
            }
        }

        match copy_loop::run(stream, &mut *emulator, kind, &cancel).await {
            CopyEnd::Cancelled => log::debug!("[Bridge] Client {id} cancelled"),
            CopyEnd::ClientClosed => log::info!("[Bridge] Client {id} disconnected"),
            CopyEnd::ClientError(e) => log::warn!("[Bridge] Client {id} connection error: {e}"),
            CopyEnd::Device(e) => {
                log::warn!("[Bridge] Interpreter gone while serving client {id}: {e}");
                emulator.terminate_async().await;
            }
        }
        drop(emulator);
        self.release(id);
    }

    /// Clear the slot if `id` still owns it.
    fn release(&self, id: u64) {
        let mut active = self.active.lock().expect("client slot lock poisoned");
        if active.as_ref().is_some_and(|h| h.id == id) {
            *active = None;
        }
    }
}

/// TCP front end for one interpreter.
pub struct BridgeServer {
    shared: Arc<Shared>,
    telnet_addr: Option<SocketAddr>,
    raw_addr: Option<SocketAddr>,
    accept_handles: Vec<JoinHandle<()>>,
}

impl fmt::Debug for BridgeServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeServer")
            .field("telnet_addr", &self.telnet_addr)
            .field("raw_addr", &self.raw_addr)
            .finish_non_exhaustive()
    }
}

impl BridgeServer {
    /// Bind the configured listeners and start accepting.
    ///
    /// Port 0 binds an ephemeral port; see [`telnet_addr`](Self::telnet_addr)
    /// and [`raw_addr`](Self::raw_addr).
    pub async fn start(config: &BridgeConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            emulator: tokio::sync::Mutex::new(SoftResetEmulator::new(config.session_config())),
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        let mut accept_handles = Vec::new();
        let mut telnet_addr = None;
        let mut raw_addr = None;
        for (port, kind, slot) in [
            (config.telnet_port, ProtocolKind::Rfc2217, &mut telnet_addr),
            (config.raw_port, ProtocolKind::RawSocket, &mut raw_addr),
        ] {
            let Some(port) = port else { continue };
            let addr = config.listen_addr(port)?;
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {kind} listener on {addr}"))?;
            let local = listener.local_addr()?;
            log::info!("[Bridge] {kind} listener on {local}");
            accept_handles.push(tokio::spawn(accept_loop(listener, kind, Arc::clone(&shared))));
            *slot = Some(local);
        }

        Ok(Self { shared, telnet_addr, raw_addr, accept_handles })
    }

    /// Bound address of the RFC 2217 listener.
    pub fn telnet_addr(&self) -> Option<SocketAddr> {
        self.telnet_addr
    }

    /// Bound address of the raw listener.
    pub fn raw_addr(&self) -> Option<SocketAddr> {
        self.raw_addr
    }

    /// The client being served, if any.
    pub fn active_client(&self) -> Option<ClientHandle> {
        self.shared.active.lock().expect("client slot lock poisoned").clone()
    }

    /// Stop accepting, cancel the active client and terminate the interpreter.
    pub async fn shutdown(self) {
        log::info!("[Bridge] Shutting down");
        self.shared.shutdown.cancel();
        for handle in self.accept_handles {
            handle.abort();
        }
        let mut emulator = self.shared.emulator.lock().await;
        emulator.terminate_async().await;
    }
}

async fn accept_loop(listener: TcpListener, kind: ProtocolKind, shared: Arc<Shared>) {
    loop {
        let accepted = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => shared.admit(stream, peer, kind),
            Err(e) => {
                log::error!("[Bridge] Accept error on {kind} listener: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
    log::debug!("[Bridge] {kind} accept loop stopped");
}

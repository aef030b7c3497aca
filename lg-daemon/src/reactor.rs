//! Single-threaded event loop
//!
//! One `tokio::select!` multiplexes both listening sockets, the two bound
//! clients, the uevent socket, the housekeeping timer and the shutdown
//! signals. Every handler runs to completion before the next wake-up, so the
//! [`Context`] is only ever touched from here.

use std::fs;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context as _};
use lg_core::constants::ipc::SOCKET_MODE;
use lg_core::{peer_credentials, Context, ProtocolNotifier, ProtocolProcessor, UeventMonitor};
use tokio::io::unix::AsyncFd;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

// ============================================================================
// Client stream
// ============================================================================

/// Non-blocking client socket registered with the reactor
///
/// The protocol endpoints use plain `Read`/`Write`; readiness is awaited on
/// the inner `AsyncFd` before they are called.
pub struct ClientStream(AsyncFd<StdUnixStream>);

impl ClientStream {
    fn new(stream: UnixStream) -> io::Result<Self> {
        // into_std keeps the socket in non-blocking mode
        Ok(Self(AsyncFd::new(stream.into_std()?)?))
    }

    fn fd(&self) -> &AsyncFd<StdUnixStream> {
        &self.0
    }
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.get_mut().read(buf)
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.get_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.get_mut().flush()
    }
}

/// Resolve once `fd` is readable; never resolves for `None`
async fn wait_readable<T: AsRawFd>(fd: Option<&AsyncFd<T>>) -> io::Result<()> {
    match fd {
        Some(fd) => {
            let mut guard = fd.readable().await?;
            guard.clear_ready();
            Ok(())
        }
        None => std::future::pending().await,
    }
}

// ============================================================================
// Sockets
// ============================================================================

/// Bind a world-accessible listening socket, replacing a stale one
pub fn bind_socket(path: &Path) -> anyhow::Result<UnixListener> {
    if let Ok(metadata) = path.symlink_metadata() {
        // Refuse to remove symlinks (prevent symlink attacks)
        if metadata.file_type().is_symlink() {
            bail!("{} is a symlink, refusing to replace it", path.display());
        }
        fs::remove_file(path).with_context(|| format!("removing stale {}", path.display()))?;
        debug!("Removed existing socket file {}", path.display());
    }

    let listener = UnixListener::bind(path).with_context(|| format!("binding {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(SOCKET_MODE))?;
    info!("Listening on {} (mode {:o})", path.display(), SOCKET_MODE);
    Ok(listener)
}

fn remove_socket(path: &Path) {
    match path.symlink_metadata() {
        Ok(m) if m.file_type().is_symlink() => warn!("Not removing symlink {}", path.display()),
        Ok(_) => {
            if let Err(e) = fs::remove_file(path) {
                warn!("Failed to remove socket {}: {}", path.display(), e);
            }
        }
        Err(_) => {}
    }
}

// ============================================================================
// Reactor
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    Request,
    Notify,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Endpoint::Request => "request",
            Endpoint::Notify => "notification",
        })
    }
}

/// What woke the loop up
enum Wake {
    Accepted(Endpoint, io::Result<UnixStream>),
    RequestReadable(io::Result<()>),
    NotifyReadable(io::Result<()>),
    Uevent(io::Result<()>),
    Tick,
    Shutdown(&'static str),
}

pub struct Reactor {
    ctx: Context,
    request_socket: PathBuf,
    notify_socket: PathBuf,
    request_listener: UnixListener,
    notify_listener: UnixListener,
    monitor: Option<AsyncFd<UeventMonitor>>,
    processor: ProtocolProcessor<ClientStream>,
    notifier: ProtocolNotifier<ClientStream>,
}

impl Reactor {
    /// Open the uevent socket and bind both listening sockets
    pub fn new(ctx: Context) -> anyhow::Result<Self> {
        let request_socket = ctx.config().request_socket.clone();
        let notify_socket = ctx.config().notify_socket.clone();

        let monitor = match UeventMonitor::open().and_then(|m| Ok(AsyncFd::new(m)?)) {
            Ok(monitor) => Some(monitor),
            Err(e) => {
                warn!("Hotplug monitoring disabled: {}", e);
                None
            }
        };

        let request_listener = bind_socket(&request_socket)?;
        let notify_listener = match bind_socket(&notify_socket) {
            Ok(listener) => listener,
            Err(e) => {
                remove_socket(&request_socket);
                return Err(e);
            }
        };

        Ok(Self {
            ctx,
            request_socket,
            notify_socket,
            request_listener,
            notify_listener,
            monitor,
            processor: ProtocolProcessor::new(),
            notifier: ProtocolNotifier::new(),
        })
    }

    /// Run until SIGINT/SIGTERM
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        let mut ticker = interval(Duration::from_millis(self.ctx.config().poll_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                r = self.request_listener.accept() => Wake::Accepted(Endpoint::Request, r.map(|(s, _)| s)),
                r = self.notify_listener.accept() => Wake::Accepted(Endpoint::Notify, r.map(|(s, _)| s)),
                r = wait_readable(self.processor.client().map(ClientStream::fd)) => Wake::RequestReadable(r),
                r = wait_readable(self.notifier.client().map(ClientStream::fd)) => Wake::NotifyReadable(r),
                r = wait_readable(self.monitor.as_ref()) => Wake::Uevent(r),
                _ = ticker.tick() => Wake::Tick,
                _ = tokio::signal::ctrl_c() => Wake::Shutdown("SIGINT"),
                _ = sigterm.recv() => Wake::Shutdown("SIGTERM"),
            };

            match wake {
                Wake::Accepted(endpoint, Ok(stream)) => self.accept(endpoint, stream),
                Wake::Accepted(endpoint, Err(e)) => error!("Accept error on {} socket: {}", endpoint, e),
                Wake::RequestReadable(r) => {
                    if let Err(e) = r {
                        warn!("Request client poll failed: {}", e);
                        self.processor.unbind();
                    } else {
                        // errors are logged and the client dropped inside
                        let _ = self.processor.serve_pending(&mut self.ctx);
                    }
                }
                Wake::NotifyReadable(r) => {
                    if let Err(e) = r {
                        warn!("Notification client poll failed: {}", e);
                        self.notifier.unbind();
                    } else {
                        let _ = self.notifier.check_incoming();
                    }
                }
                Wake::Uevent(r) => match r {
                    Ok(()) => self.drain_uevents(),
                    Err(e) => {
                        error!("uevent socket failed, hotplug monitoring disabled: {}", e);
                        self.monitor = None;
                    }
                },
                Wake::Tick => self.ctx.tick(),
                Wake::Shutdown(name) => {
                    info!("SIGNAL: Received {} - initiating shutdown", name);
                    break;
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    fn accept(&mut self, endpoint: Endpoint, stream: UnixStream) {
        match peer_credentials(&stream) {
            Some(cred) => info!(
                "AUDIT: {} connection from uid={}, gid={}, pid={}",
                endpoint, cred.uid, cred.gid, cred.pid
            ),
            None => warn!("AUDIT: {} connection with unknown peer credentials", endpoint),
        }

        let client = match ClientStream::new(stream) {
            Ok(client) => client,
            Err(e) => {
                error!("Cannot register {} client: {}", endpoint, e);
                return;
            }
        };

        let refused = match endpoint {
            Endpoint::Request => self.processor.bind(client).err(),
            Endpoint::Notify => self.notifier.bind(client).err(),
        };
        if let Some(stream) = refused {
            warn!("A {} client is already connected, refusing the new one", endpoint);
            drop(stream);
        }
    }

    fn drain_uevents(&mut self) {
        let Some(monitor) = self.monitor.as_ref() else {
            return;
        };
        let events = match monitor.get_ref().recv_events() {
            Ok(events) => events,
            Err(e) => {
                warn!("Reading uevents: {}", e);
                return;
            }
        };
        if events.is_empty() {
            return;
        }

        for payload in self.ctx.handle_kernel_events(&events) {
            self.notifier.publish(payload);
        }
    }

    fn shutdown(&mut self) {
        debug!("Starting cleanup...");
        self.processor.unbind();
        self.notifier.unbind();
        self.ctx.shutdown();
        remove_socket(&self.request_socket);
        remove_socket(&self.notify_socket);
    }
}

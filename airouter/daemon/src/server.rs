//! Daemon Server Implementation
//!
//! Accepts clients on a Unix socket and routes their requests:
//! - One task per connection, tracked in a `DashMap`
//! - Newline-delimited JSON: one `Request` per line in, one `Response` per
//!   line out, in order
//! - Request lines are bounded; oversize or non-UTF-8 lines get an
//!   `invalidRequest` reply and the connection carries on
//! - A client that half-closes still gets its replies; one that hangs up
//!   cancels its in-flight request
//! - SIGHUP reloads live settings; shutdown stops accepting and aborts
//!   connections
//!
//! ```text
//!                  DaemonServer
//!                       │
//!        ┌──────────────┼──────────────┐
//!        │              │              │
//!     conn-1         conn-2         conn-3
//!   reader → queue → route_until(closed) → writer
//!        │              │              │
//!        └──────────────┴──────────────┘
//!                       │
//!                 RouterRuntime
//! ```

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

use airouter_core::config::{load_settings_from_path, ConfigOverrides};
use airouter_core::{ErrorKind, Request, Response, RouterRuntime};

/// Connection state tracking
struct ConnectionState {
    /// When the connection was established
    connected_at: Instant,
    /// Remote peer UID (from SO_PEERCRED)
    peer_uid: Option<u32>,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Server limits
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Requests a connection may queue before reads pause
    pub request_queue_capacity: usize,
    /// Longest accepted request line in bytes
    pub max_line_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            request_queue_capacity: 32,
            max_line_bytes: 1024 * 1024,
        }
    }
}

/// The main daemon server
pub struct DaemonServer {
    socket_path: PathBuf,
    /// Config file re-read on reload
    config_path: Option<PathBuf>,
    /// CLI overrides re-applied on reload
    overrides: ConfigOverrides,
    server_config: ServerConfig,
    runtime: Arc<RouterRuntime>,
    connection_states: Arc<DashMap<u64, ConnectionState>>,
    next_connection: AtomicU64,
}

impl DaemonServer {
    /// Create a new daemon server
    pub fn new(
        socket_path: PathBuf,
        config_path: Option<PathBuf>,
        overrides: ConfigOverrides,
        runtime: Arc<RouterRuntime>,
    ) -> Self {
        Self {
            socket_path,
            config_path,
            overrides,
            server_config: ServerConfig::default(),
            runtime,
            connection_states: Arc::new(DashMap::new()),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Replace server limits
    #[must_use]
    pub fn with_server_config(mut self, server_config: ServerConfig) -> Self {
        self.server_config = server_config;
        self
    }

    /// Get peer credentials from Unix socket
    #[cfg(unix)]
    fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
        use std::os::unix::io::AsRawFd;

        let fd = stream.as_raw_fd();
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        let result = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if result == 0 {
            Some(cred.uid)
        } else {
            None
        }
    }

    /// Prepare the socket path (create directory, remove stale socket)
    fn prepare_socket(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
                info!(path = ?parent, "Created socket directory");
            }
        }

        if self.socket_path.exists() {
            warn!(path = ?self.socket_path, "Removing stale socket file");
            fs::remove_file(&self.socket_path).with_context(|| {
                format!("Failed to remove stale socket: {:?}", self.socket_path)
            })?;
        }

        Ok(())
    }

    /// Owner-only access to the socket
    fn restrict_socket(&self) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&self.socket_path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict socket: {:?}", self.socket_path))
    }

    /// Run until `shutdown` flips to `true`
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
        reload: Arc<Notify>,
    ) -> Result<()> {
        self.prepare_socket()?;

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind to {:?}", self.socket_path))?;
        info!(path = ?self.socket_path, "Listening for connections");

        self.restrict_socket()?;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, stopping accept loop");
                        break;
                    }
                }
                () = reload.notified() => {
                    self.reload_config();
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => self.admit(stream),
                        Err(e) => error!(error = %e, "Accept failed"),
                    }
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    fn admit(&self, stream: UnixStream) {
        if self.connection_states.len() >= self.server_config.max_connections {
            warn!("Connection limit reached, rejecting new connection");
            return;
        }

        let peer_uid = Self::get_peer_uid(&stream);
        let our_uid = unsafe { libc::getuid() };
        if let Some(uid) = peer_uid {
            if uid != our_uid && uid != 0 {
                warn!(
                    peer_uid = uid,
                    our_uid = our_uid,
                    "Rejecting connection from different user"
                );
                return;
            }
        }

        let conn_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        info!(
            conn_id,
            peer_uid = ?peer_uid,
            active_connections = self.connection_states.len() + 1,
            "New connection accepted"
        );

        let (registered_tx, registered_rx) = oneshot::channel();
        let task = tokio::spawn(
            handle_connection(
                conn_id,
                stream,
                registered_rx,
                Arc::clone(&self.runtime),
                self.server_config.clone(),
                Arc::clone(&self.connection_states),
            )
            .instrument(tracing::info_span!("connection", conn_id)),
        );

        // The handler waits for its entry so its own removal always follows
        self.connection_states.insert(
            conn_id,
            ConnectionState {
                connected_at: Instant::now(),
                peer_uid,
                abort_handle: task.abort_handle(),
            },
        );
        let _ = registered_tx.send(());
    }

    /// Re-read the config file and apply live settings
    fn reload_config(&self) {
        let Some(config_path) = &self.config_path else {
            info!("No config file specified, skipping reload");
            return;
        };
        info!(path = ?config_path, "Reloading configuration");

        let reloaded = load_settings_from_path(Some(config_path)).and_then(|mut settings| {
            self.overrides.apply(&mut settings)?;
            Ok(settings)
        });
        match reloaded {
            Ok(settings) => self.runtime.apply_live_settings(&settings),
            Err(e) => warn!(error = %e, "Config reload failed, keeping current settings"),
        }
    }

    fn shutdown(&self) {
        info!("Initiating graceful shutdown");

        let conn_ids: Vec<u64> = self.connection_states.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, conn_state)) = self.connection_states.remove(&conn_id) {
                info!(
                    conn_id,
                    peer_uid = ?conn_state.peer_uid,
                    uptime_secs = conn_state.connected_at.elapsed().as_secs(),
                    "Aborting connection"
                );
                conn_state.abort_handle.abort();
            }
        }

        if self.socket_path.exists() {
            if let Err(e) = fs::remove_file(&self.socket_path) {
                warn!(error = %e, path = ?self.socket_path, "Failed to remove socket");
            } else {
                info!(path = ?self.socket_path, "Socket file removed");
            }
        }
    }
}

/// Serve one client
///
/// A reader task parses lines into a bounded queue; this task routes queued
/// requests one at a time. EOF on the read side only ends intake, so a
/// client that half-closes still gets every reply. A request is cancelled
/// once the peer has hung up completely or the socket errors.
async fn handle_connection(
    conn_id: u64,
    stream: UnixStream,
    registered: oneshot::Receiver<()>,
    runtime: Arc<RouterRuntime>,
    server_config: ServerConfig,
    connection_states: Arc<DashMap<u64, ConnectionState>>,
) {
    let _ = registered.await;
    debug!("Connection handler started");

    let (read_half, mut write_half) = stream.into_split();
    let (queue_tx, mut queue_rx) = mpsc::channel::<Inbound>(server_config.request_queue_capacity);
    let (closed_tx, closed_rx) = watch::channel(false);

    let reader = tokio::spawn(
        async move {
            let mut reader = BufReader::new(read_half);
            let mut buf = Vec::new();
            loop {
                match read_frame(&mut reader, &mut buf, server_config.max_line_bytes).await {
                    Ok(Frame::Line(inbound)) => {
                        if queue_tx.send(inbound).await.is_err() {
                            return;
                        }
                    }
                    Ok(Frame::Blank) => {}
                    Ok(Frame::Eof) => break,
                    Err(e) => {
                        warn!(error = %e, "Read error");
                        let _ = closed_tx.send(true);
                        return;
                    }
                }
            }

            // Intake is over; queued requests still run and get replies
            drop(queue_tx);
            debug!("Client finished sending");

            let mut ticker = tokio::time::interval(HANGUP_CHECK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if peer_hung_up(reader.get_ref().as_ref()) {
                    debug!("Client disconnected");
                    let _ = closed_tx.send(true);
                    return;
                }
            }
        }
        .in_current_span(),
    );

    while let Some(inbound) = queue_rx.recv().await {
        let response = match inbound {
            Inbound::Request(request) => {
                let started = Instant::now();
                let mut closed = closed_rx.clone();
                let cancelled = async move {
                    let _ = closed.wait_for(|closed| *closed).await;
                };
                match runtime.router().route_until(&request, cancelled).await {
                    Some(Ok(response)) => response,
                    Some(Err(e)) => {
                        debug!(request_id = %request.id, error = %e, "Request failed");
                        Response::error(
                            request.id.clone(),
                            ErrorKind::AllProvidersExhausted,
                            started.elapsed().as_millis() as u64,
                        )
                    }
                    None => {
                        info!(request_id = %request.id, "Client went away, request cancelled");
                        break;
                    }
                }
            }
            Inbound::Invalid { request_id, reason } => {
                warn!(reason = %reason, "Rejecting malformed request line");
                Response::error(request_id, ErrorKind::InvalidRequest, 0)
            }
        };

        if let Err(e) = write_response(&mut write_half, &response).await {
            warn!(error = %e, "Write error");
            break;
        }
    }

    reader.abort();
    connection_states.remove(&conn_id);
    info!(
        active_connections = connection_states.len(),
        "Connection handler finished"
    );
}

/// How often a half-closed connection is checked for a full hang-up
const HANGUP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Whether the peer closed both directions
///
/// A half-close only shuts our read side; `POLLHUP` is raised once the
/// peer has gone entirely.
fn peer_hung_up(stream: &UnixStream) -> bool {
    use std::os::unix::io::AsRawFd;

    let mut pollfd = libc::pollfd {
        fd: stream.as_raw_fd(),
        events: 0,
        revents: 0,
    };
    let ready = unsafe { libc::poll(&mut pollfd, 1, 0) };
    ready > 0 && pollfd.revents & (libc::POLLHUP | libc::POLLERR) != 0
}

/// One read from the client
#[derive(Debug)]
enum Frame {
    Line(Inbound),
    Blank,
    Eof,
}

/// Read one newline-terminated line, buffering at most `max_bytes + 1`
///
/// An oversize line is drained in bounded chunks up to its newline and
/// answered as invalid, as is a line that is not UTF-8. A final line
/// without a newline is accepted.
async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>, max_bytes: usize) -> io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let limit = max_bytes as u64 + 1;
    buf.clear();
    let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(Frame::Eof);
    }

    if buf.last() != Some(&b'\n') && read as u64 == limit {
        let mut skipped = read;
        loop {
            buf.clear();
            let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
            skipped += n;
            if n == 0 || buf.last() == Some(&b'\n') {
                break;
            }
        }
        return Ok(Frame::Line(Inbound::Invalid {
            request_id: String::new(),
            reason: format!("line of at least {skipped} bytes exceeds {max_bytes}"),
        }));
    }

    let line = match std::str::from_utf8(buf) {
        Ok(line) => line.trim(),
        Err(e) => {
            return Ok(Frame::Line(Inbound::Invalid {
                request_id: String::new(),
                reason: format!("line is not UTF-8: {e}"),
            }))
        }
    };
    if line.is_empty() {
        return Ok(Frame::Blank);
    }
    Ok(Frame::Line(parse_line(line)))
}

/// One parsed request line
#[derive(Debug)]
enum Inbound {
    Request(Request),
    Invalid { request_id: String, reason: String },
}

fn parse_line(line: &str) -> Inbound {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => Inbound::Request(request),
        Err(e) => {
            // Echo the id back when the line is at least a JSON object
            let request_id = serde_json::from_str::<serde_json::Value>(line)
                .ok()
                .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string))
                .unwrap_or_default();
            Inbound::Invalid {
                request_id,
                reason: e.to_string(),
            }
        }
    }
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> Result<()> {
    let mut line = serde_json::to_vec(response).context("Failed to encode response")?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

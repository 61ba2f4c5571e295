//! Request dispatcher and per-session tasks.
//!
//! One dispatcher task owns the well-known socket, the session registry and
//! the idle timer. Every accepted RRQ gets its own task with a fresh
//! ephemeral socket; the task reports back over a channel when it ends.

use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLogger;
use crate::content::ContentResolver;
use crate::error::Result;
use crate::idle::IdleLifecycle;
use crate::options::Policy;
use crate::packet::{DecodeError, ErrorCode, MAX_PACKET_SIZE, Packet};
use crate::session::{AbortReason, Outcome, TransferSession};

pub type SessionId = u64;

/// Why [`TftpServer::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// The idle timeout expired with no active transfers.
    Idle,
    /// The shutdown token was cancelled.
    Cancelled,
}

impl fmt::Display for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shutdown::Idle => write!(f, "idle timeout"),
            Shutdown::Cancelled => write!(f, "shutdown requested"),
        }
    }
}

pub struct TftpServer {
    socket: UdpSocket,
    resolver: Arc<dyn ContentResolver>,
    policy: Arc<Policy>,
    idle_timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl TftpServer {
    /// Bind the well-known socket with `SO_REUSEADDR` set.
    pub fn bind(
        addr: SocketAddr,
        resolver: Arc<dyn ContentResolver>,
        policy: Policy,
    ) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        Self::from_std(std_socket, resolver, policy)
    }

    /// Serve on a socket that is already bound, e.g. one inherited from a
    /// supervisor on stdin.
    pub fn from_std(
        socket: std::net::UdpSocket,
        resolver: Arc<dyn ContentResolver>,
        policy: Policy,
    ) -> Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: UdpSocket::from_std(socket)?,
            resolver,
            policy: Arc::new(policy),
            idle_timeout: None,
            shutdown: CancellationToken::new(),
        })
    }

    /// Stop serving after `timeout` without active transfers. `None`
    /// serves forever.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<Shutdown> {
        let local_addr = self.local_addr()?;
        info!("TFTP server listening on {}", local_addr);

        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher {
            socket: self.socket,
            local_addr,
            resolver: self.resolver,
            policy: self.policy,
            registry: HashMap::new(),
            next_id: 1,
            idle: IdleLifecycle::new(self.idle_timeout),
            closed_tx,
        };
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        let reason = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Shutdown::Cancelled,

                _ = dispatcher.idle.expired() => {
                    if dispatcher.registry.is_empty() {
                        info!("Idle for {:?}, shutting down", self.idle_timeout.unwrap_or_default());
                        break Shutdown::Idle;
                    }
                    dispatcher.idle.cancel();
                }

                Some(closed) = closed_rx.recv() => dispatcher.session_closed(closed),

                received = dispatcher.socket.recv_from(&mut buf) => match received {
                    Ok((len, remote)) => dispatcher.handle_datagram(&buf[..len], remote).await,
                    Err(e) => error!("Error receiving TFTP packet: {}", e),
                },
            }
        };

        dispatcher.abort_all();
        Ok(reason)
    }
}

struct SessionEntry {
    remote: SocketAddr,
    filename: String,
    started: Instant,
    abort: AbortHandle,
}

struct SessionClosed {
    id: SessionId,
    outcome: Outcome,
}

struct Dispatcher {
    socket: UdpSocket,
    local_addr: SocketAddr,
    resolver: Arc<dyn ContentResolver>,
    policy: Arc<Policy>,
    registry: HashMap<SessionId, SessionEntry>,
    next_id: SessionId,
    idle: IdleLifecycle,
    closed_tx: mpsc::UnboundedSender<SessionClosed>,
}

impl Dispatcher {
    async fn handle_datagram(&mut self, data: &[u8], remote: SocketAddr) {
        match Packet::decode(data) {
            Ok(Packet::Rrq {
                filename,
                mode,
                options,
            }) => self.start_session(remote, filename, mode, options).await,
            Ok(other) => {
                warn!("Unsupported {:?} from {}", other.opcode(), remote);
                self.send_error(remote, ErrorCode::AccessViolation, "Unsupported request")
                    .await;
            }
            Err(DecodeError::Unsupported(opcode)) => {
                warn!("Unsupported {:?} from {}", opcode, remote);
                self.send_error(remote, ErrorCode::AccessViolation, "Unsupported request")
                    .await;
            }
            Err(DecodeError::UnknownOpcode(opcode)) => {
                warn!("Unknown opcode {} from {}", opcode, remote);
                self.send_error(remote, ErrorCode::NotDefined, "Unknown request")
                    .await;
            }
            Err(e) => {
                debug!("Dropping malformed request from {}: {}", remote, e);
                AuditLogger::protocol_violation(remote, &e.to_string());
            }
        }
    }

    async fn start_session(
        &mut self,
        remote: SocketAddr,
        filename: String,
        mode: String,
        options: Vec<(String, String)>,
    ) {
        self.idle.cancel();

        let bind_addr = ephemeral_addr(self.local_addr, remote);
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                error!(
                    "Cannot bind transfer socket for {} ({}): {}",
                    remote, filename, e
                );
                if self.registry.is_empty() {
                    self.idle.arm();
                }
                return;
            }
        };

        let id = self.next_id;
        self.next_id += 1;

        debug!(
            "RRQ {} from {}: {} (mode: {}, options: {:?})",
            id, remote, filename, mode, options
        );
        AuditLogger::read_request(id, remote, &filename, &mode, &options);

        let task = SessionTask {
            id,
            socket,
            session: TransferSession::new(remote, &filename, options, &self.policy),
            resolver: Arc::clone(&self.resolver),
            policy: Arc::clone(&self.policy),
            deadline: Instant::now(),
        };
        let closed_tx = self.closed_tx.clone();
        let handle = tokio::spawn(async move {
            let outcome = task.run().await;
            // The dispatcher may already be gone during shutdown
            let _ = closed_tx.send(SessionClosed { id, outcome });
        });

        self.registry.insert(
            id,
            SessionEntry {
                remote,
                filename,
                started: Instant::now(),
                abort: handle.abort_handle(),
            },
        );
        debug!("{} active session(s)", self.registry.len());
    }

    fn session_closed(&mut self, closed: SessionClosed) {
        if let Some(entry) = self.registry.remove(&closed.id) {
            info!(
                "Session {} for {} ({}) closed after {:?}: {:?}",
                closed.id,
                entry.remote,
                entry.filename,
                entry.started.elapsed(),
                closed.outcome
            );
        }

        if self.registry.is_empty() {
            self.idle.arm();
        }
    }

    async fn send_error(&self, remote: SocketAddr, code: ErrorCode, message: &str) {
        let packet = Packet::error(code, message).encode();
        if let Err(e) = self.socket.send_to(&packet, remote).await {
            warn!("Failed to send error to {}: {}", remote, e);
        }
    }

    fn abort_all(&mut self) {
        for (id, entry) in self.registry.drain() {
            debug!("Aborting session {} for {}", id, entry.remote);
            entry.abort.abort();
        }
    }
}

// Reply from the address the request came in on when it is specific
fn ephemeral_addr(local: SocketAddr, remote: SocketAddr) -> SocketAddr {
    let ip = if !local.ip().is_unspecified() && local.is_ipv4() == remote.is_ipv4() {
        local.ip()
    } else if remote.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };
    SocketAddr::new(ip, 0)
}

struct SessionTask {
    id: SessionId,
    socket: UdpSocket,
    session: TransferSession,
    resolver: Arc<dyn ContentResolver>,
    policy: Arc<Policy>,
    deadline: Instant,
}

impl SessionTask {
    async fn run(mut self) -> Outcome {
        let started = Instant::now();
        let remote = self.session.remote();

        self.session.open(self.resolver.as_ref()).await;
        self.send_reply().await;

        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        while !self.session.is_terminal() {
            let received =
                tokio::time::timeout_at(self.deadline, self.socket.recv_from(&mut buf)).await;

            match received {
                Err(_) => self.session.handle_timeout(),
                Ok(Err(e)) => {
                    warn!("Receive failed for session {}: {}", self.id, e);
                    self.session.abort(AbortReason::Socket(e.to_string()));
                }
                Ok(Ok((_, from))) if from != remote => {
                    warn!(
                        "Session {} for {} received a datagram from {}",
                        self.id, remote, from
                    );
                    AuditLogger::protocol_violation(from, "datagram for another client's transfer");
                    self.session.abort(AbortReason::ForeignSource(from));
                }
                Ok(Ok((len, _))) => match Packet::decode(&buf[..len]) {
                    Ok(packet) => {
                        self.session.handle_input(packet);
                        self.send_reply().await;
                    }
                    Err(DecodeError::UnknownOpcode(opcode)) => {
                        warn!("Unknown opcode {} from client {}", opcode, remote);
                        let packet = Packet::error(ErrorCode::NotDefined, "Unknown request");
                        if let Err(e) = self.socket.send_to(&packet.encode(), remote).await {
                            warn!("Send to {} failed: {}", remote, e);
                        }
                        self.session.abort(AbortReason::UnknownOpcode(opcode));
                    }
                    Err(DecodeError::Unsupported(opcode)) => {
                        warn!("Unexpected {:?} from client {}", opcode, remote);
                        self.session.abort(AbortReason::UnexpectedOpcode(opcode));
                    }
                    Err(e) => debug!("Dropping malformed datagram from {}: {}", remote, e),
                },
            }
        }

        let outcome = self.session.outcome();
        self.audit(&outcome, started);
        outcome
    }

    async fn send_reply(&mut self) {
        let Some(packet) = self.session.reply(&self.policy).await else {
            return;
        };
        let remote = self.session.remote();

        match self.socket.send_to(&packet.encode(), remote).await {
            Ok(_) => self.deadline = Instant::now() + self.session.timeout(),
            Err(e) => {
                warn!("Send to {} failed: {}", remote, e);
                self.session.abort(AbortReason::Socket(e.to_string()));
            }
        }
    }

    fn audit(&self, outcome: &Outcome, started: Instant) {
        let remote = self.session.remote();
        let filename = self.session.requested();

        match outcome {
            Outcome::Completed { bytes, blocks } => AuditLogger::transfer_completed(
                self.id,
                remote,
                filename,
                *bytes,
                *blocks,
                started.elapsed().as_millis() as u64,
            ),
            Outcome::Failed { code, message } => {
                AuditLogger::read_denied(self.id, remote, filename, *code, message)
            }
            Outcome::Aborted(reason) => AuditLogger::transfer_aborted(
                self.id,
                remote,
                filename,
                &reason.to_string(),
                self.session.block_count(),
            ),
            Outcome::Interrupted => {}
        }
    }
}

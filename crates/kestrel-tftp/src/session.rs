//! Per-transfer state machine
//!
//! A [`TransferSession`] owns no sockets or timers. The server feeds it
//! decoded packets and timer expiries and writes out whatever [`reply`]
//! returns, which keeps the protocol logic testable without the network.
//!
//! ```text
//! Rrq ──options──▶ Oack ──ACK──▶ Ack ──▶ Data ──ACK──▶ Ack ... ──▶ Done
//!  │                                                     (offset >= size)
//!  └─no options──────────────────▶ Ack
//! any ──bad name / not found──▶ Error     any ──timeout / client ERROR──▶ Aborted
//! ```
//!
//! [`reply`]: TransferSession::reply

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::content::{ContentResolver, ReadableSource, ResolveError};
use crate::filename::sanitize;
use crate::options::{EffectiveSettings, Policy, negotiate};
use crate::packet::{ErrorCode, Opcode, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Request accepted, nothing sent yet.
    Rrq,
    /// OACK sent, waiting for its ACK.
    Oack,
    /// Ready to send the next DATA block.
    Ack,
    /// DATA sent, waiting for its ACK.
    Data,
    Done,
    Error,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Done | SessionState::Error | SessionState::Aborted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    Timeout,
    ClientError { code: i16, message: String },
    UnexpectedOpcode(Opcode),
    UnknownOpcode(u16),
    ForeignSource(SocketAddr),
    Socket(String),
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Timeout => write!(f, "timeout"),
            AbortReason::ClientError { code, message } => {
                write!(f, "client error {}: {}", code, message)
            }
            AbortReason::UnexpectedOpcode(opcode) => write!(f, "unexpected {:?}", opcode),
            AbortReason::UnknownOpcode(opcode) => write!(f, "unknown opcode {}", opcode),
            AbortReason::ForeignSource(addr) => write!(f, "datagram from foreign source {}", addr),
            AbortReason::Socket(e) => write!(f, "socket error: {}", e),
        }
    }
}

/// How a session ended, for logging and audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { bytes: u64, blocks: u64 },
    Failed { code: i16, message: String },
    Aborted(AbortReason),
    /// Torn down before reaching a terminal state (server shutdown).
    Interrupted,
}

#[derive(Debug)]
pub struct TransferSession {
    remote: SocketAddr,
    requested: String,
    filename: Option<String>,
    options: Vec<(String, String)>,
    settings: EffectiveSettings,
    block_count: u64,
    content: Option<Arc<dyn ReadableSource>>,
    file_size: u64,
    state: SessionState,
    error: Option<(ErrorCode, String)>,
    abort_reason: Option<AbortReason>,
}

impl TransferSession {
    /// Start a session for an RRQ. An unusable filename puts the session
    /// straight into the `Error` state.
    pub fn new(
        remote: SocketAddr,
        filename: &str,
        options: Vec<(String, String)>,
        policy: &Policy,
    ) -> Self {
        let mut session = Self {
            remote,
            requested: filename.to_string(),
            filename: None,
            options,
            settings: policy.defaults(),
            block_count: 0,
            content: None,
            file_size: 0,
            state: SessionState::Rrq,
            error: None,
            abort_reason: None,
        };

        match sanitize(filename) {
            Ok(clean) => session.filename = Some(clean),
            Err(e) => {
                warn!("{} from {}: {}", e, remote, filename);
                session.fail(ErrorCode::AccessViolation, "Invalid file name");
            }
        }

        session
    }

    /// Resolve the content for this request. No-op unless the session is
    /// still in `Rrq` with a valid filename.
    pub async fn open(&mut self, resolver: &dyn ContentResolver) {
        if self.state != SessionState::Rrq || self.content.is_some() {
            return;
        }
        let Some(filename) = self.filename.clone() else {
            return;
        };

        info!("host {} requesting {}", self.remote, filename);

        match resolver.resolve(&filename, self.remote).await {
            Ok(source) => {
                self.file_size = source.size();
                self.content = Some(source);
                debug!(
                    "starting xfer of {} ({} bytes) to {}",
                    filename, self.file_size, self.remote
                );
            }
            Err(ResolveError::Denied(reason)) => {
                warn!("{} denied {}: {}", self.remote, filename, reason);
                self.fail(ErrorCode::AccessViolation, "Access violation");
            }
            Err(ResolveError::NotFound(_)) => {
                debug!("{} requested {}: file not found.", self.remote, filename);
                self.fail(ErrorCode::FileNotFound, "No such file");
            }
            Err(ResolveError::Backend(e)) => {
                warn!("Resolver failed for {} ({}): {}", filename, self.remote, e);
                self.fail(ErrorCode::FileNotFound, "No such file");
            }
        }
    }

    /// Feed one packet received from the session's client.
    pub fn handle_input(&mut self, packet: Packet) {
        if self.state.is_terminal() {
            return;
        }

        match packet {
            Packet::Ack { block } => match self.state {
                SessionState::Data => {
                    let expected = wire_block(self.block_count + 1);
                    if block == expected {
                        self.block_count += 1;
                    } else {
                        debug!(
                            "Stale ACK {} from {} (expected {}), resending",
                            block, self.remote, expected
                        );
                    }
                    self.state = SessionState::Ack;
                }
                SessionState::Oack => self.state = SessionState::Ack,
                _ => trace!("ACK {} from {} ignored in {:?}", block, self.remote, self.state),
            },
            Packet::Error { code, message } => {
                warn!("Error from client {}: {}:{}", self.remote, code, message);
                self.abort(AbortReason::ClientError { code, message });
            }
            other => {
                warn!("Unknown opcode from client {}: {:?}", self.remote, other.opcode());
                self.abort(AbortReason::UnexpectedOpcode(other.opcode()));
            }
        }
    }

    pub fn handle_timeout(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        info!(
            "Timeout. Transfer of {} to {} aborted",
            self.requested, self.remote
        );
        self.abort(AbortReason::Timeout);
    }

    pub fn abort(&mut self, reason: AbortReason) {
        self.abort_reason = Some(reason);
        self.state = SessionState::Aborted;
    }

    /// Next packet to send for the current state. `None` means there is
    /// nothing more to send and the session is finished.
    pub async fn reply(&mut self, policy: &Policy) -> Option<Packet> {
        match self.state {
            SessionState::Rrq => {
                if self.content.is_none() {
                    self.fail(ErrorCode::NotDefined, "Transfer not prepared");
                    return self.error_packet();
                }

                if self.options.is_empty() {
                    // No options: behave as if our (empty) OACK was acknowledged
                    self.settings = policy.defaults();
                    self.state = SessionState::Ack;
                    debug!("Using options: {:?}", self.settings);
                    return self.next_block().await;
                }

                let negotiation = negotiate(&self.options, policy, self.file_size);
                self.settings = negotiation.settings;
                self.state = SessionState::Oack;
                Some(Packet::Oack {
                    options: negotiation.accepted,
                })
            }
            SessionState::Ack => self.next_block().await,
            SessionState::Error => self.error_packet(),
            SessionState::Oack
            | SessionState::Data
            | SessionState::Done
            | SessionState::Aborted => None,
        }
    }

    async fn next_block(&mut self) -> Option<Packet> {
        let blksize = self.settings.blksize;
        let offset = self.block_count * blksize as u64;

        if offset >= self.file_size {
            info!(
                "Transfer of {} to {} done",
                self.requested, self.remote
            );
            self.state = SessionState::Done;
            return None;
        }

        let content = Arc::clone(self.content.as_ref()?);
        match content.read_at(offset, blksize).await {
            Ok(payload) => {
                let block = wire_block(self.block_count + 1);
                trace!(
                    "DATA to {}, block_count {}/{}, size {}({}/{})",
                    self.remote,
                    self.block_count + 1,
                    block,
                    payload.len(),
                    offset + payload.len() as u64,
                    self.file_size
                );
                self.state = SessionState::Data;
                Some(Packet::Data { block, payload })
            }
            Err(e) => {
                warn!("Read of {} at {} failed: {}", self.requested, offset, e);
                self.fail(ErrorCode::NotDefined, "Read error");
                self.error_packet()
            }
        }
    }

    fn fail(&mut self, code: ErrorCode, message: &str) {
        self.error = Some((code, message.to_string()));
        self.state = SessionState::Error;
    }

    fn error_packet(&self) -> Option<Packet> {
        self.error
            .as_ref()
            .map(|(code, message)| Packet::error(*code, message.clone()))
    }

    pub fn outcome(&self) -> Outcome {
        match self.state {
            SessionState::Done => Outcome::Completed {
                bytes: self.file_size,
                blocks: self.block_count,
            },
            SessionState::Error => {
                let (code, message) = self
                    .error
                    .clone()
                    .unwrap_or((ErrorCode::NotDefined, String::new()));
                Outcome::Failed {
                    code: code as i16,
                    message,
                }
            }
            SessionState::Aborted => Outcome::Aborted(
                self.abort_reason.clone().unwrap_or(AbortReason::Timeout),
            ),
            _ => Outcome::Interrupted,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// The filename as sent by the client.
    pub fn requested(&self) -> &str {
        &self.requested
    }

    /// The sanitized filename, if it passed sanitization.
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.settings.timeout
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }
}

// Block numbers on the wire wrap at 65536; the internal count does not.
fn wire_block(count: u64) -> u16 {
    (count & 0xFFFF) as u16
}

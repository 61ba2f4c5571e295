use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{Level, event};

static AUDIT_ENABLED: AtomicBool = AtomicBool::new(true);

/// Security audit events, emitted as one JSON document per tracing event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    ServerStarted {
        #[serde(flatten)]
        common: CommonFields,
        bind_addr: String,
        root_dir: String,
        supervised: bool,
    },

    ServerStopped {
        #[serde(flatten)]
        common: CommonFields,
        reason: String,
    },

    ReadRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        mode: String,
        /// `[name, value]` pairs in the order the client sent them
        options: Vec<(String, String)>,
    },

    ReadDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        code: i16,
        reason: String,
    },

    TransferCompleted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        bytes_transferred: u64,
        /// Full block count, not the 16-bit wire number
        blocks_sent: u64,
        duration_ms: u64,
    },

    TransferAborted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        reason: String,
        blocks_sent: u64,
    },

    ProtocolViolation {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        violation: String,
    },
}

/// Fields shared by every audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFields {
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub hostname: String,
    pub service: String,
    /// info, warn or error
    pub severity: String,
    /// Ties the events of one transfer together
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
}

impl CommonFields {
    pub fn new(severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            service: "kestrel-tftp".to_string(),
            severity: severity.to_string(),
            session_id: None,
        }
    }

    pub fn for_session(severity: &str, session_id: u64) -> Self {
        let mut fields = Self::new(severity);
        fields.session_id = Some(session_id);
        fields
    }
}

impl AuditEvent {
    pub fn log(&self) {
        if !AUDIT_ENABLED.load(Ordering::Relaxed) {
            return;
        }

        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"Failed to serialize audit event: {:?}\"}}",
                self
            )
        });

        match self.common().severity.as_str() {
            "error" => event!(Level::ERROR, audit_event = %json),
            "warn" => event!(Level::WARN, audit_event = %json),
            _ => event!(Level::INFO, audit_event = %json),
        }
    }

    fn common(&self) -> &CommonFields {
        match self {
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::ServerStopped { common, .. }
            | AuditEvent::ReadRequest { common, .. }
            | AuditEvent::ReadDenied { common, .. }
            | AuditEvent::TransferCompleted { common, .. }
            | AuditEvent::TransferAborted { common, .. }
            | AuditEvent::ProtocolViolation { common, .. } => common,
        }
    }
}

pub struct AuditLogger;

impl AuditLogger {
    /// Turn audit output on or off process-wide (`logging.audit_enabled`).
    pub fn set_enabled(enabled: bool) {
        AUDIT_ENABLED.store(enabled, Ordering::Relaxed);
    }

    pub fn server_started(bind_addr: SocketAddr, root_dir: &str, supervised: bool) {
        AuditEvent::ServerStarted {
            common: CommonFields::new("info"),
            bind_addr: bind_addr.to_string(),
            root_dir: root_dir.to_string(),
            supervised,
        }
        .log();
    }

    pub fn server_stopped(reason: &str) {
        AuditEvent::ServerStopped {
            common: CommonFields::new("info"),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn read_request(
        session_id: u64,
        client_addr: SocketAddr,
        filename: &str,
        mode: &str,
        options: &[(String, String)],
    ) {
        AuditEvent::ReadRequest {
            common: CommonFields::for_session("info", session_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            mode: mode.to_string(),
            options: options.to_vec(),
        }
        .log();
    }

    pub fn read_denied(
        session_id: u64,
        client_addr: SocketAddr,
        filename: &str,
        code: i16,
        reason: &str,
    ) {
        AuditEvent::ReadDenied {
            common: CommonFields::for_session("warn", session_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            code,
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn transfer_completed(
        session_id: u64,
        client_addr: SocketAddr,
        filename: &str,
        bytes_transferred: u64,
        blocks_sent: u64,
        duration_ms: u64,
    ) {
        AuditEvent::TransferCompleted {
            common: CommonFields::for_session("info", session_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            bytes_transferred,
            blocks_sent,
            duration_ms,
        }
        .log();
    }

    pub fn transfer_aborted(
        session_id: u64,
        client_addr: SocketAddr,
        filename: &str,
        reason: &str,
        blocks_sent: u64,
    ) {
        AuditEvent::TransferAborted {
            common: CommonFields::for_session("warn", session_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            reason: reason.to_string(),
            blocks_sent,
        }
        .log();
    }

    pub fn protocol_violation(client_addr: SocketAddr, violation: &str) {
        AuditEvent::ProtocolViolation {
            common: CommonFields::new("error"),
            client_addr: client_addr.to_string(),
            violation: violation.to_string(),
        }
        .log();
    }
}

//! Audit logging: every dispatched key operation emits a structured event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Audit events
// ---------------------------------------------------------------------------

/// What happened. Tags match the persisted wire form 1:1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    GenerateKey,
    ActivateKey,
    ValidateKey,
    KeyExpired,
    MachineLimitExceeded,
    InvalidKeyAttempt,
    UpdateExpirationForProduct,
    GetKeyInfo,
    EditKeyInfo,
    DeleteKey,
    RetrieveRequestLogs,
    RetrieveKeysFile,
}

/// Event severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditLevel {
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARNING")]
    Warning,
}

/// Who made the request: best-effort caller IP (first hop of a
/// forwarded-for header, else the direct peer) plus the authenticated
/// username, when there is one.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub username: Option<String>,
}

impl ClientInfo {
    /// An unauthenticated caller with no resolvable address (tests, local use).
    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// Subject identifiers of the audited action.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuditDetails {
    pub key: Option<String>,
    pub product_id: Option<String>,
    pub machine_id: Option<String>,
}

/// A structured audit event. Append-only: the engine never mutates or
/// deletes recorded events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub client: ClientInfo,
    pub action: AuditAction,
    pub details: AuditDetails,
}

impl AuditEvent {
    pub fn new(action: AuditAction, client: ClientInfo) -> Self {
        Self {
            timestamp: Utc::now(),
            level: AuditLevel::Info,
            client,
            action,
            details: AuditDetails::default(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.details.key = Some(key.into());
        self
    }

    pub fn with_product_id(mut self, product_id: impl Into<String>) -> Self {
        self.details.product_id = Some(product_id.into());
        self
    }

    pub fn with_machine_id(mut self, machine_id: impl Into<String>) -> Self {
        self.details.machine_id = Some(machine_id.into());
        self
    }

    pub fn warning(mut self) -> Self {
        self.level = AuditLevel::Warning;
        self
    }
}

// ---------------------------------------------------------------------------
// Audit sink trait
// ---------------------------------------------------------------------------

/// Where audit events go. Implement this for your SIEM/log system.
///
/// Synchronous to avoid the `async_trait` dependency. Recording is
/// best-effort: a sink must never fail the operation that emitted the event.
pub trait AuditSinkSync: Send + Sync {
    fn record(&self, event: AuditEvent);
}

// ---------------------------------------------------------------------------
// Built-in sinks
// ---------------------------------------------------------------------------

/// Mirrors events into the `tracing` stream, then forwards to an inner sink.
pub struct TracingAuditSink {
    inner: Arc<dyn AuditSinkSync>,
}

impl TracingAuditSink {
    pub fn new(inner: Arc<dyn AuditSinkSync>) -> Self {
        Self { inner }
    }
}

impl AuditSinkSync for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match event.level {
            AuditLevel::Info => tracing::info!(
                action = ?event.action,
                ip = ?event.client.ip_address,
                username = ?event.client.username,
                key = ?event.details.key,
                "audit"
            ),
            AuditLevel::Warning => tracing::warn!(
                action = ?event.action,
                ip = ?event.client.ip_address,
                username = ?event.client.username,
                key = ?event.details.key,
                "audit"
            ),
        }
        self.inner.record(event);
    }
}

/// Collects events in memory (for testing).
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for_action(&self, action: AuditAction) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSinkSync for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Persists the whole log as one JSON array, read-modify-write per event.
///
/// A corrupt or unreadable existing log is treated as empty rather than
/// fatal, so logging never blocks the primary operation's success.
pub struct FileAuditSink {
    path: std::path::PathBuf,
}

impl FileAuditSink {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AuditSinkSync for FileAuditSink {
    fn record(&self, event: AuditEvent) {
        let mut log: Vec<AuditEvent> = match std::fs::read_to_string(&self.path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        log.push(event);
        match serde_json::to_string_pretty(&log) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    eprintln!("[audit] cannot write {:?}: {}", self.path, e);
                }
            }
            Err(e) => eprintln!("[audit] serialize error: {}", e),
        }
    }
}

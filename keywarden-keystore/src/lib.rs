//! # Keywarden Keystore
//!
//! License key lifecycle management.
//!
//! Issues license keys, binds them to a bounded number of machine
//! identifiers, tracks expiration, and audit-logs every dispatched
//! operation. Storage backends and audit sinks are pluggable; all mutation
//! runs as a load → compute → save cycle under one process-wide lock.
//!
//! ## Quick Start
//!
//! ```ignore
//! use keywarden_keystore::*;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let storage = Arc::new(InMemoryBackend::new());
//! let audit = Arc::new(InMemoryAuditSink::new());
//! let ks = Keystore::new(storage, audit);
//!
//! // Issue a key: 30-day grant, two machines, for product "pro"
//! let client = ClientInfo::anonymous();
//! let record = ks.generate(30, 2, "pro", &client).await.unwrap();
//!
//! // Bind a machine
//! let outcome = ks
//!     .activate_or_validate(record.key.as_str(), "machine-1", &client)
//!     .await
//!     .unwrap();
//! assert!(outcome.is_success());
//! # });
//! ```

pub mod audit;
pub mod auth;
pub mod error;
pub mod keystore;
pub mod storage;
pub mod types;

// Re-export main types for convenience
pub use audit::{
    AuditAction, AuditDetails, AuditEvent, AuditLevel, AuditSinkSync, ClientInfo, FileAuditSink,
    InMemoryAuditSink, TracingAuditSink,
};
pub use auth::{verify_webhook_signature, AuthConfig, Principal, Role};
pub use error::StoreError;
pub use keystore::Keystore;
pub use storage::{purge_expired, FileBackend, InMemoryBackend, StorageBackend};
pub use types::{ActivationOutcome, KeyEdit, KeyId, LicenseKey};

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

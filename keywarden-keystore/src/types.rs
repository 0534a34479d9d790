//! Core types: KeyId, LicenseKey, activation outcomes, partial edits.

use chrono::{DateTime, Duration, Utc};
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Key identifier
// ---------------------------------------------------------------------------

/// Unique license key token (hex-encoded random bytes).
///
/// Generated once, immutable, never reused.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    /// Mint a new random key token.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand_core::OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Create from a specific string (for testing/deterministic use).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// License key record
// ---------------------------------------------------------------------------

fn default_machine_limit() -> u32 {
    1
}

/// A single license grant: the unit of issue, activation, and expiry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LicenseKey {
    /// Primary identifier. Immutable after generation.
    pub key: KeyId,
    /// Groups keys by product or license tier.
    pub product_id: String,
    /// Original grant length in days; 0 means no expiration.
    #[serde(default)]
    pub expiration_days: u32,
    /// Absolute deadline; `None` = never expires.
    #[serde(default)]
    pub expiration_date: Option<DateTime<Utc>>,
    /// Maximum number of concurrently bound machine ids. Always >= 1.
    #[serde(default = "default_machine_limit")]
    pub machine_limit: u32,
    /// Machines currently bound, in activation order.
    #[serde(default)]
    pub machine_ids: Vec<String>,
    /// True once at least one machine has been bound.
    #[serde(default)]
    pub activated: bool,
}

impl LicenseKey {
    /// Issue a fresh license key.
    ///
    /// The expiration deadline is fixed at issue time: `now + expiration_days`
    /// for a positive grant length, none for 0.
    pub fn issue(expiration_days: u32, machine_limit: u32, product_id: &str, now: DateTime<Utc>) -> Self {
        let expiration_date = if expiration_days > 0 {
            Some(now + Duration::days(i64::from(expiration_days)))
        } else {
            None
        };
        Self {
            key: KeyId::generate(),
            product_id: product_id.to_string(),
            expiration_days,
            expiration_date,
            machine_limit: machine_limit.max(1),
            machine_ids: Vec::new(),
            activated: false,
        }
    }

    /// Whether the deadline has passed. A record with no deadline never expires.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_date.is_some_and(|d| d < now)
    }

    /// Repair a record loaded from storage so the engine's invariants hold:
    /// machine_limit >= 1 and `activated` tracks the bound-machine set.
    pub fn normalize(&mut self) {
        self.machine_limit = self.machine_limit.max(1);
        self.activated = !self.machine_ids.is_empty();
    }
}

// ---------------------------------------------------------------------------
// Activation outcome
// ---------------------------------------------------------------------------

/// Result of an activate-or-validate request against a key.
///
/// Explicit outcome tags, never errors: the HTTP layer maps each variant
/// 1:1 to a status code and response tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// Machine newly bound to the key.
    Activated { product_id: String },
    /// Machine was already bound; idempotent re-validation.
    Valid { product_id: String },
    /// The key's deadline has passed.
    Expired,
    /// The key is at its machine limit and the machine is not bound.
    LimitExceeded,
    /// No such key.
    Invalid,
}

impl ActivationOutcome {
    /// Wire-level status tag for this outcome.
    pub fn status(&self) -> &'static str {
        match self {
            Self::Activated { .. } => "activated",
            Self::Valid { .. } => "valid",
            Self::Expired => "expired",
            Self::LimitExceeded => "limit_exceeded",
            Self::Invalid => "invalid",
        }
    }

    /// Whether the request succeeded (the key is usable on this machine).
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Activated { .. } | Self::Valid { .. })
    }
}

// ---------------------------------------------------------------------------
// Partial edit
// ---------------------------------------------------------------------------

/// Admin-supplied partial update for a key record. Omitted fields are
/// left untouched.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct KeyEdit {
    /// New grant length: positive recomputes the deadline from the moment
    /// of the edit, 0 clears it.
    pub expiration_days: Option<u32>,
    pub machine_limit: Option<u32>,
    pub activated: Option<bool>,
}

impl KeyEdit {
    pub fn is_empty(&self) -> bool {
        self.expiration_days.is_none() && self.machine_limit.is_none() && self.activated.is_none()
    }
}

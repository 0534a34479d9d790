//! Error types for the keystore.

use std::fmt;

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Failure while reading or writing the persistent key table.
///
/// An unreadable key store is a configuration error and is surfaced to the
/// caller; it is never silently treated as an empty collection (unlike the
/// audit log, which is best-effort).
#[derive(Debug)]
pub enum StoreError {
    /// Could not read the backing file.
    Read(String),
    /// Could not write the backing file.
    Write(String),
    /// The backing file exists but does not parse as a key table.
    Corrupt(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(msg) => write!(f, "store read error: {}", msg),
            Self::Write(msg) => write!(f, "store write error: {}", msg),
            Self::Corrupt(msg) => write!(f, "store corrupt: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

//! Access control: basic-auth principals and HMAC-signed webhook callers.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Principals
// ---------------------------------------------------------------------------

/// Resolved caller role. Gates authorization per endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Full administrative access.
    Admin,
    /// Secondary billing/user credentials; may issue keys but not edit them.
    User,
    /// Synthetic principal for a verified webhook callback. Not a human user.
    BillingConfirmation,
}

impl Role {
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
            Role::BillingConfirmation => "billing_confirmation",
        }
    }
}

/// Resolved identity of an authenticated caller.
#[derive(Clone, Debug)]
pub struct Principal {
    pub role: Role,
    /// Present for basic-auth principals; webhook principals have none.
    pub username: Option<String>,
}

impl Principal {
    /// Name to attribute audited actions to.
    pub fn audit_name(&self) -> String {
        self.username
            .clone()
            .unwrap_or_else(|| self.role.label().to_string())
    }
}

// ---------------------------------------------------------------------------
// Authentication config
// ---------------------------------------------------------------------------

/// Static credential table, built once at startup from externally supplied
/// secrets. Exactly two basic-auth principals plus one webhook secret.
/// Zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct AuthConfig {
    admin_password: String,
    billing_password: String,
    webhook_secret: Vec<u8>,
}

impl AuthConfig {
    pub fn new(
        admin_password: impl Into<String>,
        billing_password: impl Into<String>,
        webhook_secret: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            admin_password: admin_password.into(),
            billing_password: billing_password.into(),
            webhook_secret: webhook_secret.into(),
        }
    }

    /// Resolve the caller identity for one request.
    ///
    /// Schemes are checked in precedence order: a signature header, when
    /// present, is verified against the raw body and never falls through to
    /// basic auth on mismatch; otherwise credentials are matched against the
    /// static two-user table.
    pub fn authenticate(
        &self,
        authorization: Option<&str>,
        webhook_signature: Option<&str>,
        body: &[u8],
    ) -> Option<Principal> {
        if let Some(signature) = webhook_signature {
            if !verify_webhook_signature(&self.webhook_secret, body, signature) {
                tracing::warn!("webhook request could not be verified as legitimate");
                return None;
            }
            return Some(Principal {
                role: Role::BillingConfirmation,
                username: None,
            });
        }

        let (username, password) = parse_basic(authorization?)?;
        let role = match username.as_str() {
            "admin" => passwords_match(&password, &self.admin_password).then_some(Role::Admin),
            "billing" => passwords_match(&password, &self.billing_password).then_some(Role::User),
            _ => None,
        }?;
        Some(Principal {
            role,
            username: Some(username),
        })
    }
}

/// Decode a `Basic` authorization header into (username, password).
fn parse_basic(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Constant-time password comparison over SHA-256 digests, so neither
/// content nor length of the configured secret leaks through timing.
fn passwords_match(provided: &str, expected: &str) -> bool {
    let provided = Sha256::digest(provided.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    provided.as_slice().ct_eq(expected.as_slice()).into()
}

/// Verify an HMAC-SHA256 hex signature over the raw request body.
pub fn verify_webhook_signature(secret: &[u8], body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    // verify_slice is constant-time
    mac.verify_slice(&signature).is_ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthConfig {
        AuthConfig::new("admin-pw", "billing-pw", b"webhook-secret".to_vec())
    }

    fn basic(username: &str, password: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{}:{}", username, password)))
    }

    fn sign(secret: &[u8], body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    // === Basic auth ===

    #[test]
    fn test_admin_credentials() {
        let principal = config()
            .authenticate(Some(&basic("admin", "admin-pw")), None, b"")
            .unwrap();
        assert_eq!(principal.role, Role::Admin);
        assert_eq!(principal.username.as_deref(), Some("admin"));
    }

    #[test]
    fn test_billing_credentials_map_to_user_role() {
        let principal = config()
            .authenticate(Some(&basic("billing", "billing-pw")), None, b"")
            .unwrap();
        assert_eq!(principal.role, Role::User);
        assert!(!principal.role.is_admin());
    }

    #[test]
    fn test_wrong_password_rejected() {
        assert!(config()
            .authenticate(Some(&basic("admin", "nope")), None, b"")
            .is_none());
    }

    #[test]
    fn test_unknown_user_rejected() {
        assert!(config()
            .authenticate(Some(&basic("root", "admin-pw")), None, b"")
            .is_none());
    }

    #[test]
    fn test_missing_credentials_rejected() {
        assert!(config().authenticate(None, None, b"").is_none());
        assert!(config().authenticate(Some("Bearer token"), None, b"").is_none());
        assert!(config().authenticate(Some("Basic not-base64!"), None, b"").is_none());
    }

    // === Webhook signatures ===

    #[test]
    fn test_valid_webhook_signature() {
        let body = br#"{"order": 42}"#;
        let signature = sign(b"webhook-secret", body);
        let principal = config().authenticate(None, Some(&signature), body).unwrap();
        assert_eq!(principal.role, Role::BillingConfirmation);
        assert_eq!(principal.username, None);
        assert_eq!(principal.audit_name(), "billing_confirmation");
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let body = br#"{"order": 42}"#;
        let signature = sign(b"webhook-secret", b"different body");
        assert!(config().authenticate(None, Some(&signature), body).is_none());
    }

    #[test]
    fn test_garbage_signature_rejected() {
        assert!(config().authenticate(None, Some("not hex"), b"body").is_none());
    }

    #[test]
    fn test_bad_signature_does_not_fall_through_to_basic_auth() {
        // Valid basic credentials must not rescue a failed signature check.
        let header = basic("admin", "admin-pw");
        assert!(config()
            .authenticate(Some(&header), Some("deadbeef"), b"body")
            .is_none());
    }

    #[test]
    fn test_signature_takes_precedence_over_credentials() {
        let body = b"payload";
        let signature = sign(b"webhook-secret", body);
        let header = basic("admin", "admin-pw");
        let principal = config()
            .authenticate(Some(&header), Some(&signature), body)
            .unwrap();
        assert_eq!(principal.role, Role::BillingConfirmation);
    }
}

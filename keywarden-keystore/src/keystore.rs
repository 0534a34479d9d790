//! Main keystore: the license key lifecycle engine.
//!
//! Every operation is a full load → compute → save cycle over the backing
//! table, executed under one process-wide lock so concurrent requests
//! against overlapping keys cannot interleave. Two racing activations for a
//! key's last machine slot resolve to exactly one `Activated`.

use crate::audit::{AuditAction, AuditEvent, AuditSinkSync, ClientInfo};
use crate::error::StoreError;
use crate::storage::StorageBackend;
use crate::types::{ActivationOutcome, KeyEdit, LicenseKey};

use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct Keystore {
    storage: Arc<dyn StorageBackend>,
    audit: Arc<dyn AuditSinkSync>,
    /// Serializes the read-modify-write cycle of every operation.
    lock: Mutex<()>,
}

impl Keystore {
    /// Create a new keystore with the given storage backend and audit sink.
    pub fn new(storage: Arc<dyn StorageBackend>, audit: Arc<dyn AuditSinkSync>) -> Self {
        Self {
            storage,
            audit,
            lock: Mutex::new(()),
        }
    }

    // -----------------------------------------------------------------------
    // Key generation
    // -----------------------------------------------------------------------

    /// Mint and persist a fresh license key.
    ///
    /// The deadline is fixed at issue time: `now + expiration_days` for a
    /// positive grant length, none for 0. Always succeeds barring storage
    /// failure.
    pub async fn generate(
        &self,
        expiration_days: u32,
        machine_limit: u32,
        product_id: &str,
        client: &ClientInfo,
    ) -> Result<LicenseKey, StoreError> {
        let _guard = self.lock.lock().await;
        let mut keys = self.storage.load()?;

        let record = LicenseKey::issue(expiration_days, machine_limit, product_id, Utc::now());
        keys.push(record.clone());
        self.storage.save(&keys)?;

        self.audit.record(
            AuditEvent::new(AuditAction::GenerateKey, client.clone())
                .with_key(record.key.as_str())
                .with_product_id(product_id),
        );
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Activation / validation
    // -----------------------------------------------------------------------

    /// Bind a machine to a key, or re-validate an existing binding.
    ///
    /// Branches are evaluated in a fixed order: unknown key, expired key,
    /// already-bound machine, machine limit, new binding. An already-bound
    /// machine short-circuits before the limit check, so re-validation stays
    /// idempotent even on a full key.
    ///
    /// Every outcome is audited, including rejections.
    pub async fn activate_or_validate(
        &self,
        key: &str,
        machine_id: &str,
        client: &ClientInfo,
    ) -> Result<ActivationOutcome, StoreError> {
        let _guard = self.lock.lock().await;
        let mut keys = self.storage.load()?;
        let now = Utc::now();

        let Some(entry) = keys.iter_mut().find(|k| k.key.as_str() == key) else {
            self.audit.record(
                AuditEvent::new(AuditAction::InvalidKeyAttempt, client.clone())
                    .with_key(key)
                    .with_machine_id(machine_id)
                    .warning(),
            );
            return Ok(ActivationOutcome::Invalid);
        };

        if entry.is_expired(now) {
            self.audit.record(
                AuditEvent::new(AuditAction::KeyExpired, client.clone())
                    .with_key(key)
                    .with_machine_id(machine_id)
                    .warning(),
            );
            return Ok(ActivationOutcome::Expired);
        }

        if entry.machine_ids.iter().any(|m| m == machine_id) {
            let product_id = entry.product_id.clone();
            self.audit.record(
                AuditEvent::new(AuditAction::ValidateKey, client.clone())
                    .with_key(key)
                    .with_machine_id(machine_id),
            );
            return Ok(ActivationOutcome::Valid { product_id });
        }

        if entry.machine_ids.len() as u32 >= entry.machine_limit {
            self.audit.record(
                AuditEvent::new(AuditAction::MachineLimitExceeded, client.clone())
                    .with_key(key)
                    .with_machine_id(machine_id)
                    .warning(),
            );
            return Ok(ActivationOutcome::LimitExceeded);
        }

        entry.machine_ids.push(machine_id.to_string());
        entry.activated = true;
        let product_id = entry.product_id.clone();
        self.storage.save(&keys)?;

        self.audit.record(
            AuditEvent::new(AuditAction::ActivateKey, client.clone())
                .with_key(key)
                .with_machine_id(machine_id),
        );
        Ok(ActivationOutcome::Activated { product_id })
    }

    // -----------------------------------------------------------------------
    // Bulk expiration extension
    // -----------------------------------------------------------------------

    /// Extend the deadline of every key in a product by `additional_days`.
    ///
    /// Keys with no deadline stay unlimited; they are counted as touched but
    /// not retroactively limited. Returns the number of matching records.
    pub async fn update_expiration(
        &self,
        product_id: &str,
        additional_days: u32,
        client: &ClientInfo,
    ) -> Result<usize, StoreError> {
        let _guard = self.lock.lock().await;
        let mut keys = self.storage.load()?;

        let mut touched = 0;
        for entry in keys.iter_mut().filter(|k| k.product_id == product_id) {
            if let Some(date) = entry.expiration_date {
                entry.expiration_date = Some(date + Duration::days(i64::from(additional_days)));
            }
            touched += 1;
        }
        self.storage.save(&keys)?;

        self.audit.record(
            AuditEvent::new(AuditAction::UpdateExpirationForProduct, client.clone())
                .with_product_id(product_id),
        );
        Ok(touched)
    }

    // -----------------------------------------------------------------------
    // Administrative edits
    // -----------------------------------------------------------------------

    /// Apply a partial update to a key record.
    ///
    /// A positive `expiration_days` recomputes the deadline from the moment
    /// of the edit (overwrite, not extend); 0 clears it. Returns the updated
    /// record, or `None` if the key does not exist.
    pub async fn edit_key(
        &self,
        key: &str,
        edit: &KeyEdit,
        client: &ClientInfo,
    ) -> Result<Option<LicenseKey>, StoreError> {
        let _guard = self.lock.lock().await;
        let mut keys = self.storage.load()?;

        let Some(entry) = keys.iter_mut().find(|k| k.key.as_str() == key) else {
            return Ok(None);
        };

        if let Some(days) = edit.expiration_days {
            entry.expiration_days = days;
            entry.expiration_date = if days > 0 {
                Some(Utc::now() + Duration::days(i64::from(days)))
            } else {
                None
            };
        }
        if let Some(limit) = edit.machine_limit {
            entry.machine_limit = limit.max(1);
        }
        if let Some(activated) = edit.activated {
            entry.activated = activated;
        }

        let updated = entry.clone();
        self.storage.save(&keys)?;

        self.audit
            .record(AuditEvent::new(AuditAction::EditKeyInfo, client.clone()).with_key(key));
        Ok(Some(updated))
    }

    /// Remove a key record. Returns false if no such key exists.
    pub async fn delete_key(&self, key: &str, client: &ClientInfo) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut keys = self.storage.load()?;

        let before = keys.len();
        keys.retain(|k| k.key.as_str() != key);
        if keys.len() == before {
            return Ok(false);
        }
        self.storage.save(&keys)?;

        self.audit
            .record(AuditEvent::new(AuditAction::DeleteKey, client.clone()).with_key(key));
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Read-only lookup. Audited as a privileged read when the key exists.
    pub async fn key_info(
        &self,
        key: &str,
        client: &ClientInfo,
    ) -> Result<Option<LicenseKey>, StoreError> {
        let _guard = self.lock.lock().await;
        let keys = self.storage.load()?;

        let found = keys.iter().find(|k| k.key.as_str() == key).cloned();
        if found.is_some() {
            self.audit
                .record(AuditEvent::new(AuditAction::GetKeyInfo, client.clone()).with_key(key));
        }
        Ok(found)
    }

    /// Snapshot of the whole table (purged of expired records by the load).
    pub async fn list_keys(&self) -> Result<Vec<LicenseKey>, StoreError> {
        let _guard = self.lock.lock().await;
        self.storage.load()
    }
}

//! API credential issuance, validation and revocation.
//!
//! Only the SHA-256 hex digest of a secret is stored. The plaintext is returned
//! once by [`Credentials::issue`] and cannot be recovered afterwards.

use std::sync::Arc;

use alloy::hex;
use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{GhostpayError, Result};
use crate::store::InvoiceStore;

/// Request header carrying the API key.
pub const API_KEY_HEADER: &str = "X-GhostPay-Key";

const KEY_PREFIX: &str = "gp_";
const KEY_RANDOM_LEN: usize = 32;
const DISPLAY_PREFIX_LEN: usize = 8;

/// A stored API credential. `key_hash` is the only trace of the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiCredential {
    pub id: String,
    pub label: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    /// First characters of the secret, for display.
    pub key_prefix: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Result of [`Credentials::issue`]: the stored record plus the one-time plaintext.
#[derive(Clone)]
pub struct IssuedCredential {
    pub credential: ApiCredential,
    pub secret: String,
}

impl std::fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("credential", &self.credential)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// SHA-256 hex digest of a secret.
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

fn generate_secret() -> String {
    let random: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{KEY_PREFIX}{random}")
}

/// Credential operations over the shared store.
#[derive(Clone)]
pub struct Credentials {
    store: Arc<InvoiceStore>,
}

impl Credentials {
    pub fn new(store: Arc<InvoiceStore>) -> Self {
        Self { store }
    }

    /// Create a credential and return its plaintext secret once.
    pub fn issue(&self, label: &str) -> Result<IssuedCredential> {
        let label = label.trim();
        if label.is_empty() {
            return Err(GhostpayError::Validation("label is required".to_string()));
        }

        let secret = generate_secret();
        let credential = ApiCredential {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.to_string(),
            key_hash: hash_secret(&secret),
            key_prefix: secret.chars().take(DISPLAY_PREFIX_LEN).collect(),
            active: true,
            created_at: Utc::now(),
            last_used_at: None,
        };
        self.store.insert_credential(&credential)?;

        tracing::info!(credential_id = %credential.id, label = %credential.label, "API key issued");
        Ok(IssuedCredential { credential, secret })
    }

    /// Resolve a presented secret to its active credential and stamp `last_used_at`.
    ///
    /// Unknown and revoked secrets both yield [`GhostpayError::Unauthorized`].
    pub fn validate(&self, secret: &str) -> Result<ApiCredential> {
        let presented = hash_secret(secret.trim());
        let Some(mut credential) = self.store.credential_by_hash(&presented)? else {
            return Err(GhostpayError::Unauthorized);
        };

        let matches: bool = credential
            .key_hash
            .as_bytes()
            .ct_eq(presented.as_bytes())
            .into();
        if !matches || !credential.active {
            return Err(GhostpayError::Unauthorized);
        }

        let now = Utc::now();
        if self.store.touch_credential(&credential.id, now)? {
            credential.last_used_at = Some(now);
        }
        Ok(credential)
    }

    /// Permanently deactivate a credential.
    pub fn revoke(&self, id: &str) -> Result<()> {
        if self.store.revoke_credential(id)? {
            tracing::info!(credential_id = %id, "API key revoked");
            return Ok(());
        }
        match self.store.get_credential(id)? {
            Some(_) => Ok(()),
            None => Err(GhostpayError::NotFound(format!("credential {id}"))),
        }
    }

    /// Delete a revoked credential. Active credentials must be revoked first.
    pub fn delete(&self, id: &str) -> Result<()> {
        if self.store.delete_revoked_credential(id)? {
            tracing::info!(credential_id = %id, "API key deleted");
            return Ok(());
        }
        match self.store.get_credential(id)? {
            Some(_) => Err(GhostpayError::Validation(
                "only revoked keys can be deleted".to_string(),
            )),
            None => Err(GhostpayError::NotFound(format!("credential {id}"))),
        }
    }

    pub fn list(&self, page: u32, limit: u32) -> Result<Vec<ApiCredential>> {
        self.store.list_credentials(page, limit)
    }
}

//! Create and read orchestration on top of the file store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::captcha::CaptchaVerifier;
use crate::error::ServiceError;
use crate::store::{EncryptedContent, Envelope, FileStore, SecretRecord, PART_DELIMITER};

/// Input-side limits applied by [`SecretService::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretPolicy {
    pub max_secret_size_bytes: usize,
    pub max_custom_name_length: usize,
    /// Lifetimes a requested expiry may snap to.
    pub allowed_expiry: Vec<Duration>,
    /// Lifetime used when the client does not ask for one.
    pub default_expiry: Duration,
}

impl Default for SecretPolicy {
    fn default() -> Self {
        Self {
            max_secret_size_bytes: 1024 * 1024,
            max_custom_name_length: 32,
            allowed_expiry: [600, 1800, 3600, 86_400, 604_800]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
            default_expiry: Duration::from_secs(600),
        }
    }
}

/// A create request as it arrives on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSecret {
    pub encrypted_content: EncryptedContent,
    #[serde(default)]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_views: Option<i64>,
    #[serde(default)]
    pub captcha_token: Option<String>,
}

/// What a successful read hands back: the client ciphertext and its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretView {
    pub encrypted_content: EncryptedContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub is_burn_after_reading: bool,
}

pub struct SecretService {
    store: FileStore,
    /// Present whenever a server key is configured; used to open old records
    /// even when new ones are no longer sealed.
    envelope: Option<Envelope>,
    seal_new: bool,
    captcha: Option<Arc<dyn CaptchaVerifier>>,
    policy: SecretPolicy,
}

impl SecretService {
    pub fn new(store: FileStore, policy: SecretPolicy) -> Self {
        Self {
            store,
            envelope: None,
            seal_new: false,
            captcha: None,
            policy,
        }
    }

    /// Open stored envelopes with `envelope`; seal new secrets too when `seal_new`.
    pub fn with_envelope(mut self, envelope: Envelope, seal_new: bool) -> Self {
        self.envelope = Some(envelope);
        self.seal_new = seal_new;
        self
    }

    /// Require a passing CAPTCHA on every create and read.
    pub fn with_captcha(mut self, verifier: Arc<dyn CaptchaVerifier>) -> Self {
        self.captcha = Some(verifier);
        self
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn policy(&self) -> &SecretPolicy {
        &self.policy
    }

    /// Validate, seal and persist a new secret. Returns its id only.
    pub async fn create(&self, req: NewSecret, remote_ip: &str) -> Result<Uuid, ServiceError> {
        let custom_name = match req.custom_name {
            Some(name) if !name.is_empty() => {
                self.validate_name(&name)?;
                Some(name)
            }
            _ => None,
        };
        let combined = self.combine_parts(&req.encrypted_content)?;
        let burn = match req.max_views {
            None => false,
            Some(1) => true,
            Some(_) => return Err(ServiceError::invalid("maxViews may only be 1")),
        };

        self.check_captcha(req.captcha_token.as_deref(), remote_ip).await?;

        let now = Utc::now();
        let expires_at = if burn {
            None
        } else {
            Some(normalize_expiry(req.expires_at, now, &self.policy)?)
        };

        let (encrypted_payload, server_encrypted) = match &self.envelope {
            Some(envelope) if self.seal_new => (envelope.seal(combined.as_bytes(), "")?, true),
            _ => (combined.into_bytes(), false),
        };

        let record = SecretRecord {
            id: Uuid::new_v4(),
            custom_name,
            created_at: now,
            expires_at,
            is_burn_after_reading: burn,
            server_encrypted,
            encrypted_payload,
        };
        self.store.create(&record)?;

        info!(
            id = %record.id,
            name = record.custom_name.as_deref().unwrap_or(""),
            burn,
            expires_at = ?record.expires_at,
            "secret created"
        );
        Ok(record.id)
    }

    pub async fn read_by_id(
        &self,
        id: &str,
        captcha_token: Option<&str>,
        remote_ip: &str,
    ) -> Result<SecretView, ServiceError> {
        let id = parse_secret_id(id)?;
        self.check_captcha(captcha_token, remote_ip).await?;
        let record = self.store.get_by_id(&id)?;
        self.reveal(record)
    }

    pub async fn read_by_name(
        &self,
        name: &str,
        captcha_token: Option<&str>,
        remote_ip: &str,
    ) -> Result<SecretView, ServiceError> {
        if name.is_empty() {
            return Err(ServiceError::invalid("Missing secret name"));
        }
        self.validate_name(name)?;
        self.check_captcha(captcha_token, remote_ip).await?;
        let record = self.store.get_by_custom_name(name)?;
        self.reveal(record)
    }

    fn reveal(&self, record: Option<SecretRecord>) -> Result<SecretView, ServiceError> {
        let record = record.ok_or(ServiceError::NotFound)?;

        if record.is_expired(Utc::now()) {
            if let Err(e) = self.store.delete(&record.id) {
                warn!(error = %e, id = %record.id, "failed to delete expired secret");
            }
            return Err(ServiceError::Expired);
        }

        let encrypted_content = self.unwrap_payload(&record)?;

        // Only the reader whose delete removed the file may return the content.
        if record.is_burn_after_reading {
            if !self.store.delete(&record.id)? {
                debug!(id = %record.id, "burn secret claimed by a concurrent reader");
                return Err(ServiceError::NotFound);
            }
            info!(id = %record.id, "secret burned after reading");
        }

        Ok(SecretView {
            encrypted_content,
            expires_at: record.expires_at,
            is_burn_after_reading: record.is_burn_after_reading,
        })
    }

    fn unwrap_payload(&self, record: &SecretRecord) -> Result<EncryptedContent, ServiceError> {
        let split = |bytes: &[u8]| {
            std::str::from_utf8(bytes)
                .ok()
                .and_then(EncryptedContent::split)
                .ok_or_else(|| {
                    ServiceError::Internal(format!("secret {} has a malformed payload", record.id))
                })
        };

        if !record.server_encrypted {
            return split(record.encrypted_payload.as_slice());
        }
        let envelope = self.envelope.as_ref().ok_or_else(|| {
            ServiceError::Internal(format!(
                "secret {} is server-encrypted but no server key is configured",
                record.id
            ))
        })?;
        let plain = envelope.open(&record.encrypted_payload, "")?;
        split(plain.as_slice())
    }

    fn combine_parts(&self, content: &EncryptedContent) -> Result<String, ServiceError> {
        for (field, part) in [
            ("encrypted", &content.encrypted),
            ("salt", &content.salt),
            ("iv", &content.iv),
        ] {
            if part.is_empty() {
                return Err(ServiceError::invalid(format!("encryptedContent.{field} is required")));
            }
            if part.contains(PART_DELIMITER) {
                return Err(ServiceError::invalid(format!(
                    "encryptedContent.{field} must not contain '{PART_DELIMITER}'"
                )));
            }
        }
        let combined = content.join();
        if combined.len() > self.policy.max_secret_size_bytes {
            return Err(ServiceError::invalid(format!(
                "secret exceeds the maximum size of {} bytes",
                self.policy.max_secret_size_bytes
            )));
        }
        Ok(combined)
    }

    fn validate_name(&self, name: &str) -> Result<(), ServiceError> {
        if !name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ServiceError::invalid(
                "custom name can only contain letters and numbers (A-Z, a-z, 0-9)",
            ));
        }
        if name.len() > self.policy.max_custom_name_length {
            return Err(ServiceError::invalid(format!(
                "custom name must be at most {} characters",
                self.policy.max_custom_name_length
            )));
        }
        Ok(())
    }

    async fn check_captcha(&self, token: Option<&str>, remote_ip: &str) -> Result<(), ServiceError> {
        let Some(verifier) = &self.captcha else {
            return Ok(());
        };
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or(ServiceError::CaptchaFailed)?;
        let outcome = verifier.verify(token, remote_ip).await?;
        if !outcome.success {
            return Err(ServiceError::CaptchaFailed);
        }
        Ok(())
    }
}

/// Snap a requested expiry to `now + d` for the allowed lifetime `d` it lies
/// within a second of. No request means `now + default_expiry`.
pub fn normalize_expiry(
    requested: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    policy: &SecretPolicy,
) -> Result<DateTime<Utc>, ServiceError> {
    let to_chrono = |d: Duration| {
        chrono::Duration::from_std(d)
            .map_err(|_| ServiceError::Internal(format!("expiry {d:?} out of range")))
    };

    let Some(requested) = requested else {
        return Ok(now + to_chrono(policy.default_expiry)?);
    };
    let wanted = requested - now;
    let tolerance = chrono::Duration::seconds(1);
    for allowed in &policy.allowed_expiry {
        let allowed = to_chrono(*allowed)?;
        if wanted >= allowed - tolerance && wanted <= allowed + tolerance {
            return Ok(now + allowed);
        }
    }

    let choices: Vec<String> = policy
        .allowed_expiry
        .iter()
        .map(|d| humantime::format_duration(*d).to_string())
        .collect();
    Err(ServiceError::invalid(format!(
        "Invalid expiry time. Allowed values are: {}",
        choices.join(", ")
    )))
}

/// Accept only the canonical lowercase UUIDv4 text form, case-insensitively.
fn parse_secret_id(raw: &str) -> Result<Uuid, ServiceError> {
    let invalid = || ServiceError::invalid("Invalid secret ID format");
    let lower = raw.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    if bytes.len() != 36 {
        return Err(invalid());
    }
    for (i, b) in bytes.iter().enumerate() {
        let ok = match i {
            8 | 13 | 18 | 23 => *b == b'-',
            14 => *b == b'4',
            19 => matches!(b, b'8' | b'9' | b'a' | b'b'),
            _ => b.is_ascii_hexdigit(),
        };
        if !ok {
            return Err(invalid());
        }
    }
    Uuid::parse_str(&lower).map_err(|_| invalid())
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Separator between the three client-side ciphertext parts in the stored payload.
pub const PART_DELIMITER: char = '.';

/// One persisted secret. Written once as `<id>.json`, never updated.
///
/// Metadata stays in the clear so the sweep can evict without decrypting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id: Uuid,
    /// Optional alias; unique among active secrets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    pub created_at: DateTime<Utc>,
    /// `None` means no time-based expiry (always the case for burn secrets).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub is_burn_after_reading: bool,
    /// Whether `encrypted_payload` is wrapped in the server envelope.
    #[serde(default)]
    pub server_encrypted: bool,
    #[serde(with = "base64_bytes")]
    pub encrypted_payload: Vec<u8>,
}

impl SecretRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if now > exp)
    }

    /// True when `custom_name` is set and equals `name`.
    pub fn has_name(&self, name: &str) -> bool {
        self.custom_name.as_deref() == Some(name)
    }
}

/// Client-side ciphertext as it travels over the wire. The server never sees
/// the password that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedContent {
    pub encrypted: String,
    pub salt: String,
    pub iv: String,
}

impl EncryptedContent {
    /// `encrypted.salt.iv`
    pub fn join(&self) -> String {
        format!(
            "{}{PART_DELIMITER}{}{PART_DELIMITER}{}",
            self.encrypted, self.salt, self.iv
        )
    }

    /// Inverse of [`EncryptedContent::join`]; `None` unless exactly three parts.
    pub fn split(combined: &str) -> Option<Self> {
        let mut parts = combined.split(PART_DELIMITER);
        let encrypted = parts.next()?;
        let salt = parts.next()?;
        let iv = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            encrypted: encrypted.to_owned(),
            salt: salt.to_owned(),
            iv: iv.to_owned(),
        })
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{VaultError, VaultResult};

pub const ENVELOPE_VERSION: u8 = 2;

pub fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// Current on-disk envelope: `{"version":2,"salt":..,"iv":..,"encrypted":..}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeV2 {
    pub version: u8,
    /// 32 bytes, hex.
    pub salt: String,
    /// 16 bytes, hex.
    pub iv: String,
    /// Base64 AES-256-CBC ciphertext.
    #[serde(alias = "ciphertext")]
    pub encrypted: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptedEnvelope {
    /// Passphrase ciphertext written before envelopes existed.
    Legacy(String),
    V2(EnvelopeV2),
}

impl EncryptedEnvelope {
    /// Classifies raw container text. Anything that is not a JSON object is
    /// assumed to be legacy ciphertext; whether it actually is gets decided
    /// at decryption time.
    ///
    /// A JSON object is never legacy ciphertext (that is base64), so it is
    /// not sent down the legacy path: an object without a usable `version: 2`
    /// envelope fails here with `UnsupportedFormat` (other numeric version)
    /// or `Format` (no version, missing fields).
    pub fn parse(raw: &str) -> VaultResult<Self> {
        let trimmed = raw.trim();
        let value = match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value) if value.is_object() => value,
            _ => return Ok(EncryptedEnvelope::Legacy(trimmed.to_string())),
        };

        match value.get("version").and_then(serde_json::Value::as_u64) {
            Some(v) if v == u64::from(ENVELOPE_VERSION) => {
                let envelope: EnvelopeV2 = serde_json::from_value(value)
                    .map_err(|e| VaultError::Format(format!("malformed v2 envelope: {e}")))?;
                Ok(EncryptedEnvelope::V2(envelope))
            }
            Some(other) => Err(VaultError::UnsupportedFormat(format!(
                "envelope version {other}"
            ))),
            None => Err(VaultError::Format(
                "JSON container without an envelope version".to_string(),
            )),
        }
    }

    pub fn format_version(&self) -> FormatVersion {
        match self {
            EncryptedEnvelope::Legacy(_) => FormatVersion::Legacy,
            EncryptedEnvelope::V2(_) => FormatVersion::V2,
        }
    }

    /// Serialized form handed to the host for writing.
    pub fn to_wire(&self) -> VaultResult<String> {
        match self {
            EncryptedEnvelope::Legacy(raw) => Ok(raw.clone()),
            EncryptedEnvelope::V2(envelope) => Ok(serde_json::to_string(envelope)?),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FormatVersion {
    Legacy = 1,
    V2 = 2,
}

impl FormatVersion {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    #[serde(default = "new_uuid")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub notes: String,
    /// Empty for entries at the root.
    #[serde(default)]
    pub folder_path: String,
    #[serde(default)]
    pub icon: u32,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    #[serde(default = "new_uuid")]
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub parent_path: String,
    #[serde(default)]
    pub children: Vec<Folder>,
}

impl Folder {
    /// Number of folders in this subtree, `self` included.
    pub fn subtree_len(&self) -> usize {
        1 + self.children.iter().map(Folder::subtree_len).sum::<usize>()
    }
}

/// Plaintext vault contents. The root folder is implicit and never stored.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Database {
    #[serde(default)]
    pub entries: Vec<Entry>,
    #[serde(default)]
    pub folders: Vec<Folder>,
}

impl Database {
    pub fn folder_count(&self) -> usize {
        self.folders.iter().map(Folder::subtree_len).sum()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportStats {
    pub entries_imported: usize,
    pub folders_imported: usize,
    pub source_file: String,
}

//! Error types shared by the engine, the lockout service and the importer.

use thiserror::Error;

/// Coarse classification of a [`VaultError`], stable enough for a UI to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    Format,
    UnsupportedFormat,
    Validation,
    Locked,
    Encryption,
}

#[derive(Error, Debug)]
pub enum VaultError {
    /// Wrong password, or data that decrypted to garbage. The two are not
    /// distinguishable at this layer.
    #[error("Authentication failed: wrong password or corrupted data")]
    Authentication,

    #[error("Invalid or corrupted container: {0}")]
    Format(String),

    #[error("Unsupported container format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    /// `remaining_ms` is meaningless when `permanent` is set.
    #[error("Vault is locked after too many failed attempts")]
    Locked { remaining_ms: u64, permanent: bool },

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::Authentication => ErrorKind::Authentication,
            VaultError::Format(_) | VaultError::Serialization(_) => ErrorKind::Format,
            VaultError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            VaultError::Validation(_) => ErrorKind::Validation,
            VaultError::Locked { .. } => ErrorKind::Locked,
            VaultError::Encryption(_) => ErrorKind::Encryption,
        }
    }
}

pub type VaultResult<T> = Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_groups_serialization_with_format() {
        let err: VaultError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Format);
        assert_eq!(
            VaultError::Locked { remaining_ms: 10, permanent: false }.kind(),
            ErrorKind::Locked
        );
    }
}

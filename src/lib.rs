//! Security core of the vaulty password vault: envelope encryption for the
//! vault file, master-password lockout, and KeePass import.

pub mod config;
pub mod crypto;
pub mod error;
pub mod import;
#[cfg(feature = "kdbx")]
pub mod kdbx;
pub mod lockout;
pub mod models;
pub mod storage;
pub mod telemetry;

pub use config::{CoreConfig, ImportLimits};
pub use crypto::{Decrypted, EncryptionEngine};
pub use error::{ErrorKind, VaultError, VaultResult};
pub use import::{ContainerOpener, ImportOutcome, Importer};
pub use lockout::{Clock, LockoutService, SecurityStore, StatusSnapshot, SystemClock, SystemKey};
pub use models::{Database, EncryptedEnvelope, Entry, Folder, FormatVersion, ImportStats};

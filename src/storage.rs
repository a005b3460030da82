//! Host-side file and keyring adapters. The core modules never call these
//! directly; a host wires them into [`crate::lockout::LockoutService`].

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use base64::Engine;
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::{debug, info};

use crate::config::CoreConfig;
use crate::lockout::{SecurityStore, SystemKey};

pub const VAULT_DIR: &str = ".terminal-vault";
pub const SECURITY_FILE: &str = "security.dat";
pub const CONFIG_FILE: &str = "config.json";
const KEYRING_SERVICE: &str = "terminal-vault";
const KEYRING_SYSTEM_KEY_USER: &str = "security-store-key";
const SYSTEM_KEY_LEN: usize = 32;

pub fn default_base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("Could not determine home directory"))?;
    Ok(home.join(VAULT_DIR))
}

pub fn config_path(base_dir: &Path) -> PathBuf {
    base_dir.join(CONFIG_FILE)
}

pub fn security_store_path(base_dir: &Path) -> PathBuf {
    base_dir.join(SECURITY_FILE)
}

/// Missing file means defaults.
pub fn load_config(base_dir: &Path) -> Result<CoreConfig> {
    let path = config_path(base_dir);
    if !path.exists() {
        return Ok(CoreConfig::default());
    }
    let raw = fs::read_to_string(&path)?;
    let cfg = CoreConfig::from_json_str(&raw)
        .map_err(|e| anyhow!("Invalid config at {}: {e}", path.display()))?;
    Ok(cfg)
}

pub fn save_config(base_dir: &Path, config: &CoreConfig) -> Result<()> {
    let data = serde_json::to_string_pretty(config)?;
    let path = config_path(base_dir);
    atomic_write(&path, data.as_bytes())?;
    restrict_file(&path)?;
    Ok(())
}

/// Encrypted lockout store kept in a single file. Deleting the file lifts
/// every lock it records.
#[derive(Debug, Clone)]
pub struct FileSecurityStore {
    path: PathBuf,
}

impl FileSecurityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(base_dir: &Path) -> Self {
        Self::new(security_store_path(base_dir))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SecurityStore for FileSecurityStore {
    fn load(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(&self.path)?))
    }

    fn save(&self, blob: &str) -> Result<()> {
        ensure_parent_dir(&self.path)?;
        atomic_write(&self.path, blob.as_bytes())?;
        restrict_file(&self.path)?;
        debug!(path = %self.path.display(), "security store written");
        Ok(())
    }

    fn location(&self) -> Option<String> {
        Some(self.path.display().to_string())
    }
}

/// Reads the security-store key from the OS keyring, creating one on first
/// use.
pub fn load_or_create_system_key() -> Result<SystemKey> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_SYSTEM_KEY_USER)?;
    match entry.get_password() {
        Ok(stored) => Ok(SystemKey::new(stored)),
        Err(keyring::Error::NoEntry) => {
            let mut raw = [0u8; SYSTEM_KEY_LEN];
            OsRng.fill_bytes(&mut raw);
            let encoded = base64::engine::general_purpose::STANDARD.encode(raw);
            entry
                .set_password(&encoded)
                .map_err(|e| anyhow!("Keyring write error: {e}"))?;
            info!("generated a new security store key");
            Ok(SystemKey::new(encoded))
        }
        Err(e) => Err(anyhow!("Keyring read error: {e}")),
    }
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }
        restrict_dir(parent)?;
        Ok(())
    } else {
        Err(anyhow!("Invalid store path"))
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| anyhow!("Invalid target path"))?;
    if !parent.exists() {
        fs::create_dir_all(parent)?;
        restrict_dir(parent)?;
    }

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.flush()?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .map_err(|e| anyhow!("Atomic write failed: {}", e.error))?;
    Ok(())
}

fn restrict_file(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if path.exists() {
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn restrict_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if path.exists() {
            fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

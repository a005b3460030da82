use aes::Aes256;
use base64::Engine;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use crate::config::{CoreConfig, DEFAULT_KDF_ITERATIONS};
use crate::error::{VaultError, VaultResult};
use crate::models::{ENVELOPE_VERSION, EncryptedEnvelope, EnvelopeV2, FormatVersion};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const SALT_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

const LEGACY_MAGIC: &[u8] = b"Salted__";
const LEGACY_SALT_LEN: usize = 8;

/// Result of a successful decryption.
pub struct Decrypted {
    pub plaintext: String,
    pub format_version: FormatVersion,
}

impl Decrypted {
    /// Legacy payloads should be written back through [`EncryptionEngine::encrypt`]
    /// on the next save.
    pub fn needs_migration(&self) -> bool {
        self.format_version < FormatVersion::V2
    }
}

impl std::fmt::Debug for Decrypted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decrypted")
            .field("plaintext", &"<redacted>")
            .field("format_version", &self.format_version)
            .finish()
    }
}

/// Password-based envelope encryption for the vault container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionEngine {
    iterations: u32,
}

impl Default for EncryptionEngine {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_KDF_ITERATIONS,
        }
    }
}

impl EncryptionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only engines sharing an iteration count can read each other's output.
    pub fn with_iterations(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(1),
        }
    }

    pub fn from_config(config: &CoreConfig) -> Self {
        Self::with_iterations(config.kdf_iterations)
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    fn derive_key(&self, password: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, self.iterations, &mut key[..]);
        key
    }

    /// Always writes the current envelope version with a fresh salt and IV.
    pub fn encrypt(&self, plaintext: &str, password: &str) -> VaultResult<EncryptedEnvelope> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);

        let key = self.derive_key(password, &salt);
        let cipher = Aes256CbcEnc::new_from_slices(&key[..], &iv)
            .map_err(|e| VaultError::Encryption(format!("cipher init: {e}")))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        Ok(EncryptedEnvelope::V2(EnvelopeV2 {
            version: ENVELOPE_VERSION,
            salt: hex::encode(salt),
            iv: hex::encode(iv),
            encrypted: base64::engine::general_purpose::STANDARD.encode(ciphertext),
        }))
    }

    /// Decrypts either envelope version. A plaintext that is not UTF-8 JSON is
    /// reported as [`VaultError::Authentication`].
    pub fn decrypt(&self, input: &str, password: &str) -> VaultResult<Decrypted> {
        let envelope = EncryptedEnvelope::parse(input)?;
        let format_version = envelope.format_version();
        let raw = match &envelope {
            EncryptedEnvelope::V2(env) => self.decrypt_v2(env, password)?,
            EncryptedEnvelope::Legacy(ciphertext) => {
                debug!("container is not a v2 envelope, trying legacy decryption");
                decrypt_legacy(ciphertext, password)?
            }
        };
        let plaintext = validate_plaintext(raw)?;
        Ok(Decrypted {
            plaintext,
            format_version,
        })
    }

    pub fn decrypt_bytes(&self, input: &[u8], password: &str) -> VaultResult<Decrypted> {
        let text = std::str::from_utf8(input)
            .map_err(|_| VaultError::Format("container is not valid UTF-8".to_string()))?;
        self.decrypt(text, password)
    }

    fn decrypt_v2(&self, env: &EnvelopeV2, password: &str) -> VaultResult<Zeroizing<Vec<u8>>> {
        let salt = decode_hex_field("salt", &env.salt, SALT_LEN)?;
        let iv = decode_hex_field("iv", &env.iv, IV_LEN)?;
        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(env.encrypted.as_bytes())
            .map_err(|e| VaultError::Format(format!("invalid ciphertext encoding: {e}")))?;

        let key = self.derive_key(password, &salt);
        let cipher = Aes256CbcDec::new_from_slices(&key[..], &iv)
            .map_err(|e| VaultError::Encryption(format!("cipher init: {e}")))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| VaultError::Authentication)
    }

    /// Runs [`Self::encrypt`] on the blocking pool so the caller's executor
    /// stays responsive during key derivation.
    pub async fn encrypt_async(
        &self,
        plaintext: String,
        password: String,
    ) -> VaultResult<EncryptedEnvelope> {
        let engine = *self;
        let password = Zeroizing::new(password);
        tokio::task::spawn_blocking(move || engine.encrypt(&plaintext, &password))
            .await
            .map_err(|e| VaultError::Encryption(format!("worker task failed: {e}")))?
    }

    pub async fn decrypt_async(&self, input: String, password: String) -> VaultResult<Decrypted> {
        let engine = *self;
        let password = Zeroizing::new(password);
        tokio::task::spawn_blocking(move || engine.decrypt(&input, &password))
            .await
            .map_err(|e| VaultError::Encryption(format!("worker task failed: {e}")))?
    }
}

fn decode_hex_field(name: &str, value: &str, expected: usize) -> VaultResult<Vec<u8>> {
    let bytes = hex::decode(value)
        .map_err(|e| VaultError::Format(format!("invalid {name} encoding: {e}")))?;
    if bytes.len() != expected {
        return Err(VaultError::Format(format!(
            "{name} must be {expected} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn validate_plaintext(raw: Zeroizing<Vec<u8>>) -> VaultResult<String> {
    let text = String::from_utf8(raw.to_vec()).map_err(|_| VaultError::Authentication)?;
    serde_json::from_str::<serde::de::IgnoredAny>(&text).map_err(|_| VaultError::Authentication)?;
    Ok(text)
}

// Legacy passphrase encryption (kept for migration). OpenSSL-compatible
// "Salted__" layout with EVP_BytesToKey(MD5, 1 round) key/IV derivation.
pub fn encrypt_legacy(plaintext: &str, password: &str) -> VaultResult<String> {
    let mut salt = [0u8; LEGACY_SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let material = evp_bytes_to_key(password.as_bytes(), &salt);
    let cipher = Aes256CbcEnc::new_from_slices(&material[..KEY_LEN], &material[KEY_LEN..])
        .map_err(|e| VaultError::Encryption(format!("cipher init: {e}")))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    let mut out = Vec::with_capacity(LEGACY_MAGIC.len() + LEGACY_SALT_LEN + ciphertext.len());
    out.extend_from_slice(LEGACY_MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&ciphertext);
    Ok(base64::engine::general_purpose::STANDARD.encode(out))
}

fn decrypt_legacy(raw: &str, password: &str) -> VaultResult<Zeroizing<Vec<u8>>> {
    let data = base64::engine::general_purpose::STANDARD
        .decode(raw.as_bytes())
        .map_err(|_| VaultError::Format("unrecognised container encoding".to_string()))?;
    let header_len = LEGACY_MAGIC.len() + LEGACY_SALT_LEN;
    if data.len() <= header_len || &data[..LEGACY_MAGIC.len()] != LEGACY_MAGIC {
        return Err(VaultError::Format(
            "legacy container is missing its salt header".to_string(),
        ));
    }
    let salt = &data[LEGACY_MAGIC.len()..header_len];
    let material = evp_bytes_to_key(password.as_bytes(), salt);
    let cipher = Aes256CbcDec::new_from_slices(&material[..KEY_LEN], &material[KEY_LEN..])
        .map_err(|e| VaultError::Encryption(format!("cipher init: {e}")))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&data[header_len..])
        .map(Zeroizing::new)
        .map_err(|_| VaultError::Authentication)
}

fn evp_bytes_to_key(password: &[u8], salt: &[u8]) -> Zeroizing<[u8; KEY_LEN + IV_LEN]> {
    let mut material = Zeroizing::new([0u8; KEY_LEN + IV_LEN]);
    let mut previous: Zeroizing<Vec<u8>> = Zeroizing::new(Vec::new());
    let mut filled = 0;
    while filled < material.len() {
        let mut hasher = Md5::new();
        hasher.update(&previous[..]);
        hasher.update(password);
        hasher.update(salt);
        let digest = hasher.finalize();
        let take = (material.len() - filled).min(digest.len());
        material[filled..filled + take].copy_from_slice(&digest[..take]);
        filled += take;
        previous = Zeroizing::new(digest.to_vec());
    }
    material
}

use std::path::Path;
use std::sync::{LazyLock, Mutex};

use anyhow::{Context, Result};
use rand::{rngs::OsRng, RngCore};
use scrypt::Params;
use tracing::warn;
use zeroize::ZeroizeOnDrop;

use crate::dirs;

/// Environment variable carrying master-key material. When set, the 32-byte
/// data-encryption key is derived from it with scrypt.
pub const MASTER_KEY_ENV: &str = "VAULT_MASTER_KEY";

const KEY_FILE: &str = ".master-key";
const SCRYPT_SALT: &[u8] = b"vault-mcp-salt";

// scrypt cost parameters. Adequate for a local development tool; rebuild with
// higher costs if the key file may leave the machine.
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// 32-byte data-encryption key. Zeroed on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for MasterKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Memoized resolution, keyed by the `(env value, data_dir)` fingerprint.
/// A changed fingerprint (different env material or a different directory)
/// invalidates the cache and re-resolves.
static KEY_CACHE: LazyLock<Mutex<Option<(String, [u8; 32])>>> =
    LazyLock::new(|| Mutex::new(None));

/// Obtain the master key for `data_dir`.
///
/// Resolution order:
/// 1. `VAULT_MASTER_KEY` environment variable, run through scrypt.
/// 2. `<data_dir>/.master-key` — exactly 32 raw bytes.
/// 3. Generate 32 random bytes, persist them to `.master-key` (mode 0600).
pub fn obtain_key(data_dir: &Path) -> Result<MasterKey> {
    let env_val = std::env::var(MASTER_KEY_ENV).ok().filter(|v| !v.is_empty());
    let fingerprint = format!("{}\u{0}{}", env_val.as_deref().unwrap_or(""), data_dir.display());

    let mut cache = KEY_CACHE.lock().expect("key cache poisoned");
    if let Some((cached_fp, bytes)) = cache.as_ref() {
        if *cached_fp == fingerprint {
            return Ok(MasterKey(*bytes));
        }
    }

    let bytes = resolve(env_val.as_deref(), data_dir)?;
    *cache = Some((fingerprint, bytes));
    Ok(MasterKey(bytes))
}

fn resolve(env_val: Option<&str>, data_dir: &Path) -> Result<[u8; 32]> {
    match env_val {
        Some(material) => derive_from_material(material),
        None => load_or_create_key_file(data_dir),
    }
}

/// Derive a 32-byte key from environment material with scrypt.
fn derive_from_material(material: &str) -> Result<[u8; 32]> {
    let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, 32)
        .map_err(|e| anyhow::anyhow!("scrypt params: {e}"))?;
    let mut key = [0u8; 32];
    scrypt::scrypt(material.as_bytes(), SCRYPT_SALT, &params, &mut key)
        .map_err(|e| anyhow::anyhow!("scrypt derive: {e}"))?;
    Ok(key)
}

fn load_or_create_key_file(data_dir: &Path) -> Result<[u8; 32]> {
    dirs::ensure_private_dir(data_dir)?;
    let path = data_dir.join(KEY_FILE);

    if path.exists() {
        let bytes = std::fs::read(&path)
            .with_context(|| format!("read {}", path.display()))?;
        // Never regenerate over a malformed file: overwriting it would orphan
        // every ciphertext encrypted under the original key.
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "{} is corrupt (expected 32 bytes, got {})",
                path.display(),
                bytes.len()
            )
        })?;
        return Ok(key);
    }

    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    std::fs::write(&path, key)
        .with_context(|| format!("write {}", path.display()))?;
    dirs::restrict_file(&path)?;
    warn!(path = %path.display(), "generated new master key — back this file up");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_material_derives_deterministically() {
        let k1 = derive_from_material("integration-test-key").unwrap();
        let k2 = derive_from_material("integration-test-key").unwrap();
        assert_eq!(k1, k2);
        let other = derive_from_material("different-key").unwrap();
        assert_ne!(k1, other);
    }

    #[test]
    fn generates_and_reuses_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let k1 = resolve(None, dir.path()).unwrap();
        assert!(dir.path().join(KEY_FILE).exists());
        let k2 = resolve(None, dir.path()).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn env_material_takes_priority_over_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_key = resolve(None, dir.path()).unwrap();
        let env_key = resolve(Some("some-passphrase"), dir.path()).unwrap();
        assert_ne!(file_key, env_key);
    }

    #[test]
    fn wrong_length_key_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(KEY_FILE), [0u8; 31]).unwrap();
        let err = resolve(None, dir.path()).unwrap_err();
        assert!(err.to_string().contains("32 bytes"));
    }

    #[test]
    fn distinct_data_dirs_get_distinct_keys() {
        let d1 = tempfile::tempdir().unwrap();
        let d2 = tempfile::tempdir().unwrap();
        let k1 = resolve(None, d1.path()).unwrap();
        let k2 = resolve(None, d2.path()).unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn repeated_obtain_for_same_dir_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let k1 = obtain_key(dir.path()).unwrap();
        let k2 = obtain_key(dir.path()).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        resolve(None, dir.path()).unwrap();
        let mode = std::fs::metadata(dir.path().join(KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

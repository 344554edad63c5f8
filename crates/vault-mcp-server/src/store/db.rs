use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::crypto;
use super::model::{Credential, CredentialMeta, SecretPayload, Selectors, ServiceType};
use crate::dirs;
use crate::keys::MasterKey;

const STORE_FILE: &str = "credentials.json";

/// Handle to the credential collection and its on-disk file. The in-memory
/// vector and the file are mutated only under the single internal mutex, so
/// mutations observed by a caller are durable.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<Inner>,
}

struct Inner {
    key: MasterKey,
    path: PathBuf,
    credentials: Mutex<Vec<Credential>>,
}

impl CredentialStore {
    /// Load `credentials.json` from `data_dir`, creating the directory and an
    /// empty store file if absent. Malformed JSON is an error.
    pub fn open(data_dir: &Path, key: MasterKey) -> Result<Self> {
        dirs::ensure_private_dir(data_dir)?;
        let path = data_dir.join(STORE_FILE);

        let credentials: Vec<Credential> = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parse {}", path.display()))?
        } else {
            let empty = Vec::new();
            write_store(&path, &empty)?;
            empty
        };

        Ok(Self {
            inner: Arc::new(Inner {
                key,
                path,
                credentials: Mutex::new(credentials),
            }),
        })
    }

    /// Encrypt `payload` and append a new credential. Rejects a duplicate
    /// `site_id` and a payload whose shape disagrees with `service_type`.
    pub async fn add(
        &self,
        site_id: &str,
        service_type: ServiceType,
        payload: &SecretPayload,
        login_url: Option<String>,
        selectors: Option<Selectors>,
    ) -> Result<CredentialMeta> {
        if site_id.is_empty() {
            anyhow::bail!("site_id must not be empty");
        }
        if !payload.matches(service_type) {
            anyhow::bail!("payload shape does not match service type '{service_type}'");
        }
        if service_type == ServiceType::ApiKey && (login_url.is_some() || selectors.is_some()) {
            anyhow::bail!("login_url and selectors only apply to web_login credentials");
        }

        let plaintext = serde_json::to_vec(payload).context("encode payload")?;
        let encrypted_data = crypto::encrypt(self.inner.key.as_bytes(), &plaintext)?;

        let mut credentials = self.inner.credentials.lock().await;
        if credentials.iter().any(|c| c.site_id == site_id) {
            anyhow::bail!("a credential for '{site_id}' already exists");
        }

        let now = Utc::now();
        let credential = Credential {
            id: Uuid::new_v4().to_string(),
            site_id: site_id.to_owned(),
            service_type,
            active: true,
            created_at: now,
            updated_at: now,
            login_url,
            selectors,
            encrypted_data,
        };
        let meta = credential.meta();

        credentials.push(credential);
        write_store(&self.inner.path, &credentials)?;

        debug!(site_id, service_type = %service_type, "stored credential");
        Ok(meta)
    }

    /// Look up a credential by site identifier and decrypt its payload.
    /// A decryption failure is the canonical signal that the master key no
    /// longer matches the stored data.
    pub async fn get(&self, site_id: &str) -> Result<Option<(CredentialMeta, SecretPayload)>> {
        let credentials = self.inner.credentials.lock().await;
        let Some(credential) = credentials.iter().find(|c| c.site_id == site_id) else {
            return Ok(None);
        };

        let plaintext = crypto::decrypt(self.inner.key.as_bytes(), &credential.encrypted_data)
            .with_context(|| format!("decrypt credential '{site_id}'"))?;
        let payload: SecretPayload =
            serde_json::from_slice(&plaintext).context("parse decrypted payload")?;

        Ok(Some((credential.meta(), payload)))
    }

    /// Metadata for a single credential, without decrypting.
    pub async fn meta(&self, site_id: &str) -> Option<CredentialMeta> {
        let credentials = self.inner.credentials.lock().await;
        credentials
            .iter()
            .find(|c| c.site_id == site_id)
            .map(Credential::meta)
    }

    /// Selectors for a single credential, without decrypting.
    pub async fn selectors(&self, site_id: &str) -> Option<Selectors> {
        let credentials = self.inner.credentials.lock().await;
        credentials
            .iter()
            .find(|c| c.site_id == site_id)
            .and_then(|c| c.selectors.clone())
    }

    /// Metadata for every credential, in insertion order. Never decrypts.
    pub async fn list(&self) -> Vec<CredentialMeta> {
        let credentials = self.inner.credentials.lock().await;
        credentials.iter().map(Credential::meta).collect()
    }

    /// Remove a credential. Returns true if it existed.
    pub async fn remove(&self, site_id: &str) -> Result<bool> {
        let mut credentials = self.inner.credentials.lock().await;
        let before = credentials.len();
        credentials.retain(|c| c.site_id != site_id);
        if credentials.len() == before {
            return Ok(false);
        }
        write_store(&self.inner.path, &credentials)?;
        Ok(true)
    }

    /// Set the active flag and bump `updated_at`. Returns true if it existed.
    pub async fn toggle_active(&self, site_id: &str, active: bool) -> Result<bool> {
        let mut credentials = self.inner.credentials.lock().await;
        let Some(credential) = credentials.iter_mut().find(|c| c.site_id == site_id) else {
            return Ok(false);
        };
        credential.active = active;
        credential.updated_at = Utc::now();
        write_store(&self.inner.path, &credentials)?;
        Ok(true)
    }
}

/// Rewrite the whole store file: serialize to a temporary sibling, restrict
/// its mode, then rename over the target.
fn write_store(path: &Path, credentials: &[Credential]) -> Result<()> {
    let json = serde_json::to_string_pretty(credentials).context("encode credentials")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    dirs::restrict_file(&tmp)?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

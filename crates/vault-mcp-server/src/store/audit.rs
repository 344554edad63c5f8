use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::dirs;

// ── Action constants ─────────────────────────────────────────────────────────

pub const ACTION_CREATED: &str = "credential.created";
pub const ACTION_USED: &str = "credential.used";
pub const ACTION_TOGGLED: &str = "credential.toggled";
pub const ACTION_REMOVED: &str = "credential.removed";

/// `prev_hash` of the first chain entry.
pub const GENESIS: &str = "genesis";

const AUDIT_FILE: &str = "audit.jsonl";

// ── Entry types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failure,
}

/// One audit record. Field order is the canonical hash order — the chain hash
/// is SHA-256 over `prev_hash` followed by the compact JSON of the entry
/// minus its own `hash` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub credential_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,
    pub result: AuditResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub prev_hash: String,
    pub hash: String,
}

/// Shadow of [`AuditEntry`] without `hash`, serialized in the same field
/// order so write-time and verify-time hashing see identical bytes.
#[derive(Serialize)]
struct UnhashedEntry<'a> {
    event_id: &'a str,
    timestamp: &'a DateTime<Utc>,
    action: &'a str,
    credential_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    bot_id: Option<&'a str>,
    result: AuditResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a str>,
    prev_hash: &'a str,
}

impl AuditEntry {
    fn compute_hash(&self) -> Result<String> {
        let unhashed = UnhashedEntry {
            event_id: &self.event_id,
            timestamp: &self.timestamp,
            action: &self.action,
            credential_id: &self.credential_id,
            bot_id: self.bot_id.as_deref(),
            result: self.result,
            details: self.details.as_deref(),
            prev_hash: &self.prev_hash,
        };
        let canonical = serde_json::to_string(&unhashed).context("encode audit entry")?;

        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(canonical.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Outcome of a chain verification walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainStatus {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<usize>,
    pub total: usize,
}

// ── AuditLog ─────────────────────────────────────────────────────────────────

/// Append-only, hash-chained audit file. Appends are serialized under an
/// internal mutex held across the read-tail + write cycle, so
/// `entries[n].prev_hash == entries[n-1].hash` holds under concurrency.
#[derive(Clone)]
pub struct AuditLog {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl AuditLog {
    /// Ensure the audit file exists under `data_dir` (mode 0600).
    pub fn open(data_dir: &Path) -> Result<Self> {
        dirs::ensure_private_dir(data_dir)?;
        let path = data_dir.join(AUDIT_FILE);
        if !path.exists() {
            std::fs::write(&path, b"").with_context(|| format!("create {}", path.display()))?;
        }
        dirs::restrict_file(&path)?;
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                append_lock: Mutex::new(()),
            }),
        })
    }

    /// Append one entry and return it. A write failure is an error — audit
    /// events are never silently dropped.
    pub async fn append(
        &self,
        action: &str,
        credential_id: &str,
        result: AuditResult,
        bot_id: Option<String>,
        details: Option<String>,
    ) -> Result<AuditEntry> {
        let _guard = self.inner.append_lock.lock().await;

        let existing = self.read_entries()?;
        let index = existing.len() + 1;
        let prev_hash = existing
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS.to_owned());

        let mut entry = AuditEntry {
            event_id: format!("evt_{index:03}"),
            timestamp: Utc::now(),
            action: action.to_owned(),
            credential_id: credential_id.to_owned(),
            bot_id,
            result,
            details,
            prev_hash,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash()?;

        let line = serde_json::to_string(&entry).context("encode audit entry")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)
            .with_context(|| format!("open {}", self.inner.path.display()))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .with_context(|| format!("append {}", self.inner.path.display()))?;

        Ok(entry)
    }

    /// All entries in insertion order, optionally filtered by credential
    /// identifier. An unreadable file is treated as an uninitialized log.
    pub fn entries(&self, credential_id: Option<&str>) -> Result<Vec<AuditEntry>> {
        let mut entries = self.read_entries()?;
        if let Some(id) = credential_id {
            entries.retain(|e| e.credential_id == id);
        }
        Ok(entries)
    }

    /// Walk the chain: every entry must link to its predecessor's hash and
    /// re-hash to its recorded value.
    pub fn verify_chain(&self) -> Result<ChainStatus> {
        let entries = self.read_entries()?;
        let total = entries.len();

        let mut expected_prev = GENESIS.to_owned();
        for (i, entry) in entries.iter().enumerate() {
            if entry.prev_hash != expected_prev {
                return Ok(ChainStatus {
                    valid: false,
                    broken_at: Some(i),
                    total,
                });
            }
            let recomputed = entry.compute_hash()?;
            if entry.hash != recomputed {
                return Ok(ChainStatus {
                    valid: false,
                    broken_at: Some(i),
                    total,
                });
            }
            expected_prev = entry.hash.clone();
        }

        Ok(ChainStatus {
            valid: true,
            broken_at: None,
            total,
        })
    }

    /// `genesis`, or the hash of the final entry.
    pub fn last_hash(&self) -> Result<String> {
        Ok(self
            .read_entries()?
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS.to_owned()))
    }

    fn read_entries(&self) -> Result<Vec<AuditEntry>> {
        let raw = match std::fs::read_to_string(&self.inner.path) {
            Ok(raw) => raw,
            Err(_) => return Ok(Vec::new()),
        };

        let mut entries = Vec::new();
        for (n, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = serde_json::from_str(line)
                .with_context(|| format!("parse audit line {}", n + 1))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_log() -> (AuditLog, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path()).unwrap();
        (log, dir)
    }

    async fn append_n(log: &AuditLog, n: usize) {
        for i in 0..n {
            log.append(
                ACTION_USED,
                &format!("site-{i}"),
                AuditResult::Success,
                None,
                None,
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn chain_links_and_event_ids() {
        let (log, _dir) = open_log();
        append_n(&log, 3).await;

        let entries = log.entries(None).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].event_id, "evt_001");
        assert_eq!(entries[2].event_id, "evt_003");
        assert_eq!(entries[0].prev_hash, GENESIS);
        for i in 1..entries.len() {
            assert_eq!(entries[i].prev_hash, entries[i - 1].hash);
        }

        let status = log.verify_chain().unwrap();
        assert_eq!(
            status,
            ChainStatus {
                valid: true,
                broken_at: None,
                total: 3
            }
        );
        assert_eq!(log.last_hash().unwrap(), entries[2].hash);
    }

    #[tokio::test]
    async fn empty_log_verifies_and_has_genesis_tail() {
        let (log, _dir) = open_log();
        assert!(log.verify_chain().unwrap().valid);
        assert_eq!(log.last_hash().unwrap(), GENESIS);
        assert!(log.entries(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn tampering_with_a_field_is_detected() {
        let (log, dir) = open_log();
        append_n(&log, 3).await;

        // Flip the result of entry 1 (zero-based) on disk.
        let path = dir.path().join(AUDIT_FILE);
        let raw = std::fs::read_to_string(&path).unwrap();
        let mut lines: Vec<String> = raw.lines().map(str::to_owned).collect();
        lines[1] = lines[1].replace("\"success\"", "\"failure\"");
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();

        let status = log.verify_chain().unwrap();
        assert!(!status.valid);
        assert_eq!(status.broken_at, Some(1));
        assert_eq!(status.total, 3);
    }

    #[tokio::test]
    async fn truncating_the_head_breaks_the_chain() {
        let (log, dir) = open_log();
        append_n(&log, 3).await;

        let path = dir.path().join(AUDIT_FILE);
        let raw = std::fs::read_to_string(&path).unwrap();
        let rest: Vec<&str> = raw.lines().skip(1).collect();
        std::fs::write(&path, rest.join("\n") + "\n").unwrap();

        let status = log.verify_chain().unwrap();
        assert!(!status.valid);
        assert_eq!(status.broken_at, Some(0));
    }

    #[tokio::test]
    async fn filters_by_credential_id() {
        let (log, _dir) = open_log();
        log.append(ACTION_CREATED, "github", AuditResult::Success, None, None)
            .await
            .unwrap();
        log.append(ACTION_USED, "stripe", AuditResult::Failure, None, None)
            .await
            .unwrap();
        log.append(
            ACTION_USED,
            "github",
            AuditResult::Success,
            Some("bot-1".into()),
            None,
        )
        .await
        .unwrap();

        let github = log.entries(Some("github")).unwrap();
        assert_eq!(github.len(), 2);
        assert!(github.iter().all(|e| e.credential_id == "github"));
        assert_eq!(github[1].bot_id.as_deref(), Some("bot-1"));
    }

    #[tokio::test]
    async fn concurrent_appends_keep_the_chain_intact() {
        let (log, _dir) = open_log();

        let mut handles = Vec::new();
        for i in 0..8 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.append(
                    ACTION_USED,
                    &format!("site-{i}"),
                    AuditResult::Success,
                    None,
                    None,
                )
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let status = log.verify_chain().unwrap();
        assert!(status.valid);
        assert_eq!(status.total, 8);
    }

    #[tokio::test]
    async fn optional_fields_round_trip_through_the_hash() {
        let (log, _dir) = open_log();
        log.append(
            ACTION_USED,
            "site",
            AuditResult::Failure,
            Some("agent-7".into()),
            Some("credential is inactive".into()),
        )
        .await
        .unwrap();
        log.append(ACTION_REMOVED, "site", AuditResult::Success, None, None)
            .await
            .unwrap();

        assert!(log.verify_chain().unwrap().valid);
    }
}

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;

/// Resolve the data directory for broker files (`credentials.json`,
/// `audit.jsonl`, `.master-key`).
///
/// Priority:
/// 1. `VAULT_DATA_DIR` environment variable
/// 2. `$HOME/.vault-mcp`
/// 3. Platform-specific app data dir
pub fn data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("VAULT_DATA_DIR") {
        let path = PathBuf::from(dir);
        ensure_private_dir(&path)?;
        return Ok(path);
    }

    if let Some(home) = std::env::var_os("HOME") {
        let path = PathBuf::from(home).join(".vault-mcp");
        ensure_private_dir(&path)?;
        return Ok(path);
    }

    let dirs = ProjectDirs::from("", "", "vault-mcp")
        .context("could not determine platform data directory")?;
    let path = dirs.data_dir().to_owned();
    ensure_private_dir(&path)?;
    Ok(path)
}

/// Create `path` (and parents) with owner-only access.
pub fn ensure_private_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("create data dir: {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("restrict data dir: {}", path.display()))?;
    }
    Ok(())
}

/// Restrict an existing file to owner read/write.
pub fn restrict_file(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restrict file: {}", path.display()))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_private_dir_creates_nested() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_private_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn private_dir_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault");
        ensure_private_dir(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[cfg(unix)]
    #[test]
    fn restrict_file_sets_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        restrict_file(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

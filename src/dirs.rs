//! Well-known locations of persisted FDE state under a root directory.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub fn fde_dir_under(root: &Path) -> PathBuf {
    root.join("var/lib/fde")
}

/// Save-partition directory holding key material that must survive a
/// reinstall of the data partition.
pub fn save_fde_dir_under(root: &Path) -> PathBuf {
    root.join("var/lib/fde/save")
}

pub fn boot_chains_file_under(root: &Path) -> PathBuf {
    fde_dir_under(root).join("boot-chains")
}

pub fn recovery_boot_chains_file_under(root: &Path) -> PathBuf {
    fde_dir_under(root).join("recovery-boot-chains")
}

pub fn sealed_keys_stamp_under(root: &Path) -> PathBuf {
    fde_dir_under(root).join("sealed-keys")
}

pub fn fde_state_file_under(root: &Path) -> PathBuf {
    fde_dir_under(root).join("state.json")
}

/// Cache of measured boot assets, one file per (name, content hash).
pub fn boot_assets_cache_dir_under(root: &Path) -> PathBuf {
    fde_dir_under(root).join("boot-assets")
}

pub fn aux_key_file_under(root: &Path) -> PathBuf {
    save_fde_dir_under(root).join("aux-key")
}

pub fn tpm_policy_auth_key_file_under(root: &Path) -> PathBuf {
    save_fde_dir_under(root).join("tpm-policy-auth-key")
}

pub fn tpm_lockout_auth_file_under(root: &Path) -> PathBuf {
    save_fde_dir_under(root).join("tpm-lockout-auth")
}

pub fn data_sealed_key_file_under(root: &Path) -> PathBuf {
    fde_dir_under(root).join("system-data.sealed-key")
}

pub fn fallback_data_sealed_key_file_under(root: &Path) -> PathBuf {
    fde_dir_under(root).join("system-data.recovery.sealed-key")
}

pub fn fallback_save_sealed_key_file_under(root: &Path) -> PathBuf {
    fde_dir_under(root).join("system-save.recovery.sealed-key")
}

/// Writes `data` to `path` atomically: the content lands in a sibling
/// temporary file which is renamed over the target, so a crash can never
/// leave a half-written file behind.
pub fn atomic_write(path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn atomic_write_creates_parents_and_sets_mode() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("a/b/file");
        atomic_write(&target, b"hello", 0o600)?;
        assert_eq!(fs::read(&target)?, b"hello");
        let mode = fs::metadata(&target)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        Ok(())
    }

    #[test]
    fn atomic_write_replaces_existing_content() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("file");
        atomic_write(&target, b"one", 0o600)?;
        atomic_write(&target, b"two", 0o600)?;
        assert_eq!(fs::read(&target)?, b"two");
        Ok(())
    }
}

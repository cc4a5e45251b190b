//! Master key resolution.
//!
//! Order: CACHIBOT_MASTER_KEY env var (hex) → ~/.cachibot/master.key (hex,
//! mode 0600) → auto-generate, persist, and warn once.

use std::fs;
use std::path::PathBuf;

use rand::RngCore;
use tracing::{info, warn};

use crate::error::{CryptoError, Result};

pub const MASTER_KEY_ENV: &str = "CACHIBOT_MASTER_KEY";

/// 256-bit symmetric master key.
pub type MasterKey = [u8; 32];

fn default_key_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".cachibot").join("master.key")
}

/// Load the master key from the environment or the key file, auto-generating
/// and persisting a fresh key when neither exists.
pub fn load_master_key() -> Result<MasterKey> {
    if let Ok(hex_key) = std::env::var(MASTER_KEY_ENV) {
        if !hex_key.is_empty() {
            return parse_hex_key(hex_key.trim());
        }
    }
    load_master_key_from(&default_key_path())
}

/// Key-file branch of [`load_master_key`] with an explicit path (tests).
pub fn load_master_key_from(key_file: &std::path::Path) -> Result<MasterKey> {
    if key_file.exists() {
        let stored = fs::read_to_string(key_file)?;
        let key = parse_hex_key(stored.trim())?;
        info!(path = %key_file.display(), "loaded master key from file");
        return Ok(key);
    }

    // Auto-generate.
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);

    if let Some(dir) = key_file.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(key_file, hex::encode(key))?;
    restrict_permissions(key_file)?;

    warn!(
        path = %key_file.display(),
        "no {} set — auto-generated master key saved to file. \
         Back up this file: if lost, all encrypted data is unrecoverable.",
        MASTER_KEY_ENV
    );

    Ok(key)
}

fn parse_hex_key(hex_str: &str) -> Result<MasterKey> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| CryptoError::MasterKey(format!("master key is not valid hex: {e}")))?;
    let key: MasterKey = bytes
        .try_into()
        .map_err(|_| CryptoError::MasterKey("master key must be 32 bytes".to_string()))?;
    Ok(key)
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = fs::Permissions::from_mode(0o600);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_generate_creates_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");

        let key = load_master_key_from(&path).unwrap();
        assert!(path.exists());

        let stored = std::fs::read_to_string(&path).unwrap();
        assert_eq!(hex::decode(stored.trim()).unwrap(), key.to_vec());
    }

    #[test]
    fn loads_existing_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        let key = [0x5au8; 32];
        std::fs::write(&path, hex::encode(key)).unwrap();

        let loaded = load_master_key_from(&path).unwrap();
        assert_eq!(loaded, key);
    }

    #[test]
    fn rejects_short_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        std::fs::write(&path, "deadbeef").unwrap();

        assert!(matches!(
            load_master_key_from(&path),
            Err(CryptoError::MasterKey(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn generated_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        load_master_key_from(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

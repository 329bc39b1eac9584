//! Persistence of generated key shares.
//!
//! Each successful keygen writes one JSON file named
//! `localstate-<port>-<pubkey>.json` under the node's base folder, so a
//! node can serve keysign requests for every pool key it has a share of.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageError;

/// The share material a node keeps after a keygen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenLocalState {
    /// Bech32 pool public key this share belongs to.
    pub pub_key: String,
    /// Opaque share data from the crypto primitive.
    pub local_data: Vec<u8>,
    /// Account pub keys of every participant of the keygen.
    pub participant_keys: Vec<String>,
    /// This node's own account pub key.
    pub local_party_key: String,
}

/// Reads and writes [`KeygenLocalState`] files for one node.
pub struct LocalStateManager {
    base_folder: PathBuf,
    port: u16,
}

impl LocalStateManager {
    pub fn new(base_folder: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            base_folder: base_folder.into(),
            port,
        }
    }

    pub fn file_path(&self, pub_key: &str) -> PathBuf {
        self.base_folder
            .join(format!("localstate-{}-{}.json", self.port, pub_key))
    }

    /// Persist one key share, file mode 0600.
    pub fn save(&self, state: &KeygenLocalState) -> Result<PathBuf, StorageError> {
        let path = self.file_path(&state.pub_key);
        let buf = serde_json::to_vec_pretty(state)?;
        fs::create_dir_all(&self.base_folder)?;
        fs::write(&path, buf)?;
        restrict_permissions(&path)?;
        debug!(path = %path.display(), "saved keygen local state");
        Ok(path)
    }

    /// Load the share for the given pool public key.
    pub fn load(&self, pub_key: &str) -> Result<KeygenLocalState, StorageError> {
        let path = self.file_path(pub_key);
        if !path.exists() {
            return Err(StorageError::NotFound(pub_key.to_string()));
        }
        let buf = fs::read(&path)?;
        Ok(serde_json::from_slice(&buf)?)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = LocalStateManager::new(dir.path(), 6668);
        let state = KeygenLocalState {
            pub_key: "tsspub1example".to_string(),
            local_data: vec![1, 2, 3, 4],
            participant_keys: vec!["a".to_string(), "b".to_string()],
            local_party_key: "a".to_string(),
        };
        let path = mgr.save(&state).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("localstate-6668-"));

        let loaded = mgr.load("tsspub1example").unwrap();
        assert_eq!(loaded.local_data, state.local_data);
        assert_eq!(loaded.participant_keys, state.participant_keys);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_load_missing_share() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = LocalStateManager::new(dir.path(), 6668);
        assert!(matches!(
            mgr.load("tsspub1missing"),
            Err(StorageError::NotFound(_))
        ));
    }
}

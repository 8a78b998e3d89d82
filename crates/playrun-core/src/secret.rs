//! Ephemeral vault password files
//!
//! A passphrase is handed to the tool by path rather than by value so it
//! never shows up in a process listing. The file lives exactly as long as
//! the run that owns it.

use crate::error::{Result, RunnerError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// File name prefix of every secret file
const SECRET_PREFIX: &str = ".vault-pwd";

/// A passphrase written to a uniquely named file, removed exactly once
#[derive(Debug)]
pub struct SecretFile {
    path: PathBuf,
    removed: AtomicBool,
}

impl SecretFile {
    /// Write `passphrase` to a new file in `dir`
    pub fn create(dir: &Path, passphrase: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mut file = tempfile::Builder::new()
            .prefix(SECRET_PREFIX)
            .tempfile_in(dir)?;
        file.write_all(passphrase.as_bytes())?;
        file.flush()?;

        let (_, path) = file.keep().map_err(|e| RunnerError::Io(e.error))?;
        debug!(path = %path.display(), "Created secret file");

        Ok(Self {
            path,
            removed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Argument pair pointing the tool at this file
    pub fn vault_args(&self) -> [String; 2] {
        [
            "--vault-password-file".to_string(),
            self.path.display().to_string(),
        ]
    }

    /// Remove the file.
    ///
    /// Only the first call touches the filesystem; later calls return
    /// `Ok(false)`.
    pub fn remove(&self) -> Result<bool> {
        if self.removed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Removed secret file");
                Ok(true)
            }
            Err(e) => Err(RunnerError::SecretCleanup {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}

impl Drop for SecretFile {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!(error = %e, "Secret file cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_writes_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let secret = SecretFile::create(dir.path(), "admin123456!").unwrap();

        assert!(secret
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(SECRET_PREFIX));
        assert_eq!(std::fs::read_to_string(secret.path()).unwrap(), "admin123456!");

        let [flag, path] = secret.vault_args();
        assert_eq!(flag, "--vault-password-file");
        assert_eq!(PathBuf::from(path), secret.path());
    }

    #[test]
    fn test_remove_is_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let secret = SecretFile::create(dir.path(), "k1").unwrap();
        let path = secret.path().to_path_buf();

        assert!(secret.remove().unwrap());
        assert!(!path.exists());
        assert!(!secret.remove().unwrap());
        assert!(secret.is_removed());
    }

    #[test]
    fn test_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let secret = SecretFile::create(dir.path(), "k1").unwrap();
            secret.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_failed_removal_is_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let secret = SecretFile::create(dir.path(), "k1").unwrap();
        std::fs::remove_file(secret.path()).unwrap();

        assert!(matches!(
            secret.remove(),
            Err(RunnerError::SecretCleanup { .. })
        ));
        assert!(!secret.remove().unwrap());
    }
}

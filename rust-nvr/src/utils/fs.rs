//! Filesystem helpers with operation + path error context.

use std::path::Path;

use crate::{Error, Result};

/// Convert an IO error into an application error with context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::Other(format!("{op} {}: {source}", path.display()))
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error("creating directory", path, e))
}

/// Remove a file, ignoring it if already absent.
pub async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error("removing file", path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_dir_all_and_remove_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a/b/c");
        ensure_dir_all(&nested).await.unwrap();
        assert!(nested.is_dir());

        // Removing a file that never existed is not an error.
        remove_file_if_exists(&nested.join("ghost.mp4")).await.unwrap();
    }
}

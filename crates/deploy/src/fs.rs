//! File system utils.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Context;
use fs2::FileExt;
use serde::{Serialize, de::DeserializeOwned};

pub struct FsHandler;

impl FsHandler {
    /// Create a directory (and its parents) if it doesn't exist.
    pub fn create_dir(path: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory {}", path.display()))?;
        tracing::trace!(path = %path.display(), "Directory ready");
        Ok(())
    }

    /// Replace `path` with `content` so that readers never observe a partial file.
    ///
    /// The content is written to a sibling temp file which is then renamed over the target.
    /// An advisory lock on `<path>.lock` serializes concurrent writers from other
    /// invocations.
    pub fn write_atomic(path: &Path, content: &[u8]) -> anyhow::Result<()> {
        let parent = path
            .parent()
            .context("File path must have a parent directory")?;
        Self::create_dir(parent)?;

        let lock = Self::lock(path)?;

        let tmp_path = Self::temp_path(path);
        {
            let mut tmp = File::create(&tmp_path)
                .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
            tmp.write_all(content)
                .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
            tmp.sync_all()
                .with_context(|| format!("Failed to flush {}", tmp_path.display()))?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to restrict file permissions")?;
        }

        std::fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to move {} into place at {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        lock.unlock().ok();
        tracing::trace!(path = %path.display(), "File replaced atomically");
        Ok(())
    }

    /// Serialize `value` as pretty JSON and write it atomically.
    pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(value).context("Failed to serialize JSON")?;
        Self::write_atomic(path, &json)
    }

    /// Read and parse a JSON file, returning `None` when it does not exist.
    pub fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(value))
    }

    /// Free space, in bytes, on the volume holding `path`.
    pub fn available_space(path: &Path) -> anyhow::Result<u64> {
        fs2::available_space(path)
            .with_context(|| format!("Failed to query free space at {}", path.display()))
    }

    fn lock(path: &Path) -> anyhow::Result<File> {
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;
        lock.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", lock_path.display()))?;
        Ok(lock)
    }

    fn temp_path(path: &Path) -> PathBuf {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()))
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use tempdir::TempDir;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let temp_dir = TempDir::new("edgeship-fs").expect("Failed to create temp dir");
        let path = temp_dir.path().join("nested/state.json");

        FsHandler::write_atomic(&path, b"first").expect("first write");
        FsHandler::write_atomic(&path, b"second").expect("second write");

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        // No temp file is left behind.
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_json_round_trip_and_missing() {
        let temp_dir = TempDir::new("edgeship-fs").expect("Failed to create temp dir");
        let path = temp_dir.path().join("sample.json");

        let missing: Option<Sample> = FsHandler::read_json(&path).unwrap();
        assert!(missing.is_none());

        let sample = Sample {
            name: "api".to_string(),
            count: 2,
        };
        FsHandler::write_json_atomic(&path, &sample).unwrap();
        let loaded: Option<Sample> = FsHandler::read_json(&path).unwrap();
        assert_eq!(loaded, Some(sample));
    }

    #[test]
    fn test_read_json_corrupted() {
        let temp_dir = TempDir::new("edgeship-fs").expect("Failed to create temp dir");
        let path = temp_dir.path().join("broken.json");
        std::fs::write(&path, "{ invalid json }").unwrap();
        let result: anyhow::Result<Option<Sample>> = FsHandler::read_json(&path);
        assert!(result.is_err());
    }
}

use crate::paths::clean_filename;
use crate::traits::{FileReader, FileStore, SavedFile, StorageError, StorageResult};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Authoritative filesystem tier scoped to a base directory.
///
/// Writes go to a sibling temp file and are renamed over the final path, so a
/// reader never observes a partial file.
pub struct LocalStore {
    base_dir: PathBuf,
}

impl LocalStore {
    pub async fn new(base_dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_dir = base_dir.into();
        if base_dir.as_os_str().is_empty() {
            return Err(StorageError::Config("base_dir is empty".to_string()));
        }

        fs::create_dir_all(&base_dir).await.map_err(|e| {
            StorageError::Config(format!(
                "create base dir {}: {}",
                base_dir.display(),
                e
            ))
        })?;

        Ok(LocalStore { base_dir })
    }

    fn full_path(&self, filename: &str) -> StorageResult<PathBuf> {
        Ok(self.base_dir.join(clean_filename(filename)?))
    }

    async fn write_temp(tmp: &Path, mut reader: FileReader) -> StorageResult<SavedFile> {
        let mut file = fs::File::create(tmp).await?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;
        let mut buf = vec![0u8; COPY_BUF_SIZE];

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            written += n as u64;
        }

        file.flush().await?;
        file.sync_all().await?;

        Ok(SavedFile {
            written,
            hash: hex::encode(hasher.finalize()),
        })
    }
}

#[async_trait]
impl FileStore for LocalStore {
    async fn save(
        &self,
        reader: FileReader,
        filename: &str,
        _size: Option<u64>,
    ) -> StorageResult<SavedFile> {
        let path = self.full_path(filename)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let tmp = PathBuf::from(format!("{}.tmp-{}", path.display(), nanos));

        let saved = match Self::write_temp(&tmp, reader).await {
            Ok(saved) => saved,
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        tracing::debug!(
            filename,
            path = %path.display(),
            written = saved.written,
            "file saved"
        );

        Ok(saved)
    }

    async fn open(&self, filename: &str) -> StorageResult<(FileReader, u64)> {
        let path = self.full_path(filename)?;

        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(filename.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let file = fs::File::open(&path).await?;
        Ok((Box::pin(file), meta.len()))
    }

    async fn delete(&self, filename: &str) -> StorageResult<()> {
        let path = self.full_path(filename)?;

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn cleanup_older_than(&self, max_age: Duration) -> StorageResult<()> {
        // A cutoff before the epoch means nothing can qualify.
        let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
            return Ok(());
        };

        let mut stack = vec![self.base_dir.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    stack.push(entry.path());
                    continue;
                }
                if !meta.is_file() {
                    continue;
                }
                let Ok(modified) = meta.modified() else {
                    continue;
                };
                if modified < cutoff {
                    let path = entry.path();
                    fs::remove_file(&path).await?;
                    tracing::debug!(path = %path.display(), "removed aged file");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn reader(data: &[u8]) -> FileReader {
        Box::pin(std::io::Cursor::new(data.to_vec()))
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[tokio::test]
    async fn save_open_round_trip() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path()).await.unwrap();

        let data = b"dwg bytes";
        let saved = store.save(reader(data), "a.dwg", None).await.unwrap();
        assert_eq!(saved.written, data.len() as u64);
        assert_eq!(saved.hash, sha256_hex(data));

        let (mut rc, size) = store.open("a.dwg").await.unwrap();
        assert_eq!(size, data.len() as u64);
        let mut out = Vec::new();
        rc.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn save_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path()).await.unwrap();

        store.save(reader(b"x"), "a.dwg", None).await.unwrap();

        let mut names = Vec::new();
        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["a.dwg".to_string()]);
    }

    #[tokio::test]
    async fn open_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path()).await.unwrap();

        let err = match store.open("missing.dwg").await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path()).await.unwrap();

        for name in ["../escape.dwg", "a/../../escape.dwg", ""] {
            let err = store.save(reader(b"x"), name, None).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidFilename(_)), "{name:?}");
        }
        assert!(matches!(
            match store.open("../etc/passwd").await {
                Ok(_) => panic!("expected error"),
                Err(e) => e,
            },
            StorageError::InvalidFilename(_)
        ));
        assert!(matches!(
            store.delete("../etc/passwd").await.unwrap_err(),
            StorageError::InvalidFilename(_)
        ));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path()).await.unwrap();

        store.save(reader(b"x"), "a.dwg", None).await.unwrap();
        store.delete("a.dwg").await.unwrap();
        store.delete("a.dwg").await.unwrap();
        assert!(match store.open("a.dwg").await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        }
        .is_not_found());
    }

    #[tokio::test]
    async fn cleanup_on_empty_tree_is_noop() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path()).await.unwrap();
        store.cleanup_older_than(Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_removes_old_files_and_keeps_directories() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path()).await.unwrap();

        store.save(reader(b"x"), "sub/old.dwg", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        store.cleanup_older_than(Duration::ZERO).await.unwrap();

        assert!(match store.open("sub/old.dwg").await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        }
        .is_not_found());
        assert!(dir.path().join("sub").is_dir());
    }

    #[tokio::test]
    async fn cleanup_keeps_recent_files() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path()).await.unwrap();

        store.save(reader(b"x"), "fresh.dwg", None).await.unwrap();
        store
            .cleanup_older_than(Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(store.open("fresh.dwg").await.is_ok());
    }
}

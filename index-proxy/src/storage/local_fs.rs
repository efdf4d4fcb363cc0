//! A filesystem-backed `Storage` implementation, sharded two levels deep by
//! the first four hex nibbles of `sha256(key)` so a single directory never
//! accumulates every cached artifact.
//!
//! Alongside each artifact's data file a `.key` sidecar holds the original
//! logical key verbatim, so `list()` can hand back the key `put_stream` was
//! called with rather than the one-way hash used for sharding.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use index_cache::{CoreError, Result};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::AsyncRead;

const KEY_SIDECAR_EXT: &str = "key";

pub struct LocalFsStorage {
    root: PathBuf,
}

impl LocalFsStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn shard_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.root
            .join(&digest[0..2])
            .join(&digest[2..4])
            .join(&digest[4..])
    }

    fn key_sidecar_path(&self, key: &str) -> PathBuf {
        sidecar_path_for(&self.shard_path(key))
    }
}

fn sidecar_path_for(data_path: &Path) -> PathBuf {
    let mut name = data_path
        .file_name()
        .expect("shard path always has a file name")
        .to_os_string();
    name.push(".");
    name.push(KEY_SIDECAR_EXT);
    data_path.with_file_name(name)
}

fn data_path_for_sidecar(sidecar_path: &Path) -> Option<PathBuf> {
    let name = sidecar_path.file_name()?.to_str()?;
    let stem = name.strip_suffix(&format!(".{KEY_SIDECAR_EXT}"))?;
    Some(sidecar_path.with_file_name(OsString::from(stem)))
}

fn io_err(err: std::io::Error) -> CoreError {
    CoreError::StorageFailure(err.to_string())
}

#[async_trait]
impl index_cache::Storage for LocalFsStorage {
    async fn put_stream(
        &self,
        key: &str,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<u64> {
        let final_path = self.shard_path(key);
        let dir = final_path.parent().expect("shard path always has a parent").to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(io_err)?;

        let tmp = tokio::task::spawn_blocking(move || NamedTempFile::new_in(&dir))
            .await
            .map_err(|e| CoreError::StorageFailure(e.to_string()))?
            .map_err(io_err)?;

        let std_file = tmp.reopen().map_err(io_err)?;
        let mut file = tokio::fs::File::from_std(std_file);
        let size = tokio::io::copy(&mut reader, &mut file).await.map_err(io_err)?;
        drop(file);

        tokio::task::spawn_blocking(move || tmp.persist(&final_path))
            .await
            .map_err(|e| CoreError::StorageFailure(e.to_string()))?
            .map_err(|e| CoreError::StorageFailure(e.error.to_string()))?;

        tokio::fs::write(self.key_sidecar_path(key), key.as_bytes())
            .await
            .map_err(io_err)?;

        Ok(size)
    }

    async fn get_stream(&self, key: &str) -> Result<Option<Box<dyn AsyncRead + Send + Unpin>>> {
        match tokio::fs::File::open(self.shard_path(key)).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(err)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.shard_path(key)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(err)),
        }
        match tokio::fs::remove_file(self.key_sidecar_path(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(err)),
        }
    }

    async fn stat(&self, key: &str) -> Result<Option<(u64, SystemTime)>> {
        match tokio::fs::metadata(self.shard_path(key)).await {
            Ok(meta) => Ok(Some((meta.len(), meta.modified().map_err(io_err)?))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(err)),
        }
    }

    async fn list(&self) -> Result<Vec<(String, u64, SystemTime)>> {
        let mut out = Vec::new();
        walk(&self.root, &mut out).await?;
        Ok(out)
    }
}

fn walk<'a>(
    dir: &'a Path,
    out: &'a mut Vec<(String, u64, SystemTime)>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(io_err(err)),
        };

        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(io_err)?;
            if file_type.is_dir() {
                walk(&path, out).await?;
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            // Only `.key` sidecars carry the logical key; the data file
            // they point at is reported alongside them, so skip data files
            // encountered directly to avoid double- or wrongly-keyed entries.
            let Some(data_path) = data_path_for_sidecar(&path) else {
                continue;
            };

            let key = match tokio::fs::read_to_string(&path).await {
                Ok(key) => key,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(io_err(err)),
            };

            let meta = match tokio::fs::metadata(&data_path).await {
                Ok(meta) => meta,
                // The data file can vanish between the sidecar read and
                // here under concurrent eviction; treat it as absent.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(io_err(err)),
            };

            out.push((key, meta.len(), meta.modified().map_err(io_err)?));
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use index_cache::Storage;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trip_through_put_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFsStorage::new(dir.path().to_path_buf());

        let size = storage
            .put_stream("numpy/numpy-1.0.tar.gz", Box::new(Cursor::new(b"hello".to_vec())))
            .await
            .unwrap();
        assert_eq!(size, 5);

        let mut reader = storage
            .get_stream("numpy/numpy-1.0.tar.gz")
            .await
            .unwrap()
            .expect("just-written key should be present");
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn missing_key_is_a_clean_miss() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFsStorage::new(dir.path().to_path_buf());
        assert!(storage.get_stream("nope").await.unwrap().is_none());
        assert!(storage.stat("nope").await.unwrap().is_none());
        storage.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn delete_removes_a_written_key() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFsStorage::new(dir.path().to_path_buf());
        storage
            .put_stream("k", Box::new(Cursor::new(b"x".to_vec())))
            .await
            .unwrap();
        storage.delete("k").await.unwrap();
        assert!(storage.get_stream("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_reports_the_original_logical_key() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFsStorage::new(dir.path().to_path_buf());
        storage
            .put_stream("numpy/numpy-1.0.tar.gz", Box::new(Cursor::new(b"hello".to_vec())))
            .await
            .unwrap();
        storage
            .put_stream("django/django-4.0.tar.gz", Box::new(Cursor::new(b"hi".to_vec())))
            .await
            .unwrap();

        let mut listed = storage.list().await.unwrap();
        listed.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, "django/django-4.0.tar.gz");
        assert_eq!(listed[0].1, 2);
        assert_eq!(listed[1].0, "numpy/numpy-1.0.tar.gz");
        assert_eq!(listed[1].1, 5);
    }
}

//! Local filesystem source backend

use super::{ByteRange, ByteStream, StorageBackend};
use crate::error::{CacheError, CacheResult};
use crate::models::{BackendKind, SourceUri};
use async_trait::async_trait;
use futures::StreamExt;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

/// Chunk size for file reads
const READ_CHUNK: usize = 1024 * 1024;

/// Serves artifacts from a directory (e.g., a shared volume or NFS mount)
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolve a URI against the root, refusing to escape it
    fn resolve(&self, uri: &SourceUri) -> CacheResult<PathBuf> {
        let SourceUri::Local { path } = uri else {
            return Err(CacheError::Config(format!(
                "local backend cannot serve '{}'",
                uri
            )));
        };

        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(CacheError::Config(format!(
                "local source '{}' escapes the storage root",
                path
            )));
        }
        Ok(self.root.join(relative))
    }

    async fn metadata(&self, uri: &SourceUri) -> CacheResult<Option<std::fs::Metadata>> {
        let path = self.resolve(uri)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::unavailable(uri.to_string(), e)),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn fetch(&self, uri: &SourceUri, range: ByteRange) -> CacheResult<ByteStream> {
        let path = self.resolve(uri)?;
        let mut file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::not_found(
                    uri.to_string(),
                    format!("{:?} does not exist", path),
                ));
            }
            Err(e) => return Err(CacheError::unavailable(uri.to_string(), e)),
        };

        if range.start > 0 {
            file.seek(SeekFrom::Start(range.start))
                .await
                .map_err(|e| CacheError::unavailable(uri.to_string(), e))?;
        }

        let uri_label = uri.to_string();
        let stream = match range.end {
            Some(end) => {
                let len = end.saturating_sub(range.start);
                ReaderStream::with_capacity(file.take(len), READ_CHUNK).boxed()
            }
            None => ReaderStream::with_capacity(file, READ_CHUNK).boxed(),
        };

        tracing::trace!(uri = %uri, range = %range, "Reading local source");

        Ok(Box::pin(stream.map(move |chunk| {
            chunk.map_err(|e| CacheError::unavailable(uri_label.clone(), e))
        })))
    }

    async fn exists(&self, uri: &SourceUri) -> CacheResult<bool> {
        Ok(self.metadata(uri).await?.is_some())
    }

    async fn size(&self, uri: &SourceUri) -> CacheResult<u64> {
        self.metadata(uri)
            .await?
            .map(|m| m.len())
            .ok_or_else(|| CacheError::not_found(uri.to_string(), "no such file"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::TryStreamExt;

    fn setup() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("llm")).unwrap();
        std::fs::write(dir.path().join("llm/weights.bin"), b"0123456789").unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf());
        (dir, storage)
    }

    async fn read(storage: &LocalStorage, uri: &SourceUri, range: ByteRange) -> Vec<u8> {
        let chunks: Vec<Bytes> = storage.fetch(uri, range).await.unwrap().try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_fetch_full_and_ranges() {
        let (_dir, storage) = setup();
        let uri = SourceUri::parse("file://llm/weights.bin").unwrap();

        assert_eq!(read(&storage, &uri, ByteRange::full()).await, b"0123456789");
        assert_eq!(read(&storage, &uri, ByteRange::from(7)).await, b"789");
        assert_eq!(
            read(
                &storage,
                &uri,
                ByteRange {
                    start: 2,
                    end: Some(5)
                }
            )
            .await,
            b"234"
        );
    }

    #[tokio::test]
    async fn test_exists_and_size() {
        let (_dir, storage) = setup();
        let uri = SourceUri::parse("llm/weights.bin").unwrap();
        assert!(storage.exists(&uri).await.unwrap());
        assert_eq!(storage.size(&uri).await.unwrap(), 10);

        let missing = SourceUri::parse("llm/missing.bin").unwrap();
        assert!(!storage.exists(&missing).await.unwrap());
        assert!(matches!(
            storage.size(&missing).await,
            Err(CacheError::NotFound { .. })
        ));
        // Directories are not artifacts
        assert!(!storage.exists(&SourceUri::parse("llm").unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_missing_is_not_found() {
        let (_dir, storage) = setup();
        let uri = SourceUri::parse("nope.bin").unwrap();
        let result = storage.fetch(&uri, ByteRange::full()).await;
        assert!(matches!(result, Err(CacheError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_parent_traversal_rejected() {
        let (_dir, storage) = setup();
        let uri = SourceUri::parse("../etc/passwd").unwrap();
        assert!(matches!(
            storage.fetch(&uri, ByteRange::full()).await,
            Err(CacheError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_foreign_uri() {
        let (_dir, storage) = setup();
        let uri = SourceUri::parse("s3://bucket/key").unwrap();
        assert!(storage.exists(&uri).await.is_err());
    }
}

//! The external collaborators the core consumes (spec §2): a streaming
//! blob store, and fetchers for metadata and artifact bytes. Concrete
//! implementations live in `index-proxy`; the core only ever sees these
//! trait objects.

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::Result;
use crate::model::{FileEntry, ProjectListEntry};

/// A streaming blob store keyed by opaque path.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Streams `reader` into `key`, returning the number of bytes written.
    async fn put_stream(
        &self,
        key: &str,
        reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<u64>;

    /// Opens a streaming read of `key`. Returns `Ok(None)` on a cache miss.
    async fn get_stream(&self, key: &str) -> Result<Option<Box<dyn AsyncRead + Send + Unpin>>>;

    /// Deletes `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Returns `(size, mtime)` for `key`, or `Ok(None)` on a miss.
    async fn stat(&self, key: &str) -> Result<Option<(u64, std::time::SystemTime)>>;

    /// Lists every stored key with its size and mtime.
    async fn list(&self) -> Result<Vec<(String, u64, std::time::SystemTime)>>;
}

/// A parsed metadata document plus an optional upstream ETag, returned by
/// [`MetadataFetcher`].
#[derive(Debug, Clone, Default)]
pub struct FetchedMeta<T> {
    pub payload: T,
    pub etag: Option<String>,
}

/// Fetches upstream index documents.
#[async_trait]
pub trait MetadataFetcher: Send + Sync + 'static {
    async fn fetch_projects(&self, index_url: &str) -> Result<FetchedMeta<Vec<ProjectListEntry>>>;

    async fn fetch_files(
        &self,
        index_url: &str,
        project: &str,
    ) -> Result<FetchedMeta<Vec<FileEntry>>>;
}

/// The result of opening a streaming read of an upstream artifact.
pub struct ArtifactSource {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
}

/// Opens a streaming read of an upstream artifact URL.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync + 'static {
    async fn fetch(&self, url: &str) -> Result<ArtifactSource>;
}

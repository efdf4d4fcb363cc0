//! The thin object the routing layer calls on cache miss (spec §6).

use std::sync::Arc;

use crate::artifact_cache::{ArtifactCache, ArtifactRead};
use crate::error::Result;
use crate::metadata_cache::{IndexSpec, MetadataCache};
use crate::model::{FileEntry, ProjectListEntry};
use crate::traits::{ArtifactFetcher, MetadataFetcher, Storage};

/// Ties the metadata cache and the artifact cache together behind the four
/// operations a request handler needs. Generic over the fetcher and storage
/// trait seams so `index-proxy` can supply concrete HTTP/filesystem
/// implementations while tests use in-memory fakes.
pub struct CoreFacade<MF: MetadataFetcher, AF: ArtifactFetcher, S: Storage> {
    metadata: MetadataCache<MF>,
    artifacts: ArtifactCache<S, AF>,
}

impl<MF: MetadataFetcher, AF: ArtifactFetcher, S: Storage> CoreFacade<MF, AF, S> {
    pub fn new(
        fetcher: Arc<MF>,
        artifact_fetcher: Arc<AF>,
        storage: Arc<S>,
        clock: Arc<dyn crate::clock::Clock>,
        indices: Vec<IndexSpec>,
        serve_stale_on_error: bool,
        cache_size_bytes: u64,
    ) -> Self {
        Self {
            metadata: MetadataCache::new(fetcher, clock.clone(), indices, serve_stale_on_error),
            artifacts: ArtifactCache::new(storage, artifact_fetcher, clock, cache_size_bytes),
        }
    }

    pub async fn list_projects(&self) -> Result<Vec<ProjectListEntry>> {
        self.metadata.list_projects().await
    }

    pub async fn list_files(&self, project: &str) -> Result<Vec<FileEntry>> {
        self.metadata.list_files(project).await
    }

    /// Looks up `filename`'s upstream URL via the file listing, then serves
    /// it from (or into) the artifact cache.
    pub async fn fetch_artifact(&self, project: &str, filename: &str) -> Result<ArtifactRead> {
        let files = self.metadata.list_files(project).await?;
        let file = files
            .iter()
            .find(|f| f.filename == filename)
            .ok_or(crate::error::CoreError::NotFound)?;
        self.artifacts
            .fetch_artifact(project, filename, &file.url)
            .await
    }

    pub async fn invalidate_all(&self) -> Result<()> {
        self.artifacts.invalidate_all().await
    }

    pub async fn invalidate(&self, project: &str) -> Result<()> {
        self.artifacts.invalidate(project).await
    }
}

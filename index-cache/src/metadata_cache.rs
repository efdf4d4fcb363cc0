//! TTL-based cache over the project list and per-project file lists
//! (spec §4.3), deduplicating concurrent upstream fetches through
//! [`SingleFlight`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;
use crate::error::{CoreError, Result};
use crate::model::{FileEntry, ProjectListEntry, ProjectName};
use crate::singleflight::SingleFlight;
use crate::traits::MetadataFetcher;

/// One configured upstream index: its URL and its own freshness window.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub url: String,
    pub ttl: Duration,
}

struct MetadataEntry<T> {
    payload: T,
    fetched_at: std::time::Instant,
    ttl: Duration,
}

impl<T> MetadataEntry<T> {
    fn is_fresh(&self, clock: &dyn Clock) -> bool {
        clock.now().duration_since(self.fetched_at) < self.ttl
    }
}

/// Caches `ListProjects` and `ListFiles(project)` results, refreshing
/// through a per-concern [`SingleFlight`] registry on expiry or miss.
pub struct MetadataCache<F: MetadataFetcher> {
    fetcher: Arc<F>,
    clock: Arc<dyn Clock>,
    indices: Vec<IndexSpec>,
    serve_stale_on_error: bool,
    projects: Mutex<Option<MetadataEntry<Vec<ProjectListEntry>>>>,
    files: Mutex<HashMap<ProjectName, MetadataEntry<Vec<FileEntry>>>>,
    project_sf: SingleFlight<Vec<ProjectListEntry>, CoreError>,
    file_sf: SingleFlight<(Vec<FileEntry>, Duration), CoreError>,
}

impl<F: MetadataFetcher> MetadataCache<F> {
    /// `indices` must be non-empty; the first entry is the primary index.
    pub fn new(
        fetcher: Arc<F>,
        clock: Arc<dyn Clock>,
        indices: Vec<IndexSpec>,
        serve_stale_on_error: bool,
    ) -> Self {
        assert!(!indices.is_empty(), "at least a primary index is required");
        Self {
            fetcher,
            clock,
            indices,
            serve_stale_on_error,
            projects: Mutex::new(None),
            files: Mutex::new(HashMap::new()),
            project_sf: SingleFlight::new(),
            file_sf: SingleFlight::new(),
        }
    }

    pub async fn list_projects(&self) -> Result<Vec<ProjectListEntry>> {
        if let Some(fresh) = self.fresh_projects() {
            return Ok(fresh);
        }

        let fetcher = self.fetcher.clone();
        let primary_url = self.indices[0].url.clone();
        let (result, _shared) = self
            .project_sf
            .do_call("project-list", move || async move {
                fetcher
                    .fetch_projects(&primary_url)
                    .await
                    .map(|fetched| fetched.payload)
            })
            .await;

        match result {
            Ok(payload) => {
                self.store_projects(payload.clone());
                Ok(payload)
            }
            Err(err) => match self.stale_projects_if_allowed() {
                Some(stale) => Ok(stale),
                None => Err(err),
            },
        }
    }

    pub async fn list_files(&self, project: &str) -> Result<Vec<FileEntry>> {
        let name = ProjectName::new(project);

        if let Some(fresh) = self.fresh_files(&name) {
            return Ok(fresh);
        }

        let fetcher = self.fetcher.clone();
        let indices = self.indices.clone();
        let key = format!("project-files:{name}");
        let name_for_fetch = name.clone();
        let (result, _shared) = self
            .file_sf
            .do_call(&key, move || async move {
                fetch_merged(fetcher, indices, name_for_fetch).await
            })
            .await;

        match result {
            Ok((merged, ttl)) => {
                self.store_files(name, merged.clone(), ttl);
                Ok(merged)
            }
            Err(err) => match self.stale_files_if_allowed(&name) {
                Some(stale) => Ok(stale),
                None => Err(err),
            },
        }
    }

    fn fresh_projects(&self) -> Option<Vec<ProjectListEntry>> {
        let entry = self.projects.lock().unwrap();
        entry
            .as_ref()
            .filter(|e| e.is_fresh(self.clock.as_ref()))
            .map(|e| e.payload.clone())
    }

    fn stale_projects_if_allowed(&self) -> Option<Vec<ProjectListEntry>> {
        if !self.serve_stale_on_error {
            return None;
        }
        self.projects
            .lock()
            .unwrap()
            .as_ref()
            .map(|e| e.payload.clone())
    }

    fn store_projects(&self, payload: Vec<ProjectListEntry>) {
        *self.projects.lock().unwrap() = Some(MetadataEntry {
            payload,
            fetched_at: self.clock.now(),
            ttl: self.indices[0].ttl,
        });
    }

    fn fresh_files(&self, name: &ProjectName) -> Option<Vec<FileEntry>> {
        let files = self.files.lock().unwrap();
        files
            .get(name)
            .filter(|e| e.is_fresh(self.clock.as_ref()))
            .map(|e| e.payload.clone())
    }

    fn stale_files_if_allowed(&self, name: &ProjectName) -> Option<Vec<FileEntry>> {
        if !self.serve_stale_on_error {
            return None;
        }
        self.files
            .lock()
            .unwrap()
            .get(name)
            .map(|e| e.payload.clone())
    }

    fn store_files(&self, name: ProjectName, payload: Vec<FileEntry>, ttl: Duration) {
        self.files.lock().unwrap().insert(
            name,
            MetadataEntry {
                payload,
                fetched_at: self.clock.now(),
                ttl,
            },
        );
    }
}

async fn fetch_merged<F: MetadataFetcher>(
    fetcher: Arc<F>,
    indices: Vec<IndexSpec>,
    project: ProjectName,
) -> Result<(Vec<FileEntry>, Duration)> {
    let mut merged: BTreeMap<String, FileEntry> = BTreeMap::new();
    let mut contributing_ttls: Vec<Duration> = Vec::new();

    for index in &indices {
        match fetcher.fetch_files(&index.url, project.as_str()).await {
            Ok(fetched) => {
                if !fetched.payload.is_empty() {
                    contributing_ttls.push(index.ttl);
                    for file in fetched.payload {
                        merged.entry(file.filename.clone()).or_insert(file);
                    }
                }
            }
            Err(err) if err.is_not_found() => continue,
            Err(err) => return Err(err),
        }
    }

    if merged.is_empty() {
        return Err(CoreError::NotFound);
    }

    let ttl = contributing_ttls
        .into_iter()
        .min()
        .unwrap_or(indices[0].ttl);
    Ok((merged.into_values().collect(), ttl))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::clock::AdvanceableClock;
    use crate::traits::FetchedMeta;

    struct FakeFetcher {
        projects_calls: AtomicUsize,
        files_calls: AtomicUsize,
        projects: Mutex<Vec<ProjectListEntry>>,
        projects_fail: Mutex<bool>,
        files_by_index: Mutex<HashMap<String, Vec<FileEntry>>>,
        files_fail: Mutex<bool>,
    }

    impl FakeFetcher {
        fn new() -> Self {
            Self {
                projects_calls: AtomicUsize::new(0),
                files_calls: AtomicUsize::new(0),
                projects: Mutex::new(vec![]),
                projects_fail: Mutex::new(false),
                files_by_index: Mutex::new(HashMap::new()),
                files_fail: Mutex::new(false),
            }
        }
    }

    #[async_trait]
    impl MetadataFetcher for FakeFetcher {
        async fn fetch_projects(
            &self,
            _index_url: &str,
        ) -> Result<FetchedMeta<Vec<ProjectListEntry>>> {
            self.projects_calls.fetch_add(1, Ordering::SeqCst);
            if *self.projects_fail.lock().unwrap() {
                return Err(CoreError::UpstreamUnavailable("down".into()));
            }
            Ok(FetchedMeta {
                payload: self.projects.lock().unwrap().clone(),
                etag: None,
            })
        }

        async fn fetch_files(
            &self,
            index_url: &str,
            project: &str,
        ) -> Result<FetchedMeta<Vec<FileEntry>>> {
            self.files_calls.fetch_add(1, Ordering::SeqCst);
            if *self.files_fail.lock().unwrap() {
                return Err(CoreError::UpstreamUnavailable("down".into()));
            }
            let key = format!("{index_url}/{project}");
            let payload = self
                .files_by_index
                .lock()
                .unwrap()
                .get(&key)
                .cloned()
                .unwrap_or_default();
            if payload.is_empty() {
                return Err(CoreError::NotFound);
            }
            Ok(FetchedMeta {
                payload,
                etag: None,
            })
        }
    }

    fn file(name: &str, hash: &str) -> FileEntry {
        FileEntry {
            filename: name.to_string(),
            url: format!("https://example.invalid/{name}"),
            hashes: BTreeMap::from([("sha256".to_string(), hash.to_string())]),
            requires_python: None,
            size: None,
            upload_time: None,
            yanked: Default::default(),
            core_metadata: None,
        }
    }

    fn cache_with(
        fetcher: Arc<FakeFetcher>,
        clock: Arc<AdvanceableClock>,
        ttl: Duration,
        serve_stale: bool,
    ) -> MetadataCache<FakeFetcher> {
        MetadataCache::new(
            fetcher,
            clock,
            vec![IndexSpec {
                url: "https://primary.invalid".to_string(),
                ttl,
            }],
            serve_stale,
        )
    }

    #[tokio::test]
    async fn fresh_entry_served_without_refetch() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher
            .projects
            .lock()
            .unwrap()
            .push(ProjectListEntry { name: "a".into() });
        let clock = Arc::new(AdvanceableClock::new());
        let cache = cache_with(fetcher.clone(), clock, Duration::from_secs(60), false);

        cache.list_projects().await.unwrap();
        cache.list_projects().await.unwrap();

        assert_eq!(fetcher.projects_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_triggers_refetch() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher
            .projects
            .lock()
            .unwrap()
            .push(ProjectListEntry { name: "a".into() });
        let clock = Arc::new(AdvanceableClock::new());
        let cache = cache_with(fetcher.clone(), clock.clone(), Duration::from_secs(1), false);

        cache.list_projects().await.unwrap();
        clock.advance(Duration::from_secs(2));
        cache.list_projects().await.unwrap();

        assert_eq!(fetcher.projects_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn django_and_lowercase_share_one_entry() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher
            .files_by_index
            .lock()
            .unwrap()
            .insert("https://primary.invalid/django".to_string(), vec![file("Django-1.0.tar.gz", "a")]);
        let clock = Arc::new(AdvanceableClock::new());
        let cache = cache_with(fetcher.clone(), clock, Duration::from_secs(60), false);

        let a = cache.list_files("Django").await.unwrap();
        let b = cache.list_files("django").await.unwrap();

        assert_eq!(a, b);
        assert_eq!(fetcher.files_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn extra_index_merges_with_primary_precedence() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.files_by_index.lock().unwrap().insert(
            "https://primary.invalid/numpy".to_string(),
            vec![file("numpy-1.0.tar.gz", "primary-hash")],
        );
        fetcher.files_by_index.lock().unwrap().insert(
            "https://extra.invalid/numpy".to_string(),
            vec![
                file("numpy-1.0.tar.gz", "extra-hash"),
                file("numpy-1.0-py3-none-any.whl", "extra-hash-2"),
            ],
        );
        let clock = Arc::new(AdvanceableClock::new());
        let cache = MetadataCache::new(
            fetcher,
            clock,
            vec![
                IndexSpec {
                    url: "https://primary.invalid".to_string(),
                    ttl: Duration::from_secs(60),
                },
                IndexSpec {
                    url: "https://extra.invalid".to_string(),
                    ttl: Duration::from_secs(60),
                },
            ],
            false,
        );

        let files = cache.list_files("numpy").await.unwrap();
        assert_eq!(files.len(), 2);
        let sdist = files
            .iter()
            .find(|f| f.filename == "numpy-1.0.tar.gz")
            .unwrap();
        assert_eq!(sdist.hashes["sha256"], "primary-hash");
    }

    #[tokio::test]
    async fn stale_value_served_only_when_enabled() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher
            .projects
            .lock()
            .unwrap()
            .push(ProjectListEntry { name: "a".into() });
        let clock = Arc::new(AdvanceableClock::new());
        let cache = cache_with(fetcher.clone(), clock.clone(), Duration::from_secs(1), true);

        cache.list_projects().await.unwrap();
        clock.advance(Duration::from_secs(2));
        *fetcher.projects_fail.lock().unwrap() = true;

        let served = cache.list_projects().await.unwrap();
        assert_eq!(served, vec![ProjectListEntry { name: "a".into() }]);
    }

    #[tokio::test]
    async fn error_propagates_by_default_when_stale_not_allowed() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher
            .projects
            .lock()
            .unwrap()
            .push(ProjectListEntry { name: "a".into() });
        let clock = Arc::new(AdvanceableClock::new());
        let cache = cache_with(fetcher.clone(), clock.clone(), Duration::from_secs(1), false);

        cache.list_projects().await.unwrap();
        clock.advance(Duration::from_secs(2));
        *fetcher.projects_fail.lock().unwrap() = true;

        let result = cache.list_projects().await;
        assert!(result.is_err());
    }
}

//! Size-bounded artifact cache with exactly-one-upstream-fetch semantics
//! and streaming delivery (spec §4.4).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::AsyncRead;
use tokio::sync::{oneshot, watch};

use crate::broadcast::{BroadcastSession, Overflow};
use crate::clock::Clock;
use crate::error::{CoreError, Result};
use crate::model::ProjectName;
use crate::traits::{ArtifactFetcher, Storage};

/// Identifies one cached artifact: a project plus one of its files.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub project: ProjectName,
    pub filename: String,
}

impl ArtifactKey {
    pub fn new(project: &str, filename: &str) -> Self {
        Self {
            project: ProjectName::new(project),
            filename: filename.to_string(),
        }
    }

    fn storage_key(&self) -> String {
        format!("{}/{}", self.project, self.filename)
    }
}

enum EntryState {
    Filling {
        session: BroadcastSession,
        done: Arc<watch::Sender<bool>>,
    },
    Ready {
        size: u64,
    },
    Evicting,
}

struct Entry {
    state: EntryState,
    last_access: Instant,
}

struct IndexState {
    entries: HashMap<ArtifactKey, Entry>,
}

struct CacheInner<S: Storage, AF: ArtifactFetcher> {
    storage: Arc<S>,
    fetcher: Arc<AF>,
    clock: Arc<dyn Clock>,
    cache_size_bytes: u64,
    index: Mutex<IndexState>,
}

/// The result of a successful `fetch_artifact`: a byte stream plus whatever
/// metadata the upstream (or the cache, for a `Ready` hit) could supply.
pub struct ArtifactRead {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
}

/// A size-bounded cache of artifact bytes. `Clone` is cheap and shares the
/// same index and storage handle — clone it to hand to a spawned fetch
/// task.
pub struct ArtifactCache<S: Storage, AF: ArtifactFetcher> {
    inner: Arc<CacheInner<S, AF>>,
}

impl<S: Storage, AF: ArtifactFetcher> Clone for ArtifactCache<S, AF> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Storage, AF: ArtifactFetcher> ArtifactCache<S, AF> {
    pub fn new(storage: Arc<S>, fetcher: Arc<AF>, clock: Arc<dyn Clock>, cache_size_bytes: u64) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                storage,
                fetcher,
                clock,
                cache_size_bytes,
                index: Mutex::new(IndexState {
                    entries: HashMap::new(),
                }),
            }),
        }
    }

    pub async fn fetch_artifact(
        &self,
        project: &str,
        filename: &str,
        upstream_url: &str,
    ) -> Result<ArtifactRead> {
        let key = ArtifactKey::new(project, filename);

        loop {
            enum Action {
                Ready,
                WaitForReady(Arc<watch::Sender<bool>>),
                Start(BroadcastSession, Arc<watch::Sender<bool>>),
                Wait,
            }

            let action = {
                let mut index = self.inner.index.lock().unwrap();
                match index.entries.get_mut(&key) {
                    Some(entry) => match &entry.state {
                        EntryState::Ready { .. } => {
                            entry.last_access = self.inner.clock.now();
                            Action::Ready
                        }
                        EntryState::Filling { done, .. } => Action::WaitForReady(done.clone()),
                        EntryState::Evicting => Action::Wait,
                    },
                    None => {
                        let session = BroadcastSession::new();
                        let done = Arc::new(watch::channel(false).0);
                        index.entries.insert(
                            key.clone(),
                            Entry {
                                state: EntryState::Filling {
                                    session: session.clone(),
                                    done: done.clone(),
                                },
                                last_access: self.inner.clock.now(),
                            },
                        );
                        Action::Start(session, done)
                    }
                }
            };

            match action {
                Action::Ready => match self.read_ready(&key).await? {
                    Some(read) => return Ok(read),
                    None => continue,
                },
                Action::WaitForReady(done) => {
                    // Late joiners never read the broadcast tee: they'd start
                    // at the current offset and silently receive a truncated
                    // artifact. Instead wait for the fill to finish (success
                    // or not) and re-enter the loop to read from `Storage`.
                    let mut rx = done.subscribe();
                    if !*rx.borrow() {
                        let _ = rx.changed().await;
                    }
                    continue;
                }
                Action::Start(session, done) => {
                    return self
                        .start_fetch(key, upstream_url.to_string(), session, done)
                        .await;
                }
                Action::Wait => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    continue;
                }
            }
        }
    }

    async fn read_ready(&self, key: &ArtifactKey) -> Result<Option<ArtifactRead>> {
        let size = {
            let index = self.inner.index.lock().unwrap();
            match index.entries.get(key) {
                Some(Entry {
                    state: EntryState::Ready { size },
                    ..
                }) => Some(*size),
                _ => None,
            }
        };

        let Some(size) = size else {
            return Ok(None);
        };

        match self.inner.storage.get_stream(&key.storage_key()).await? {
            Some(reader) => Ok(Some(ArtifactRead {
                reader,
                content_length: Some(size),
                content_type: None,
            })),
            None => {
                // Ready in the index but missing from storage: the backend
                // was mutated out of band. Drop the stale entry and let the
                // caller retry as a cold fetch.
                self.remove_entry(key);
                Ok(None)
            }
        }
    }

    async fn start_fetch(
        &self,
        key: ArtifactKey,
        upstream_url: String,
        session: BroadcastSession,
        done: Arc<watch::Sender<bool>>,
    ) -> Result<ArtifactRead> {
        let caller_reader = session.subscribe(Overflow::DropSubscriber);
        let (header_tx, header_rx) = oneshot::channel();

        let cache = self.clone();
        tokio::spawn(async move {
            cache.run_fetch(key, upstream_url, session, header_tx, done).await;
        });

        match header_rx.await {
            Ok(Ok((content_length, content_type))) => Ok(ArtifactRead {
                reader: Box::new(caller_reader),
                content_length,
                content_type,
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(CoreError::Cancelled),
        }
    }

    async fn run_fetch(
        &self,
        key: ArtifactKey,
        upstream_url: String,
        session: BroadcastSession,
        header_tx: oneshot::Sender<Result<(Option<u64>, Option<String>)>>,
        done: Arc<watch::Sender<bool>>,
    ) {
        let source = match self.inner.fetcher.fetch(&upstream_url).await {
            Ok(source) => source,
            Err(err) => {
                let io_err = std::io::Error::other(err.to_string());
                let _ = header_tx.send(Err(err));
                session.abort(io_err).await;
                self.remove_entry(&key);
                let _ = done.send(true);
                return;
            }
        };

        let _ = header_tx.send(Ok((source.content_length, source.content_type.clone())));

        let storage_key = key.storage_key();
        let commit_reader = session.subscribe(Overflow::BlockSource);
        let storage = self.inner.storage.clone();
        let commit_key = storage_key.clone();
        let commit = tokio::spawn(async move {
            storage
                .put_stream(&commit_key, Box::new(commit_reader))
                .await
        });

        session.run(source.reader).await;

        let commit_result = commit
            .await
            .expect("artifact commit task panicked");

        match commit_result {
            Ok(size) if size > self.inner.cache_size_bytes => {
                tracing::debug!(
                    key = %storage_key,
                    size,
                    budget = self.inner.cache_size_bytes,
                    "artifact exceeds cache budget; streamed through without caching"
                );
                let _ = self.inner.storage.delete(&storage_key).await;
                self.remove_entry(&key);
            }
            Ok(size) => self.finalize_ready(&key, size).await,
            Err(err) => {
                tracing::warn!(key = %storage_key, error = %err, "artifact commit failed");
                self.remove_entry(&key);
            }
        }

        let _ = done.send(true);
    }

    async fn finalize_ready(&self, key: &ArtifactKey, size: u64) {
        {
            let mut index = self.inner.index.lock().unwrap();
            if let Some(entry) = index.entries.get_mut(key) {
                debug_assert!(
                    matches!(entry.state, EntryState::Filling { .. }),
                    "finalize_ready called on an entry that was not Filling"
                );
                entry.state = EntryState::Ready { size };
                entry.last_access = self.inner.clock.now();
            }
        }
        self.evict_if_needed().await;
    }

    fn remove_entry(&self, key: &ArtifactKey) {
        self.inner.index.lock().unwrap().entries.remove(key);
    }

    async fn evict_if_needed(&self) {
        loop {
            let victim = {
                let index = self.inner.index.lock().unwrap();
                let total: u64 = index
                    .entries
                    .values()
                    .filter_map(|e| match e.state {
                        EntryState::Ready { size } => Some(size),
                        _ => None,
                    })
                    .sum();

                if total <= self.inner.cache_size_bytes {
                    None
                } else {
                    index
                        .entries
                        .iter()
                        .filter(|(_, e)| matches!(e.state, EntryState::Ready { .. }))
                        .min_by_key(|(_, e)| e.last_access)
                        .map(|(k, _)| k.clone())
                }
            };

            let Some(key) = victim else {
                break;
            };

            {
                let mut index = self.inner.index.lock().unwrap();
                match index.entries.get_mut(&key) {
                    Some(entry) => {
                        debug_assert!(
                            matches!(entry.state, EntryState::Ready { .. }),
                            "eviction selected a non-Ready entry"
                        );
                        entry.state = EntryState::Evicting;
                    }
                    None => continue,
                }
            }

            let storage_key = key.storage_key();
            if let Err(err) = self.inner.storage.delete(&storage_key).await {
                tracing::error!(key = %storage_key, error = %err, "failed to delete evicted artifact");
            }

            self.remove_entry(&key);
        }
    }

    /// Evicts every `Ready` entry. `Filling` entries are left to commit and
    /// then fall under ordinary eviction.
    pub async fn invalidate_all(&self) -> Result<()> {
        let keys = self.mark_evicting(|_| true);
        self.delete_and_remove(keys).await
    }

    /// Evicts every `Ready` entry belonging to `project`.
    pub async fn invalidate(&self, project: &str) -> Result<()> {
        let name = ProjectName::new(project);
        let keys = self.mark_evicting(|k| k.project == name);
        self.delete_and_remove(keys).await
    }

    fn mark_evicting(&self, matches: impl Fn(&ArtifactKey) -> bool) -> Vec<ArtifactKey> {
        let mut index = self.inner.index.lock().unwrap();
        let keys: Vec<ArtifactKey> = index
            .entries
            .iter()
            .filter(|(k, e)| matches(k) && matches!(e.state, EntryState::Ready { .. }))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &keys {
            if let Some(entry) = index.entries.get_mut(key) {
                debug_assert!(
                    matches!(entry.state, EntryState::Ready { .. }),
                    "mark_evicting selected a non-Ready entry"
                );
                entry.state = EntryState::Evicting;
            }
        }
        keys
    }

    async fn delete_and_remove(&self, keys: Vec<ArtifactKey>) -> Result<()> {
        for key in keys {
            self.inner.storage.delete(&key.storage_key()).await?;
            self.remove_entry(&key);
        }
        Ok(())
    }
}

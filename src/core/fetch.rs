use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::cache::BoundedCache;
use crate::core::diff_parser::{ChangedFile, ContentHash, DiffParser, ParseOptions, ParsedDiff};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("diff source failed: {0}")]
    Source(String),
    #[error("diff fetch aborted: {0}")]
    Aborted(String),
}

/// Produces the parsed diff of one file.
#[async_trait]
pub trait DiffSource: Send + Sync {
    async fn load(&self, file: &ChangedFile) -> Result<ParsedDiff, FetchError>;
}

/// Parses patches in-process on the blocking pool.
pub struct LocalDiffSource {
    options: ParseOptions,
}

impl LocalDiffSource {
    pub fn new(options: ParseOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl DiffSource for LocalDiffSource {
    async fn load(&self, file: &ChangedFile) -> Result<ParsedDiff, FetchError> {
        let request = file.to_request();
        let options = self.options;
        tokio::task::spawn_blocking(move || DiffParser::parse_patch(&request, &options))
            .await
            .map_err(|e| FetchError::Aborted(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchConfig {
    /// How many files after the selected one are considered.
    pub ahead: usize,
    /// Fetches issued per prefetch batch.
    pub concurrency: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            ahead: 5,
            concurrency: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceStats {
    pub cached: usize,
    pub in_flight: usize,
    pub queued: usize,
}

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<ParsedDiff>, FetchError>>>;

enum Lookup {
    Cached(Arc<ParsedDiff>),
    Pending(SharedFetch),
}

struct ServiceState {
    cache: BoundedCache<ContentHash, Arc<ParsedDiff>>,
    in_flight: HashMap<ContentHash, SharedFetch>,
    queue: VecDeque<ChangedFile>,
    draining: bool,
    drain_task: Option<JoinHandle<()>>,
}

struct Inner {
    source: Arc<dyn DiffSource>,
    prefetch: PrefetchConfig,
    state: Mutex<ServiceState>,
}

/// Content-addressed diff cache with request coalescing and prefetching.
///
/// Cloning the service is cheap and every clone shares the same cache. The
/// state lock is never held while a fetch is awaited.
#[derive(Clone)]
pub struct DiffService {
    inner: Arc<Inner>,
}

impl DiffService {
    pub fn new(source: Arc<dyn DiffSource>, capacity: usize, prefetch: PrefetchConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                prefetch: PrefetchConfig {
                    ahead: prefetch.ahead,
                    concurrency: prefetch.concurrency.max(1),
                },
                state: Mutex::new(ServiceState {
                    cache: BoundedCache::new(capacity),
                    in_flight: HashMap::new(),
                    queue: VecDeque::new(),
                    draining: false,
                    drain_task: None,
                }),
            }),
        }
    }

    /// Returns the parsed diff for `file`. Cached results are returned as is;
    /// concurrent requests for the same content share one underlying fetch.
    pub async fn request(&self, file: &ChangedFile) -> Result<Arc<ParsedDiff>, FetchError> {
        let fetch = {
            let mut state = self.inner.state.lock().await;
            match self.lookup_or_issue(&mut state, file) {
                Lookup::Cached(diff) => return Ok(diff),
                Lookup::Pending(fetch) => fetch,
            }
        };
        fetch.await
    }

    /// Like [`request`](Self::request), but a failed fetch degrades to an
    /// empty diff.
    pub async fn request_or_empty(&self, file: &ChangedFile) -> Arc<ParsedDiff> {
        match self.request(file).await {
            Ok(diff) => diff,
            Err(err) => {
                warn!("Failed to load diff for {}: {}", file.filename, err);
                Arc::new(ParsedDiff::empty(file.filename.clone()))
            }
        }
    }

    pub async fn cached(&self, file: &ChangedFile) -> Option<Arc<ParsedDiff>> {
        self.inner.state.lock().await.cache.get(&file.content_key())
    }

    pub async fn stats(&self) -> ServiceStats {
        let state = self.inner.state.lock().await;
        ServiceStats {
            cached: state.cache.len(),
            in_flight: state.in_flight.len(),
            queued: state.queue.len(),
        }
    }

    /// Called when the reviewer moves to `files[index]`. Replaces the queue of
    /// not-yet-issued prefetches with the following files that are neither
    /// cached nor in flight. Fetches already issued keep running.
    pub async fn select(&self, files: &[ChangedFile], index: usize) {
        let mut state = self.inner.state.lock().await;
        state.queue.clear();

        let mut seen = HashSet::new();
        for file in files.iter().skip(index + 1).take(self.inner.prefetch.ahead) {
            let key = file.content_key();
            if state.cache.contains(&key) || state.in_flight.contains_key(&key) || !seen.insert(key) {
                continue;
            }
            state.queue.push_back(file.clone());
        }

        if state.queue.is_empty() || state.draining {
            return;
        }

        debug!("Scheduling prefetch of {} files", state.queue.len());
        state.draining = true;
        let service = self.clone();
        state.drain_task = Some(tokio::spawn(async move { service.drain_prefetch().await }));
    }

    /// Waits until the prefetch queue is drained.
    pub async fn wait_prefetch_idle(&self) {
        loop {
            let handle = self.inner.state.lock().await.drain_task.take();
            match handle {
                Some(handle) => {
                    if let Err(err) = handle.await {
                        warn!("Prefetch task ended abnormally: {}", err);
                    }
                }
                None => break,
            }
        }
    }

    fn lookup_or_issue(&self, state: &mut ServiceState, file: &ChangedFile) -> Lookup {
        let key = file.content_key();
        if let Some(diff) = state.cache.get(&key) {
            return Lookup::Cached(diff);
        }
        if let Some(pending) = state.in_flight.get(&key) {
            debug!("Joining in-flight fetch for {}", file.filename);
            return Lookup::Pending(pending.clone());
        }

        let fetch = self.issue(key.clone(), file.clone());
        state.in_flight.insert(key, fetch.clone());
        Lookup::Pending(fetch)
    }

    /// Spawns the fetch so it completes even if every waiter goes away. The
    /// caller must register the returned future as in flight while still
    /// holding the state lock.
    fn issue(&self, key: ContentHash, file: ChangedFile) -> SharedFetch {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            // The load runs in its own task so a panicking source still
            // reaches the bookkeeping below.
            let load = {
                let source = Arc::clone(&inner.source);
                let file = file.clone();
                tokio::spawn(async move { source.load(&file).await })
            };
            let result = match load.await {
                Ok(loaded) => loaded.map(Arc::new),
                Err(err) => Err(FetchError::Aborted(err.to_string())),
            };

            let mut state = inner.state.lock().await;
            state.in_flight.remove(&key);
            match &result {
                Ok(diff) => {
                    if let Some(evicted) = state.cache.set(key, Arc::clone(diff)) {
                        debug!("Evicted diff {} from cache", evicted);
                    }
                }
                Err(err) => debug!("Fetch for {} failed: {}", file.filename, err),
            }
            result
        });

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(FetchError::Aborted(e.to_string())))
        }
        .boxed()
        .shared()
    }

    async fn drain_prefetch(&self) {
        loop {
            let batch = {
                let mut state = self.inner.state.lock().await;
                let mut batch = Vec::new();
                while batch.len() < self.inner.prefetch.concurrency {
                    let Some(file) = state.queue.pop_front() else {
                        break;
                    };
                    let key = file.content_key();
                    if state.cache.contains(&key) || state.in_flight.contains_key(&key) {
                        continue;
                    }
                    debug!("Prefetching diff for {}", file.filename);
                    let fetch = self.issue(key.clone(), file.clone());
                    state.in_flight.insert(key, fetch.clone());
                    batch.push((file.filename, fetch));
                }

                if batch.is_empty() {
                    state.draining = false;
                    return;
                }
                batch
            };

            let results = join_all(
                batch
                    .into_iter()
                    .map(|(filename, fetch)| async move { (filename, fetch.await) }),
            )
            .await;
            for (filename, result) in results {
                if let Err(err) = result {
                    warn!("Prefetch of {} failed: {}", filename, err);
                }
            }

            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingSource {
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        delay: Duration,
        failing: HashSet<String>,
    }

    impl CountingSource {
        fn new(delay_ms: u64) -> Arc<Self> {
            Self::failing(delay_ms, &[])
        }

        fn failing(delay_ms: u64, names: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                delay: Duration::from_millis(delay_ms),
                failing: names.iter().map(|n| n.to_string()).collect(),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DiffSource for CountingSource {
        async fn load(&self, file: &ChangedFile) -> Result<ParsedDiff, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.failing.contains(&file.filename) {
                return Err(FetchError::Source(format!("{} unavailable", file.filename)));
            }
            Ok(DiffParser::parse_patch(&file.to_request(), &ParseOptions::default()))
        }
    }

    fn file(name: &str) -> ChangedFile {
        ChangedFile {
            filename: name.to_string(),
            patch: Some(format!("@@ -1,1 +1,1 @@\n-old {}\n+new {}", name, name)),
            ..Default::default()
        }
    }

    fn files(count: usize) -> Vec<ChangedFile> {
        (0..count).map(|i| file(&format!("src/file{}.rs", i))).collect()
    }

    fn service(source: &Arc<CountingSource>, capacity: usize) -> DiffService {
        let source: Arc<dyn DiffSource> = source.clone();
        DiffService::new(source, capacity, PrefetchConfig::default())
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        let source = CountingSource::new(20);
        let service = service(&source, 10);
        let target = file("src/lib.rs");

        let (a, b) = tokio::join!(service.request(&target), service.request(&target));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(source.calls(), 1);
        assert!(Arc::ptr_eq(&a, &b));

        let again = service.request(&target).await.unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(source.calls(), 1);
        assert_eq!(service.stats().await.in_flight, 0);
    }

    #[tokio::test]
    async fn test_distinct_files_fetch_independently() {
        let source = CountingSource::new(5);
        let service = service(&source, 10);

        let (fa, fb) = (file("a.rs"), file("b.rs"));
        let (a, b) = tokio::join!(service.request(&fa), service.request(&fb));
        assert_eq!(a.unwrap().filename, "a.rs");
        assert_eq!(b.unwrap().filename, "b.rs");
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_surfaces_and_allows_retry() {
        let source = CountingSource::failing(1, &["broken.rs"]);
        let service = service(&source, 10);
        let broken = file("broken.rs");

        let err = service.request(&broken).await.unwrap_err();
        assert!(matches!(err, FetchError::Source(_)));
        assert_eq!(service.stats().await, ServiceStats::default());

        let empty = service.request_or_empty(&broken).await;
        assert!(empty.is_empty());
        assert_eq!(empty.filename, "broken.rs");
        assert_eq!(source.calls(), 2);
    }

    struct PanicOnceSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DiffSource for PanicOnceSource {
        async fn load(&self, file: &ChangedFile) -> Result<ParsedDiff, FetchError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("source blew up");
            }
            Ok(DiffParser::parse_patch(&file.to_request(), &ParseOptions::default()))
        }
    }

    #[tokio::test]
    async fn test_panicking_source_can_be_retried() {
        let source = Arc::new(PanicOnceSource {
            calls: AtomicUsize::new(0),
        });
        let service = DiffService::new(source.clone(), 10, PrefetchConfig::default());
        let target = file("panics.rs");

        let err = service.request(&target).await.unwrap_err();
        assert!(matches!(err, FetchError::Aborted(_)));
        assert_eq!(service.stats().await.in_flight, 0);

        let diff = service.request(&target).await.unwrap();
        assert_eq!(diff.filename, "panics.rs");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_eviction_refetches_oldest() {
        let source = CountingSource::new(1);
        let service = service(&source, 2);
        let all = files(3);

        for f in &all {
            service.request(f).await.unwrap();
        }
        assert_eq!(service.stats().await.cached, 2);
        assert!(service.cached(&all[0]).await.is_none());
        assert!(service.cached(&all[2]).await.is_some());

        service.request(&all[0]).await.unwrap();
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test]
    async fn test_abandoned_request_still_populates_cache() {
        let source = CountingSource::new(30);
        let service = service(&source, 10);
        let target = file("late.rs");

        let abandoned =
            tokio::time::timeout(Duration::from_millis(1), service.request(&target)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(service.cached(&target).await.is_some());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_select_prefetches_following_files() {
        let source = CountingSource::new(2);
        let service = service(&source, 20);
        let all = files(8);

        service.request(&all[0]).await.unwrap();
        service.select(&all, 0).await;
        service.wait_prefetch_idle().await;

        for f in &all[1..=5] {
            assert!(service.cached(f).await.is_some(), "{} not prefetched", f.filename);
        }
        assert!(service.cached(&all[6]).await.is_none());
        assert_eq!(source.calls(), 6);
        assert!(source.max_active.load(Ordering::SeqCst) <= 3);

        service.select(&all, 0).await;
        service.wait_prefetch_idle().await;
        assert_eq!(source.calls(), 6);
        assert_eq!(service.stats().await.queued, 0);
    }

    #[tokio::test]
    async fn test_prefetch_skips_in_flight_and_swallows_failures() {
        let source = CountingSource::failing(10, &["src/file2.rs"]);
        let service = service(&source, 20);
        let all = files(5);

        let foreground = {
            let service = service.clone();
            let target = all[1].clone();
            tokio::spawn(async move { service.request(&target).await })
        };
        tokio::time::sleep(Duration::from_millis(2)).await;

        service.select(&all, 0).await;
        service.wait_prefetch_idle().await;
        foreground.await.unwrap().unwrap();

        // file1 was in flight, file2 failed, file3 and file4 were prefetched.
        assert_eq!(source.calls(), 4);
        assert!(service.cached(&all[2]).await.is_none());
        assert!(service.cached(&all[3]).await.is_some());
        assert!(service.cached(&all[4]).await.is_some());
    }

    #[tokio::test]
    async fn test_local_source_parses_patch() {
        let source = Arc::new(LocalDiffSource::new(ParseOptions::default()));
        let service = DiffService::new(source, 10, PrefetchConfig::default());
        let diff = service.request(&file("main.rs")).await.unwrap();
        assert_eq!(diff.hunks().count(), 1);
        assert_eq!(diff.content_hash, Some(file("main.rs").content_key()));
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{DigsError, DigsResult, ReplicaRegistry, ATTR_LOCKED_BY, ATTR_SIZE};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(20 * 60);

pub type AttributeSnapshot = Arc<HashMap<String, String>>;

#[derive(Default)]
struct CacheState {
    lock_list: Option<AttributeSnapshot>,
    size_list: Option<AttributeSnapshot>,
    refreshed_at: Option<Instant>,
    /// Bumped by every discard request.
    requested_gen: u64,
    /// Newest `requested_gen` a completed pass started after.
    fetched_gen: u64,
    last_error: Option<DigsError>,
}

impl CacheState {
    fn is_ready(&self) -> bool {
        self.fetched_gen >= self.requested_gen
            && self.lock_list.is_some()
            && self.size_list.is_some()
    }
}

struct CacheInner {
    registry: Arc<dyn ReplicaRegistry>,
    interval: Duration,
    state: RwLock<CacheState>,
    immediate: AtomicBool,
    wakeup: Notify,
    passes: watch::Sender<u64>,
    cancel: CancellationToken,
}

impl CacheInner {
    fn request(&self) {
        self.immediate.store(true, Ordering::SeqCst);
        self.wakeup.notify_one();
    }

    fn due_in(&self) -> Duration {
        if self.immediate.load(Ordering::SeqCst) {
            return Duration::ZERO;
        }
        let state = match self.state.read() {
            Ok(s) => s,
            Err(_) => return Duration::ZERO,
        };
        match state.refreshed_at {
            Some(at) => self.interval.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    async fn refresh_once(&self) {
        self.immediate.store(false, Ordering::SeqCst);
        let started_gen = match self.state.read() {
            Ok(state) => state.requested_gen,
            Err(_) => return,
        };
        debug!("refreshing lock and size lists");
        let result = async {
            let locks = self.registry.get_all_attribute_values(ATTR_LOCKED_BY).await?;
            let sizes = self.registry.get_all_attribute_values(ATTR_SIZE).await?;
            Ok::<_, DigsError>((locks, sizes))
        }
        .await;

        if let Ok(mut state) = self.state.write() {
            match result {
                Ok((locks, sizes)) => {
                    info!("file list cache refreshed: {} files", sizes.len());
                    state.lock_list = Some(Arc::new(locks));
                    state.size_list = Some(Arc::new(sizes));
                    state.refreshed_at = Some(Instant::now());
                    state.fetched_gen = state.fetched_gen.max(started_gen);
                    state.last_error = None;
                    if !state.is_ready() {
                        debug!("file list cache discarded during refresh, fetching again");
                        self.immediate.store(true, Ordering::SeqCst);
                    }
                }
                Err(e) => {
                    warn!("file list cache refresh failed: {}", e);
                    state.last_error = Some(e);
                }
            }
        }
        self.passes.send_modify(|n| *n += 1);
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.due_in().is_zero() {
                self.refresh_once().await;
            }
            let wait = self.due_in();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!("file list cache worker stopped");
    }

    async fn snapshot<F>(&self, pick: F) -> DigsResult<AttributeSnapshot>
    where
        F: Fn(&CacheState) -> Option<AttributeSnapshot>,
    {
        let mut passes = self.passes.subscribe();
        loop {
            passes.borrow_and_update();
            {
                let state = self
                    .state
                    .read()
                    .map_err(|_| DigsError::Registry("file list cache poisoned".to_string()))?;
                if state.is_ready() {
                    if let Some(snapshot) = pick(&state) {
                        return Ok(snapshot);
                    }
                }
            }

            self.request();
            if passes.changed().await.is_err() {
                return Err(DigsError::Registry("file list cache stopped".to_string()));
            }

            let failure = {
                let state = self
                    .state
                    .read()
                    .map_err(|_| DigsError::Registry("file list cache poisoned".to_string()))?;
                if state.is_ready() {
                    None
                } else {
                    state.last_error.clone()
                }
            };
            if let Some(e) = failure {
                return Err(e);
            }
        }
    }
}

/// Background snapshot of every file's lock holder and size.
///
/// One worker task refetches both lists whenever the snapshot is older than
/// the refresh interval or a refresh was requested. Readers get the current
/// snapshot even if stale; they only wait when no usable snapshot exists.
pub struct FileListCache {
    inner: Arc<CacheInner>,
    worker: JoinHandle<()>,
}

impl FileListCache {
    /// Spawns the worker on the current tokio runtime.
    pub fn start(registry: Arc<dyn ReplicaRegistry>, interval: Duration) -> Self {
        let (passes, _) = watch::channel(0u64);
        let inner = Arc::new(CacheInner {
            registry,
            interval,
            state: RwLock::new(CacheState::default()),
            immediate: AtomicBool::new(false),
            wakeup: Notify::new(),
            passes,
            cancel: CancellationToken::new(),
        });
        let worker = tokio::spawn(inner.clone().run());
        Self { inner, worker }
    }

    pub fn is_ready(&self) -> bool {
        self.inner
            .state
            .read()
            .map(|s| s.is_ready())
            .unwrap_or(false)
    }

    pub fn last_refresh(&self) -> Option<Instant> {
        self.inner.state.read().ok().and_then(|s| s.refreshed_at)
    }

    /// Ask for a new snapshot without discarding the current one.
    pub fn request_refresh(&self) {
        self.inner.request();
    }

    /// Discard the current snapshot and fetch a new one; readers wait for it.
    pub fn refresh(&self) {
        if let Ok(mut state) = self.inner.state.write() {
            state.requested_gen += 1;
        }
        self.inner.request();
    }

    pub async fn lock_list(&self) -> DigsResult<AttributeSnapshot> {
        self.inner.snapshot(|s| s.lock_list.clone()).await
    }

    pub async fn size_list(&self) -> DigsResult<AttributeSnapshot> {
        self.inner.snapshot(|s| s.size_list.clone()).await
    }

    pub async fn lock_holder(&self, lfn: &str) -> DigsResult<Option<String>> {
        Ok(self.lock_list().await?.get(lfn).cloned())
    }

    pub async fn file_size(&self, lfn: &str) -> DigsResult<Option<u64>> {
        Ok(self
            .size_list()
            .await?
            .get(lfn)
            .and_then(|s| s.trim().parse::<u64>().ok()))
    }

    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }
}

impl Drop for FileListCache {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct CountingRegistry {
        fetches: AtomicUsize,
        sizes: Mutex<HashMap<String, String>>,
        fail: AtomicBool,
        delay: Duration,
    }

    impl CountingRegistry {
        fn new(delay: Duration) -> Arc<Self> {
            let mut sizes = HashMap::new();
            sizes.insert("ens/cfg1".to_string(), "2000".to_string());
            Arc::new(Self {
                fetches: AtomicUsize::new(0),
                sizes: Mutex::new(sizes),
                fail: AtomicBool::new(false),
                delay,
            })
        }
    }

    #[async_trait]
    impl ReplicaRegistry for CountingRegistry {
        async fn get_file_locations(&self, _lfn: &str) -> DigsResult<Vec<String>> {
            Ok(Vec::new())
        }

        async fn get_attribute(&self, _lfn: &str, _attr: &str) -> DigsResult<Option<String>> {
            Ok(None)
        }

        async fn get_all_attribute_values(&self, attr: &str) -> DigsResult<HashMap<String, String>> {
            // the answer is taken before the delay, as a slow reply would be
            let result = if self.fail.load(Ordering::SeqCst) {
                Err(DigsError::Registry("RLS down".to_string()))
            } else if attr == ATTR_SIZE {
                self.fetches.fetch_add(1, Ordering::SeqCst);
                Ok(self.sizes.lock().unwrap().clone())
            } else {
                let mut locks = HashMap::new();
                locks.insert("ens/cfg1".to_string(), "/C=UK/CN=alice".to_string());
                Ok(locks)
            };
            tokio::time::sleep(self.delay).await;
            result
        }

        async fn get_file_list(&self, _wildcard: &str) -> DigsResult<BTreeMap<String, Vec<String>>> {
            Ok(BTreeMap::new())
        }

        async fn lfn_exists(&self, _lfn: &str) -> DigsResult<bool> {
            Ok(false)
        }

        async fn file_at_location(&self, _lfn: &str, _node: &str) -> DigsResult<bool> {
            Ok(false)
        }

        async fn list_location_files(&self, _node: &str) -> DigsResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_reader_waits_for_first_snapshot() {
        let registry = CountingRegistry::new(Duration::from_millis(50));
        let cache = FileListCache::start(registry.clone(), DEFAULT_REFRESH_INTERVAL);
        assert!(!cache.is_ready());

        let locks = cache.lock_list().await.unwrap();
        assert_eq!(locks.get("ens/cfg1").map(|s| s.as_str()), Some("/C=UK/CN=alice"));
        assert!(cache.is_ready());
        assert_eq!(cache.file_size("ens/cfg1").await.unwrap(), Some(2000));
        assert_eq!(cache.file_size("nope").await.unwrap(), None);
        assert_eq!(registry.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_discards_and_refetches() {
        let registry = CountingRegistry::new(Duration::ZERO);
        let cache = FileListCache::start(registry.clone(), DEFAULT_REFRESH_INTERVAL);
        cache.size_list().await.unwrap();

        registry
            .sizes
            .lock()
            .unwrap()
            .insert("ens/cfg2".to_string(), "10".to_string());
        // interval has not elapsed, so the stale snapshot is served
        assert!(cache.size_list().await.unwrap().get("ens/cfg2").is_none());

        cache.refresh();
        assert!(!cache.is_ready());
        let sizes = cache.size_list().await.unwrap();
        assert_eq!(sizes.get("ens/cfg2").map(|s| s.as_str()), Some("10"));
        assert_eq!(registry.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_interval_triggers_background_refresh() {
        let registry = CountingRegistry::new(Duration::ZERO);
        let cache = FileListCache::start(registry.clone(), Duration::from_millis(30));
        cache.size_list().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.fetches.load(Ordering::SeqCst) >= 2);
        assert!(cache.last_refresh().is_some());
    }

    #[tokio::test]
    async fn test_refresh_failure_reaches_waiting_reader() {
        let registry = CountingRegistry::new(Duration::ZERO);
        registry.fail.store(true, Ordering::SeqCst);
        let cache = FileListCache::start(registry.clone(), DEFAULT_REFRESH_INTERVAL);
        let err = cache.lock_list().await.unwrap_err();
        assert_eq!(err, DigsError::Registry("RLS down".to_string()));

        registry.fail.store(false, Ordering::SeqCst);
        cache.request_refresh();
        assert!(cache.lock_list().await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_during_pass_waits_for_newer_pass() {
        let registry = CountingRegistry::new(Duration::from_millis(200));
        let cache = FileListCache::start(registry.clone(), DEFAULT_REFRESH_INTERVAL);
        cache.size_list().await.unwrap();

        // second pass reads sizes at ~200ms and finishes at ~400ms
        cache.request_refresh();
        tokio::time::sleep(Duration::from_millis(300)).await;
        registry
            .sizes
            .lock()
            .unwrap()
            .insert("ens/cfg2".to_string(), "10".to_string());
        cache.refresh();

        let sizes = cache.size_list().await.unwrap();
        assert_eq!(sizes.get("ens/cfg2").map(|s| s.as_str()), Some("10"));
        assert!(cache.is_ready());
        assert_eq!(registry.fetches.load(Ordering::SeqCst), 3);
    }
}

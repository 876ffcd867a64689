//! Cluster bootstrap driver.
//!
//! `BulkLoadCoordinator` repopulates the distributed cache for one realm
//! from the durable store, segment by segment. One node wins leadership and
//! drives the run; progress is persisted after every window so a crashed
//! run resumes where it stopped. A segment is only marked finished once all
//! of its users are in the cache, so after a crash a segment may be loaded
//! twice but is never skipped.
//!
//! # Example
//!
//! ```ignore
//! use tokio::sync::watch;
//!
//! let (cancel_tx, cancel_rx) = watch::channel(false);
//! let coordinator = BulkLoadCoordinator::new(store, cache, progress, election, config);
//!
//! let report = coordinator.run(&realm, cancel_rx).await?;
//! println!("loaded {} users in {} windows", report.users_loaded, report.windows);
//! ```

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use realmcache_core::{
    new_node_id, BootstrapConfig, BootstrapError, CacheError, CacheResult, Held, Lease, NodeId,
    RealmId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::coordination::{LeaderElection, ProgressStore};
use super::observe::{ProgressEvent, ProgressSink, TracingProgressSink};
use super::segments::SegmentProgress;
use crate::cache::{CachedUser, DistributedCache, RealmScopedKey};
use crate::store::UserStore;

/// Summary of a completed bootstrap run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapReport {
    pub realm: RealmId,
    /// Segments loaded by this run (excludes those finished before a resume).
    pub segments_loaded: usize,
    pub users_loaded: usize,
    pub windows: usize,
    /// Transient failures retried.
    pub retries: u32,
    /// Whether the run continued a persisted record.
    pub resumed: bool,
}

/// Outcome of loading one window of segments.
struct WindowOutcome {
    /// Segment and error of the first transient failure.
    transient: Option<(usize, CacheError)>,
    /// Segment and error of the first non-transient failure.
    fatal: Option<(usize, CacheError)>,
}

/// Drives a realm's bootstrap to completion.
pub struct BulkLoadCoordinator<S, C, P, L>
where
    S: UserStore,
    C: DistributedCache,
    P: ProgressStore,
    L: LeaderElection,
{
    store: Arc<S>,
    cache: Arc<C>,
    progress_store: Arc<P>,
    election: Arc<L>,
    sink: Arc<dyn ProgressSink>,
    config: BootstrapConfig,
    node: NodeId,
}

impl<S, C, P, L> BulkLoadCoordinator<S, C, P, L>
where
    S: UserStore,
    C: DistributedCache,
    P: ProgressStore,
    L: LeaderElection,
{
    pub fn new(
        store: Arc<S>,
        cache: Arc<C>,
        progress_store: Arc<P>,
        election: Arc<L>,
        config: BootstrapConfig,
    ) -> Self {
        Self {
            store,
            cache,
            progress_store,
            election,
            sink: Arc::new(TracingProgressSink),
            config,
            node: new_node_id(),
        }
    }

    /// Report progress to `sink` instead of the tracing log.
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_node(mut self, node: NodeId) -> Self {
        self.node = node;
        self
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    /// Bootstrap `realm`.
    ///
    /// Fails with `NotLeader` if another node holds the bootstrap lease.
    /// Setting `cancel` to `true` stops the run at the next window boundary
    /// with `Cancelled`; progress made so far stays persisted. The lease is
    /// released however the run ends.
    pub async fn run(
        &self,
        realm: &RealmId,
        cancel: watch::Receiver<bool>,
    ) -> CacheResult<BootstrapReport> {
        self.config.validate()?;

        let Some(lease) = self
            .election
            .acquire_bootstrap_leadership(realm, self.node, self.config.lease_ttl)
            .await?
        else {
            debug!(realm = %realm, node = %self.node, "Bootstrap already led by another node");
            return Err(BootstrapError::NotLeader {
                realm: realm.clone(),
            }
            .into());
        };

        info!(
            realm = %realm,
            node = %self.node,
            lease_id = %lease.lease_id(),
            batch_size = self.config.batch_size,
            load_concurrency = self.config.load_concurrency,
            "Acquired bootstrap leadership"
        );

        let result = self.drive(realm, &lease, cancel).await;
        if let Err(e) = &result {
            self.sink.emit(ProgressEvent::Failed {
                realm: realm.clone(),
                reason: e.to_string(),
            });
        }

        let released = self.election.release(lease).await;
        if let Err(e) = &released {
            warn!(realm = %realm, error = %e, "Failed to release bootstrap lease");
        }

        let report = result?;
        released?;
        Ok(report)
    }

    async fn drive(
        &self,
        realm: &RealmId,
        lease: &Lease<Held>,
        mut cancel: watch::Receiver<bool>,
    ) -> CacheResult<BootstrapReport> {
        let segment_count = self.cache.segment_count();
        let batch = self.config.batch_size;

        let (mut progress, resumed) = match self.progress_store.load(realm).await? {
            Some(stored) if stored.segment_count() == segment_count => (stored, true),
            Some(stored) => {
                warn!(
                    realm = %realm,
                    stored_segments = stored.segment_count(),
                    segment_count,
                    "Discarding bootstrap progress recorded for another topology"
                );
                (SegmentProgress::new(segment_count), false)
            }
            None => (SegmentProgress::new(segment_count), false),
        };

        self.sink.emit(ProgressEvent::Started {
            realm: realm.clone(),
            resumed,
            segment_count,
            finished: progress.finished_count(),
        });

        let mut report = BootstrapReport {
            realm: realm.clone(),
            segments_loaded: 0,
            users_loaded: 0,
            windows: 0,
            retries: 0,
            resumed,
        };
        let mut cursor = 0usize;
        let mut attempts = 0u32;

        while !progress.is_finished() {
            let window = progress.segments_to_load(cursor, batch);
            if window.is_empty() {
                cursor = next_cursor(cursor, batch, segment_count);
                continue;
            }

            if *cancel.borrow() {
                info!(realm = %realm, progress = %progress, "Bootstrap cancelled");
                return Err(BootstrapError::Cancelled.into());
            }
            if !self
                .election
                .renew_leadership(lease, self.config.lease_ttl)
                .await?
            {
                warn!(realm = %realm, node = %self.node, "Bootstrap leadership lost");
                return Err(BootstrapError::LeadershipLost {
                    realm: realm.clone(),
                }
                .into());
            }

            let (loaded, outcome) = self.load_window(realm, &window, segment_count).await;

            // A lease lost mid-window leaves the record to the new leader.
            if !self.election.is_leader(lease).await? {
                warn!(
                    realm = %realm,
                    node = %self.node,
                    "Bootstrap leadership lost during window, discarding its progress"
                );
                return Err(BootstrapError::LeadershipLost {
                    realm: realm.clone(),
                }
                .into());
            }

            for (segment, users) in loaded {
                progress.mark_segment_finished(segment)?;
                report.segments_loaded += 1;
                report.users_loaded += users;
            }

            self.progress_store.save(realm, &progress).await?;
            report.windows += 1;
            self.sink.emit(ProgressEvent::WindowCompleted {
                realm: realm.clone(),
                indicator: progress.progress_indicator(),
                finished: progress.finished_count(),
                total: segment_count,
            });

            if let Some((segment, e)) = outcome.fatal {
                return Err(BootstrapError::Fatal {
                    segment,
                    reason: e.to_string(),
                }
                .into());
            }

            match outcome.transient {
                Some((segment, e)) => {
                    attempts += 1;
                    report.retries += 1;
                    if attempts > self.config.retry.max_retries {
                        return Err(BootstrapError::RetriesExhausted { segment, attempts }.into());
                    }
                    let backoff = self.config.retry.backoff_for(attempts);
                    warn!(
                        realm = %realm,
                        segment,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transient failure loading segment, retrying window"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        changed = cancel.changed() => {
                            if changed.is_ok() && *cancel.borrow() {
                                info!(realm = %realm, progress = %progress, "Bootstrap cancelled");
                                return Err(BootstrapError::Cancelled.into());
                            }
                            if changed.is_err() {
                                tokio::time::sleep(backoff).await;
                            }
                        }
                    }
                }
                None => {
                    attempts = 0;
                    cursor = next_cursor(cursor, batch, segment_count);
                }
            }
        }

        self.progress_store.remove(realm).await?;
        self.sink.emit(ProgressEvent::Finished {
            realm: realm.clone(),
            users_loaded: report.users_loaded,
        });
        info!(
            realm = %realm,
            segments_loaded = report.segments_loaded,
            users_loaded = report.users_loaded,
            windows = report.windows,
            retries = report.retries,
            resumed,
            "Bootstrap completed"
        );
        Ok(report)
    }

    /// Load every segment of `window`, at most `load_concurrency` at once.
    ///
    /// Returns the segments that loaded fully with their user counts, plus
    /// the first failure of each kind.
    async fn load_window(
        &self,
        realm: &RealmId,
        window: &[usize],
        segment_count: usize,
    ) -> (Vec<(usize, usize)>, WindowOutcome) {
        let results: Vec<(usize, CacheResult<usize>)> = stream::iter(window.iter().copied())
            .map(|segment| async move {
                (segment, self.load_segment(realm, segment, segment_count).await)
            })
            .buffer_unordered(self.config.load_concurrency)
            .collect()
            .await;

        let mut loaded = Vec::with_capacity(results.len());
        let mut outcome = WindowOutcome {
            transient: None,
            fatal: None,
        };
        for (segment, result) in results {
            match result {
                Ok(users) => loaded.push((segment, users)),
                Err(e) if e.is_transient() => {
                    outcome.transient.get_or_insert((segment, e));
                }
                Err(e) => {
                    outcome.fatal.get_or_insert((segment, e));
                }
            }
        }
        loaded.sort_unstable();
        (loaded, outcome)
    }

    async fn load_segment(
        &self,
        realm: &RealmId,
        segment: usize,
        segment_count: usize,
    ) -> CacheResult<usize> {
        let ids = self
            .store
            .user_ids_in_segment(realm, segment, segment_count)
            .await?;

        let mut loaded = 0;
        let mut superseded = 0;
        for id in ids {
            let revision = self.cache.next_revision();
            // Deleted since enumeration.
            let Some(live) = self.store.user_by_id(realm, &id).await? else {
                continue;
            };
            let snapshot = CachedUser::eager(realm.clone(), live.as_ref(), revision);
            if self
                .cache
                .put(RealmScopedKey::user(realm, &id), Arc::new(snapshot))
                .await?
            {
                loaded += 1;
            } else {
                superseded += 1;
            }
        }
        debug!(realm = %realm, segment, users = loaded, superseded, "Loaded segment");
        Ok(loaded)
    }
}

fn next_cursor(cursor: usize, batch: usize, segment_count: usize) -> usize {
    let next = cursor.saturating_add(batch);
    if next >= segment_count {
        0
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::coordination::{InMemoryLeaderElection, InMemoryProgressStore};
    use crate::bootstrap::observe::RecordingProgressSink;
    use crate::cache::InMemoryDistributedCache;
    use crate::store::{InMemoryUserStore, SegmentFault, UserRecord};
    use crate::store::UserModel;
    use realmcache_core::{Group, GroupId, RetryConfig, Role, RoleId, UserId};
    use std::time::Duration;

    type TestCoordinator = BulkLoadCoordinator<
        InMemoryUserStore,
        InMemoryDistributedCache,
        InMemoryProgressStore,
        InMemoryLeaderElection,
    >;

    struct Harness {
        store: Arc<InMemoryUserStore>,
        cache: Arc<InMemoryDistributedCache>,
        progress: Arc<InMemoryProgressStore>,
        election: Arc<InMemoryLeaderElection>,
        sink: Arc<RecordingProgressSink>,
    }

    impl Harness {
        fn new(users: usize, segments: usize) -> Self {
            let store = Arc::new(InMemoryUserStore::new());
            for i in 0..users {
                store
                    .insert_user(&realm(), format!("u{}", i), Some(i as i64), UserRecord::new(&format!("user{}", i)))
                    .unwrap();
            }
            Self {
                store,
                cache: Arc::new(InMemoryDistributedCache::new(segments)),
                progress: Arc::new(InMemoryProgressStore::new()),
                election: Arc::new(InMemoryLeaderElection::new()),
                sink: Arc::new(RecordingProgressSink::new()),
            }
        }

        fn coordinator(&self, config: BootstrapConfig) -> TestCoordinator {
            BulkLoadCoordinator::new(
                Arc::clone(&self.store),
                Arc::clone(&self.cache),
                Arc::clone(&self.progress),
                Arc::clone(&self.election),
                config,
            )
            .with_sink(Arc::clone(&self.sink) as Arc<dyn ProgressSink>)
        }
    }

    fn realm() -> RealmId {
        RealmId::new("acme")
    }

    fn config(batch: usize) -> BootstrapConfig {
        BootstrapConfig::default()
            .with_batch_size(batch)
            .with_concurrency(2)
            .with_retry(RetryConfig::immediate(2))
    }

    fn not_cancelled() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn test_full_bootstrap_loads_every_user() {
        let h = Harness::new(40, 10);
        let report = h.coordinator(config(4)).run(&realm(), not_cancelled()).await.unwrap();

        assert_eq!(report.users_loaded, 40);
        assert_eq!(report.segments_loaded, 10);
        assert_eq!(report.windows, 3);
        assert!(!report.resumed);
        assert_eq!(h.cache.len(), 40);

        // Record removed and lease released on success.
        assert!(h.progress.raw(&realm()).is_none());
        assert!(h.election.holder(&realm()).unwrap().is_none());
        assert_eq!(h.sink.indicators().len(), 3);
        assert!(matches!(h.sink.events().last(), Some(ProgressEvent::Finished { users_loaded: 40, .. })));
    }

    #[tokio::test]
    async fn test_bulk_loaded_snapshots_are_eager() {
        let h = Harness::new(3, 2);
        h.coordinator(config(2)).run(&realm(), not_cancelled()).await.unwrap();

        let key = RealmScopedKey::user(&realm(), &UserId::new("u1"));
        let cached = h.cache.get(&key).await.unwrap().unwrap();
        assert!(cached.attributes_loaded());
    }

    #[tokio::test]
    async fn test_transient_failure_retries_window() {
        let h = Harness::new(20, 4);
        h.store.inject_segment_fault(1, SegmentFault::Transient, 2).unwrap();

        let report = h.coordinator(config(4)).run(&realm(), not_cancelled()).await.unwrap();
        assert_eq!(report.retries, 2);
        assert_eq!(report.segments_loaded, 4);
        assert_eq!(report.users_loaded, 20);
        assert_eq!(report.windows, 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let h = Harness::new(20, 4);
        h.store.inject_segment_fault(3, SegmentFault::Transient, 10).unwrap();

        let err = h.coordinator(config(4)).run(&realm(), not_cancelled()).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::Bootstrap(BootstrapError::RetriesExhausted { segment: 3, attempts: 3 })
        ));

        let saved = h.progress.load(&realm()).await.unwrap().unwrap();
        assert!(!saved.is_segment_finished(3));
        assert_eq!(saved.finished_count(), 3);
        assert!(h.election.holder(&realm()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fatal_failure_halts_without_marking() {
        let h = Harness::new(20, 4);
        h.store.inject_segment_fault(2, SegmentFault::Fatal, 1).unwrap();

        let err = h.coordinator(config(4)).run(&realm(), not_cancelled()).await.unwrap_err();
        assert!(matches!(err, CacheError::Bootstrap(BootstrapError::Fatal { segment: 2, .. })));

        let saved = h.progress.load(&realm()).await.unwrap().unwrap();
        assert!(!saved.is_segment_finished(2));
        assert!(matches!(h.sink.events().last(), Some(ProgressEvent::Failed { .. })));
    }

    #[tokio::test]
    async fn test_resume_skips_finished_segments() {
        let h = Harness::new(30, 6);
        let mut partial = SegmentProgress::new(6);
        for segment in 0..4 {
            partial.mark_segment_finished(segment).unwrap();
        }
        h.progress.save(&realm(), &partial).await.unwrap();

        let report = h.coordinator(config(3)).run(&realm(), not_cancelled()).await.unwrap();
        assert!(report.resumed);
        assert_eq!(report.segments_loaded, 2);
        assert_eq!(report.windows, 1);
        assert_eq!(h.store.segment_scans(), 2);
    }

    #[tokio::test]
    async fn test_topology_change_discards_record() {
        let h = Harness::new(10, 8);
        let mut stale = SegmentProgress::new(4);
        stale.mark_segment_finished(0).unwrap();
        h.progress.save(&realm(), &stale).await.unwrap();

        let report = h.coordinator(config(8)).run(&realm(), not_cancelled()).await.unwrap();
        assert!(!report.resumed);
        assert_eq!(report.segments_loaded, 8);
    }

    #[tokio::test]
    async fn test_second_node_is_not_leader() {
        let h = Harness::new(5, 4);
        let other = h
            .election
            .acquire_bootstrap_leadership(&realm(), new_node_id(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(other.is_some());

        let err = h.coordinator(config(4)).run(&realm(), not_cancelled()).await.unwrap_err();
        assert!(matches!(err, CacheError::Bootstrap(BootstrapError::NotLeader { .. })));
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_first_window() {
        let h = Harness::new(10, 4);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let err = h.coordinator(config(2)).run(&realm(), rx).await.unwrap_err();
        assert!(matches!(err, CacheError::Bootstrap(BootstrapError::Cancelled)));
        assert!(h.cache.is_empty());
        assert!(h.election.holder(&realm()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_segments_finishes_immediately() {
        let h = Harness::new(0, 0);
        let report = h.coordinator(config(4)).run(&realm(), not_cancelled()).await.unwrap();
        assert_eq!(report.windows, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let h = Harness::new(1, 1);
        let err = h.coordinator(config(0)).run(&realm(), not_cancelled()).await.unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    /// Store that hands the realm to another node while `segment` loads.
    struct TakeoverStore {
        inner: InMemoryUserStore,
        election: Arc<InMemoryLeaderElection>,
        progress: Arc<InMemoryProgressStore>,
        segment: usize,
        successor: SegmentProgress,
    }

    #[async_trait::async_trait]
    impl UserStore for TakeoverStore {
        async fn user_by_id(
            &self,
            realm: &RealmId,
            id: &UserId,
        ) -> CacheResult<Option<Arc<dyn UserModel>>> {
            self.inner.user_by_id(realm, id).await
        }

        async fn role_by_id(
            &self,
            realm: &RealmId,
            id: &RoleId,
        ) -> CacheResult<Option<Role>> {
            self.inner.role_by_id(realm, id).await
        }

        async fn group_by_id(
            &self,
            realm: &RealmId,
            id: &GroupId,
        ) -> CacheResult<Option<Group>> {
            self.inner.group_by_id(realm, id).await
        }

        async fn user_ids_in_segment(
            &self,
            realm: &RealmId,
            segment: usize,
            segment_count: usize,
        ) -> CacheResult<Vec<UserId>> {
            if segment == self.segment {
                self.election.revoke(realm)?;
                let successor = self
                    .election
                    .acquire_bootstrap_leadership(realm, new_node_id(), Duration::from_secs(60))
                    .await?;
                assert!(successor.is_some());
                self.progress.save(realm, &self.successor).await?;
            }
            self.inner.user_ids_in_segment(realm, segment, segment_count).await
        }
    }

    #[tokio::test]
    async fn test_lease_lost_mid_window_does_not_overwrite_successor() {
        let inner = InMemoryUserStore::new();
        for i in 0..40 {
            inner
                .insert_user(&realm(), format!("u{}", i), None, UserRecord::new(&format!("user{}", i)))
                .unwrap();
        }
        let election = Arc::new(InMemoryLeaderElection::new());
        let progress = Arc::new(InMemoryProgressStore::new());
        let mut successor = SegmentProgress::new(8);
        for segment in 0..7 {
            successor.mark_segment_finished(segment).unwrap();
        }
        let store = Arc::new(TakeoverStore {
            inner,
            election: Arc::clone(&election),
            progress: Arc::clone(&progress),
            segment: 5,
            successor: successor.clone(),
        });
        let sink = Arc::new(RecordingProgressSink::new());

        let err = BulkLoadCoordinator::new(
            store,
            Arc::new(InMemoryDistributedCache::new(8)),
            Arc::clone(&progress),
            election,
            config(4),
        )
        .with_sink(Arc::clone(&sink) as Arc<dyn ProgressSink>)
        .run(&realm(), not_cancelled())
        .await
        .unwrap_err();

        assert!(matches!(err, CacheError::Bootstrap(BootstrapError::LeadershipLost { .. })));
        // The successor's record survives; this node would have marked all 8.
        let saved = progress.load(&realm()).await.unwrap().unwrap();
        assert_eq!(saved, successor);
        assert!(!saved.is_segment_finished(7));
        // Only the first window was published by this node.
        assert_eq!(sink.indicators().len(), 1);
    }

    #[test]
    fn test_next_cursor_wraps() {
        assert_eq!(next_cursor(0, 4, 10), 4);
        assert_eq!(next_cursor(8, 4, 10), 0);
        assert_eq!(next_cursor(6, 4, 10), 0);
    }
}

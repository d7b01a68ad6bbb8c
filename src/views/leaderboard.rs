//! Live top-N leaderboard
//!
//! One [`LeaderboardCache`] per process. It starts empty and unloaded; the
//! first `StatsChanged` (or the driver's mount) fills it. The HTTP leaderboard
//! endpoint reads the same cache.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use super::{Reconcile, SnapshotSource, View};
use crate::bus::TopicSet;
use crate::error::Result;
use crate::types::{ChangeEvent, Topic, UserStanding};

/// How the cache took a `StatsChanged`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUpdate {
    /// A cached user moved within the top-N
    Reranked,
    /// The user stays outside the top-N
    Ignored,
    /// An uncached user may enter the top-N, or nothing is loaded yet
    NeedsRefetch,
}

/// Cached top-N standings, points descending then user id ascending
#[derive(Debug, Clone)]
pub struct LeaderboardCache {
    capacity: usize,
    entries: Vec<UserStanding>,
    loaded: bool,
}

impl LeaderboardCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Vec::new(),
            loaded: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Replace the contents with a fresh top-N read
    pub fn replace(&mut self, mut entries: Vec<UserStanding>) {
        entries.sort_by(UserStanding::rank_cmp);
        entries.truncate(self.capacity);
        self.entries = entries;
        self.loaded = true;
    }

    pub fn invalidate(&mut self) {
        self.entries.clear();
        self.loaded = false;
    }

    pub fn entries(&self) -> &[UserStanding] {
        &self.entries
    }

    /// First `limit` entries, if the cache can answer for that many
    pub fn top(&self, limit: usize) -> Option<Vec<UserStanding>> {
        if !self.loaded || limit > self.capacity {
            return None;
        }
        Some(self.entries.iter().take(limit).cloned().collect())
    }

    pub fn on_stats_changed(&mut self, user_id: &str, points: u64, donation_count: u64) -> CacheUpdate {
        if !self.loaded {
            return CacheUpdate::NeedsRefetch;
        }

        if let Some(entry) = self.entries.iter_mut().find(|e| e.user_id == user_id) {
            // Counters never decrease; an older event must not roll back a newer read.
            entry.points = entry.points.max(points);
            entry.donation_count = entry.donation_count.max(donation_count);
            self.entries.sort_by(UserStanding::rank_cmp);
            return CacheUpdate::Reranked;
        }

        let candidate = UserStanding {
            points,
            donation_count,
            ..UserStanding::zero(user_id)
        };
        let enters = self.entries.len() < self.capacity
            || self
                .entries
                .last()
                .map_or(true, |last| candidate.rank_cmp(last).is_lt());
        if enters {
            CacheUpdate::NeedsRefetch
        } else {
            CacheUpdate::Ignored
        }
    }
}

/// Shared handle onto the process-wide leaderboard cache
pub type SharedLeaderboard = Arc<RwLock<LeaderboardCache>>;

/// View that keeps a [`LeaderboardCache`] in step with `stats` events
pub struct LeaderboardView {
    cache: SharedLeaderboard,
}

impl LeaderboardView {
    pub fn new(cache: SharedLeaderboard) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> SharedLeaderboard {
        Arc::clone(&self.cache)
    }

    async fn refetch(&self, source: &dyn SnapshotSource) -> Result<()> {
        let capacity = self.cache.read().await.capacity();
        let entries = source.leaderboard(capacity).await?;
        self.cache.write().await.replace(entries);
        Ok(())
    }
}

#[async_trait::async_trait]
impl View for LeaderboardView {
    fn name(&self) -> &'static str {
        "leaderboard"
    }

    fn topics(&self) -> TopicSet {
        TopicSet::only(Topic::Stats)
    }

    async fn resync(&mut self, source: &dyn SnapshotSource) -> Result<()> {
        self.cache.write().await.invalidate();
        self.refetch(source).await
    }

    async fn apply(&mut self, event: &ChangeEvent, source: &dyn SnapshotSource) -> Result<Reconcile> {
        let ChangeEvent::StatsChanged { user_id, points, donation_count } = event else {
            return Ok(Reconcile::Ignored);
        };

        let update = self
            .cache
            .write()
            .await
            .on_stats_changed(user_id, *points, *donation_count);

        match update {
            CacheUpdate::Reranked => Ok(Reconcile::Applied),
            CacheUpdate::Ignored => Ok(Reconcile::Ignored),
            CacheUpdate::NeedsRefetch => {
                debug!(%user_id, points, "Leaderboard entry candidate, refetching top-N");
                self.refetch(source).await?;
                Ok(Reconcile::Refetched)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ActionRequest;
    use crate::services::Services;

    fn standing(user: &str, points: u64) -> UserStanding {
        UserStanding {
            points,
            ..UserStanding::zero(user)
        }
    }

    fn ids(entries: &[UserStanding]) -> Vec<&str> {
        entries.iter().map(|e| e.user_id.as_str()).collect()
    }

    #[test]
    fn test_unloaded_cache_needs_refetch() {
        let mut cache = LeaderboardCache::new(3);
        assert_eq!(cache.on_stats_changed("a", 5, 0), CacheUpdate::NeedsRefetch);
        assert!(cache.top(3).is_none());
    }

    #[test]
    fn test_rerank_cached_user() {
        let mut cache = LeaderboardCache::new(3);
        cache.replace(vec![standing("a", 30), standing("b", 20), standing("c", 10)]);

        assert_eq!(cache.on_stats_changed("c", 40, 1), CacheUpdate::Reranked);
        assert_eq!(ids(cache.entries()), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_stale_event_does_not_lower_points() {
        let mut cache = LeaderboardCache::new(2);
        cache.replace(vec![standing("a", 30)]);
        cache.on_stats_changed("a", 20, 0);
        assert_eq!(cache.entries()[0].points, 30);
    }

    #[test]
    fn test_outsider_below_cutoff_is_ignored() {
        let mut cache = LeaderboardCache::new(2);
        cache.replace(vec![standing("a", 30), standing("b", 20)]);

        assert_eq!(cache.on_stats_changed("z", 20, 0), CacheUpdate::Ignored);
        assert_eq!(cache.on_stats_changed("c", 25, 0), CacheUpdate::NeedsRefetch);
        // Equal points, smaller id ranks first
        assert_eq!(cache.on_stats_changed("aa", 20, 0), CacheUpdate::NeedsRefetch);
    }

    #[tokio::test]
    async fn test_view_refetches_when_newcomer_enters() {
        let services = Services::in_memory();
        for (user, points) in [("a", 30), ("b", 20), ("c", 10)] {
            services.ledger.record_action(ActionRequest::new(user, points, 0)).await.unwrap();
        }

        let mut view = LeaderboardView::new(Arc::new(RwLock::new(LeaderboardCache::new(2))));
        view.resync(&services).await.unwrap();
        assert_eq!(ids(view.cache.read().await.entries()), vec!["a", "b"]);

        let standing = services.ledger.record_action(ActionRequest::new("c", 15, 0)).await.unwrap();
        let reconcile = view.apply(&ChangeEvent::stats(&standing), &services).await.unwrap();

        assert_eq!(reconcile, Reconcile::Refetched);
        assert_eq!(ids(view.cache.read().await.entries()), vec!["a", "c"]);
    }
}

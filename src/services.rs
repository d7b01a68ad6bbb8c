//! Service container
//!
//! Holds the ledger, the donation service and everything they share. Built
//! once at startup and handed to the HTTP layer and the view drivers.
//!
//! ```text
//! HTTP handlers / view drivers
//!     ↓
//! LedgerService, DonationService
//!     ↓
//! LedgerStore (SQLite or memory)   EventBus
//! ```

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::badges::default_catalog;
use crate::bus::EventBus;
use crate::config::PointsConfig;
use crate::donations::DonationService;
use crate::error::Result;
use crate::ledger::LedgerService;
use crate::notify::{LogNotifier, Notifier};
use crate::store::{run_blocking, LedgerStore, MemoryStore};
use crate::types::{Badge, Donation, EarnedBadge, UserStanding};
use crate::views::{LeaderboardCache, SharedLeaderboard, SnapshotSource};

/// Leaderboard size used when none is configured
pub const DEFAULT_LEADERBOARD_SIZE: usize = 10;

pub struct Services {
    pub store: Arc<dyn LedgerStore>,
    pub bus: Arc<EventBus>,
    pub ledger: Arc<LedgerService>,
    pub donations: Arc<DonationService>,
    pub notifier: Arc<dyn Notifier>,
    /// Process-wide top-N, kept live by a leaderboard view
    pub leaderboard: SharedLeaderboard,
    pub points: PointsConfig,
}

impl Services {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        bus: Arc<EventBus>,
        notifier: Arc<dyn Notifier>,
        points: PointsConfig,
        leaderboard_size: usize,
    ) -> Self {
        let ledger = Arc::new(LedgerService::new(Arc::clone(&store), Arc::clone(&bus)));
        let donations = Arc::new(DonationService::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&bus),
            Arc::clone(&notifier),
            points.clone(),
        ));

        Self {
            store,
            bus,
            ledger,
            donations,
            notifier,
            leaderboard: Arc::new(RwLock::new(LeaderboardCache::new(leaderboard_size))),
            points,
        }
    }

    /// Memory store with the built-in catalog and a log-only notifier (for testing)
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStore::with_catalog(default_catalog())),
            Arc::new(EventBus::new()),
            Arc::new(LogNotifier),
            PointsConfig::default(),
            DEFAULT_LEADERBOARD_SIZE,
        )
    }

    /// Top `limit` standings, from the live cache when it can answer
    pub async fn top_standings(&self, limit: usize) -> Result<Vec<UserStanding>> {
        if let Some(entries) = self.leaderboard.read().await.top(limit) {
            return Ok(entries);
        }
        self.ledger.leaderboard(limit).await
    }
}

#[async_trait::async_trait]
impl SnapshotSource for Services {
    async fn leaderboard(&self, limit: usize) -> Result<Vec<UserStanding>> {
        self.ledger.leaderboard(limit).await
    }

    async fn standing(&self, user_id: &str) -> Result<UserStanding> {
        self.ledger.get_standing(user_id).await
    }

    async fn earned_badges(&self, user_id: &str) -> Result<Vec<EarnedBadge>> {
        self.ledger.earned_badges(user_id).await
    }

    async fn badge_catalog(&self) -> Result<Vec<Badge>> {
        self.ledger.badge_catalog().await
    }

    async fn donation(&self, id: &str) -> Result<Option<Donation>> {
        let key = id.to_string();
        run_blocking(&self.store, move |store| store.donation(&key)).await
    }

    async fn available_donations(&self) -> Result<Vec<Donation>> {
        self.donations.list_available().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ActionRequest;

    #[tokio::test]
    async fn test_top_standings_falls_back_to_store() {
        let services = Services::in_memory();
        services.ledger.record_action(ActionRequest::new("ada", 5, 0)).await.unwrap();

        // Cache not loaded yet
        let top = services.top_standings(3).await.unwrap();
        assert_eq!(top.len(), 1);

        services.leaderboard.write().await.replace(Vec::new());
        assert!(services.top_standings(3).await.unwrap().is_empty());
    }
}

//! Ledger persistence
//!
//! The ledger needs four things from its store:
//!
//! - an atomic get-or-create-then-increment of a user's standing
//! - a badge insert guarded by `(user_id, badge_id)` uniqueness that ignores
//!   duplicates
//! - an ordered read of the badge catalog
//! - a top-N read of standings by points descending
//!
//! [`LedgerStore::apply_action`] bundles the first two (plus the badge
//! selection callback) into one transaction, so a failed write leaves no
//! partial state behind.
//!
//! ## Implementations
//!
//! - [`SqliteStore`] - durable, WAL-mode SQLite file
//! - [`MemoryStore`] - sharded in-memory maps for dev mode and tests

pub mod memory;
pub mod schema;
pub mod sqlite;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{LedgerError, StoreError};
use crate::types::{Badge, Donation, DonationStatus, EarnedBadge, UserStanding};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Picks the badges to award for a freshly updated standing.
///
/// Arguments are the new standing, the catalog in evaluation order, and the
/// ids the user already holds.
pub type AwardSelector<'a> = &'a (dyn Fn(&UserStanding, &[Badge], &HashSet<String>) -> Vec<Badge> + Sync);

/// A validated point/donation increment for one user
#[derive(Debug, Clone)]
pub struct LedgerAction {
    pub user_id: String,
    pub points_delta: u64,
    pub donation_increment: u64,
    /// Idempotency key; an action id is applied at most once
    pub action_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// Result of [`LedgerStore::apply_action`]
#[derive(Debug, Clone)]
pub struct AppliedAction {
    pub standing: UserStanding,
    /// Badges newly inserted by this action, lowest threshold first
    pub awarded: Vec<EarnedBadge>,
    /// True when the action id had already been applied; nothing changed
    pub replayed: bool,
}

pub trait LedgerStore: Send + Sync {
    /// Increment the standing, then insert whatever `select_awards` picks,
    /// atomically. Duplicate badge inserts are skipped silently.
    fn apply_action(
        &self,
        action: &LedgerAction,
        select_awards: AwardSelector<'_>,
    ) -> Result<AppliedAction, StoreError>;

    fn standing(&self, user_id: &str) -> Result<Option<UserStanding>, StoreError>;

    fn earned_badges(&self, user_id: &str) -> Result<Vec<EarnedBadge>, StoreError>;

    /// Catalog ordered by threshold ascending, then id
    fn badge_catalog(&self) -> Result<Vec<Badge>, StoreError>;

    /// Insert or replace catalog entries (startup seeding only)
    fn upsert_badges(&self, badges: &[Badge]) -> Result<(), StoreError>;

    /// Standings ordered by points descending, user id ascending
    fn top_standings(&self, limit: usize) -> Result<Vec<UserStanding>, StoreError>;

    fn insert_donation(&self, donation: &Donation) -> Result<(), StoreError>;

    fn donation(&self, id: &str) -> Result<Option<Donation>, StoreError>;

    fn update_donation_status(
        &self,
        id: &str,
        status: DonationStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Donation>, StoreError>;

    fn delete_donation(&self, id: &str) -> Result<bool, StoreError>;

    fn available_donations(&self) -> Result<Vec<Donation>, StoreError>;
}

/// Run a store call on the blocking pool.
pub(crate) async fn run_blocking<T, F>(store: &Arc<dyn LedgerStore>, f: F) -> Result<T, LedgerError>
where
    F: FnOnce(&dyn LedgerStore) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| LedgerError::Internal(format!("store task failed: {}", e)))?
        .map_err(LedgerError::from)
}

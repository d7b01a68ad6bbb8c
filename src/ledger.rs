//! Ledger service - points, donation counts and badge awards
//!
//! Every mutation for a user runs under that user's lock: the standing
//! increment, badge evaluation and event publication happen as one unit, so
//! two concurrent actions for the same user can never both start from the
//! same base state. Different users never share a lock.
//!
//! ## Flow
//!
//! ```text
//! record_action
//!     │  validate (nothing touched on failure)
//!     ▼
//! per-user lock ──► store.apply_action (increment + badge inserts, one tx)
//!     │
//!     ▼
//! publish StatsChanged, then BadgeAwarded... (non-blocking)
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::badges;
use crate::bus::EventBus;
use crate::config::PointsConfig;
use crate::error::{LedgerError, Result};
use crate::store::{run_blocking, LedgerAction, LedgerStore};
use crate::types::{ActionKind, Badge, ChangeEvent, EarnedBadge, UserStanding};

/// Longest accepted user id, in bytes
pub const MAX_USER_ID_LEN: usize = 128;

/// A request to grant points for one qualifying action
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub user_id: String,
    pub points_delta: u64,
    pub donation_increment: u64,
    pub action_id: Option<String>,
}

impl ActionRequest {
    pub fn new(user_id: impl Into<String>, points_delta: u64, donation_increment: u64) -> Self {
        Self {
            user_id: user_id.into(),
            points_delta,
            donation_increment,
            action_id: None,
        }
    }

    /// Build a request from the configured point table.
    ///
    /// `Adjustment` has no table entry and needs explicit deltas.
    pub fn for_kind(kind: ActionKind, user_id: impl Into<String>, points: &PointsConfig) -> Result<Self> {
        let (points_delta, donation_increment) = points
            .award_for(kind)
            .ok_or_else(|| LedgerError::Validation("adjustments need an explicit points delta".into()))?;
        Ok(Self::new(user_id, points_delta, donation_increment))
    }

    /// Attach an idempotency key; retries with the same key apply once
    pub fn with_action_id(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = Some(action_id.into());
        self
    }
}

/// What one `record_action` call did
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub standing: UserStanding,
    pub awarded: Vec<EarnedBadge>,
    /// The action id had already been applied; nothing changed or was published
    pub replayed: bool,
}

/// Per-user async locks, dropped from the table once nobody holds or waits on them
#[derive(Default)]
struct UserLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

struct UserGuard {
    table: Arc<UserLocks>,
    user_id: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl UserLocks {
    async fn acquire(self: &Arc<Self>, user_id: &str) -> UserGuard {
        let lock = self
            .locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = Arc::clone(&lock).lock_owned().await;

        UserGuard {
            table: Arc::clone(self),
            user_id: user_id.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    fn len(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for UserGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Two references left (table + ours) means no holder and no waiter.
        self.table
            .locks
            .remove_if(&self.user_id, |_, lock| Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2);
    }
}

/// Owns every write to standings and earned badges
pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    bus: Arc<EventBus>,
    locks: Arc<UserLocks>,
}

impl LedgerService {
    pub fn new(store: Arc<dyn LedgerStore>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            locks: Arc::new(UserLocks::default()),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Apply a qualifying action and return the new standing
    pub async fn record_action(&self, request: ActionRequest) -> Result<UserStanding> {
        self.record_action_detailed(request).await.map(|outcome| outcome.standing)
    }

    /// Apply a qualifying action, reporting newly awarded badges as well.
    ///
    /// The work runs on its own task: if the caller stops waiting, the
    /// increment-evaluate-publish sequence still completes or fails as a whole.
    pub async fn record_action_detailed(&self, request: ActionRequest) -> Result<ActionOutcome> {
        let action = validate(request)?;

        let task = tokio::spawn(apply_locked(
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            Arc::clone(&self.locks),
            action,
        ));

        task.await
            .map_err(|e| LedgerError::Internal(format!("ledger task failed: {}", e)))?
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Point-in-time standing; zero for users with no recorded action
    pub async fn get_standing(&self, user_id: &str) -> Result<UserStanding> {
        let user_id = validate_user_id(user_id)?;
        let key = user_id.clone();
        let standing = run_blocking(&self.store, move |store| store.standing(&key)).await?;
        Ok(standing.unwrap_or_else(|| UserStanding::zero(user_id)))
    }

    pub async fn earned_badges(&self, user_id: &str) -> Result<Vec<EarnedBadge>> {
        let user_id = validate_user_id(user_id)?;
        run_blocking(&self.store, move |store| store.earned_badges(&user_id)).await
    }

    /// Catalog in evaluation order
    pub async fn badge_catalog(&self) -> Result<Vec<Badge>> {
        let mut catalog = run_blocking(&self.store, |store| store.badge_catalog()).await?;
        badges::sort_catalog(&mut catalog);
        Ok(catalog)
    }

    /// Top `limit` standings, points descending then user id ascending
    pub async fn leaderboard(&self, limit: usize) -> Result<Vec<UserStanding>> {
        run_blocking(&self.store, move |store| store.top_standings(limit)).await
    }

    /// Re-run badge selection without changing anything.
    ///
    /// Returns the badges the user qualifies for but does not hold. Empty
    /// after any committed action.
    pub async fn pending_awards(&self, user_id: &str) -> Result<Vec<Badge>> {
        let standing = self.get_standing(user_id).await?;
        let catalog = self.badge_catalog().await?;
        let earned: HashSet<String> = self
            .earned_badges(user_id)
            .await?
            .into_iter()
            .map(|e| e.badge_id)
            .collect();
        Ok(badges::select_awards(&standing, &catalog, &earned))
    }

    /// Number of users with a live lock entry
    pub fn active_lock_count(&self) -> usize {
        self.locks.len()
    }
}

async fn apply_locked(
    store: Arc<dyn LedgerStore>,
    bus: Arc<EventBus>,
    locks: Arc<UserLocks>,
    action: LedgerAction,
) -> Result<ActionOutcome> {
    let _guard = locks.acquire(&action.user_id).await;
    let user_id = action.user_id.clone();

    let applied = run_blocking(&store, move |store| {
        store.apply_action(&action, &badges::select_awards)
    })
    .await
    .inspect_err(|e| warn!(%user_id, error = %e, "Ledger action failed, nothing published"))?;

    if applied.replayed {
        debug!(%user_id, "Action id already applied, skipping");
        return Ok(ActionOutcome {
            standing: applied.standing,
            awarded: Vec::new(),
            replayed: true,
        });
    }

    // Still under the user lock: per-user events leave in commit order.
    let mut events = Vec::with_capacity(1 + applied.awarded.len());
    events.push(ChangeEvent::stats(&applied.standing));
    events.extend(applied.awarded.iter().map(|earned| ChangeEvent::BadgeAwarded {
        user_id: earned.user_id.clone(),
        badge_id: earned.badge_id.clone(),
    }));
    bus.publish_all(events);

    if applied.awarded.is_empty() {
        debug!(%user_id, points = applied.standing.points, "Action recorded");
    } else {
        info!(
            %user_id,
            points = applied.standing.points,
            badges = applied.awarded.len(),
            "Action recorded, badges awarded"
        );
    }

    Ok(ActionOutcome {
        standing: applied.standing,
        awarded: applied.awarded,
        replayed: false,
    })
}

fn validate_user_id(user_id: &str) -> Result<String> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(LedgerError::Validation("user_id is required".into()));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(LedgerError::Validation(format!(
            "user_id longer than {} bytes",
            MAX_USER_ID_LEN
        )));
    }
    Ok(user_id.to_string())
}

fn validate(request: ActionRequest) -> Result<LedgerAction> {
    let user_id = validate_user_id(&request.user_id)?;

    let action_id = match request.action_id {
        Some(id) if id.trim().is_empty() => {
            return Err(LedgerError::Validation("action_id must not be blank".into()));
        }
        Some(id) => Some(id.trim().to_string()),
        None => None,
    };

    Ok(LedgerAction {
        user_id,
        points_delta: request.points_delta,
        donation_increment: request.donation_increment,
        action_id,
        at: Utc::now(),
    })
}

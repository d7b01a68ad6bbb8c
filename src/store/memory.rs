//! In-memory ledger store
//!
//! Sharded maps keyed by user id. Holding a user's entry for the whole
//! `apply_action` call makes the increment and the badge inserts atomic for
//! that user without touching anyone else's shard.

use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::{AppliedAction, AwardSelector, LedgerAction, LedgerStore};
use crate::badges::sort_catalog;
use crate::error::StoreError;
use crate::types::{Badge, Donation, DonationStatus, EarnedBadge, UserStanding};

struct UserRecord {
    standing: UserStanding,
    earned: BTreeMap<String, EarnedBadge>,
}

/// Volatile store for dev mode and tests
#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<String, UserRecord>,
    catalog: RwLock<Vec<Badge>>,
    /// Idempotency keys, scoped per user as `(user_id, action_id)`
    applied_actions: DashMap<(String, String), DateTime<Utc>>,
    donations: DashMap<String, Donation>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalog(catalog: Vec<Badge>) -> Self {
        let store = Self::new();
        if let Ok(mut slot) = store.catalog.write() {
            *slot = catalog;
            sort_catalog(&mut slot);
        }
        store
    }
}

fn checked_add(current: u64, delta: u64, what: &str) -> Result<u64, StoreError> {
    current
        .checked_add(delta)
        .ok_or_else(|| StoreError::Overflow(format!("{} overflow: {} + {}", what, current, delta)))
}

impl LedgerStore for MemoryStore {
    fn apply_action(
        &self,
        action: &LedgerAction,
        select_awards: AwardSelector<'_>,
    ) -> Result<AppliedAction, StoreError> {
        let catalog = self.badge_catalog()?;

        // Lock order is always applied_actions, then users.
        let applied_slot = match &action.action_id {
            Some(action_id) => match self
                .applied_actions
                .entry((action.user_id.clone(), action_id.clone()))
            {
                Entry::Occupied(_) => {
                    let standing = self
                        .standing(&action.user_id)?
                        .unwrap_or_else(|| UserStanding::zero(&action.user_id));
                    return Ok(AppliedAction {
                        standing,
                        awarded: Vec::new(),
                        replayed: true,
                    });
                }
                Entry::Vacant(slot) => Some(slot),
            },
            None => None,
        };

        let mut record = self
            .users
            .entry(action.user_id.clone())
            .or_insert_with(|| UserRecord {
                standing: UserStanding::zero(&action.user_id),
                earned: BTreeMap::new(),
            });

        // Compute first so an overflow leaves the record untouched.
        let points = checked_add(record.standing.points, action.points_delta, "points")?;
        let donation_count = checked_add(
            record.standing.donation_count,
            action.donation_increment,
            "donation_count",
        )?;

        record.standing.points = points;
        record.standing.donation_count = donation_count;
        record.standing.updated_at = Some(action.at);
        let standing = record.standing.clone();

        let earned: HashSet<String> = record.earned.keys().cloned().collect();
        let mut awarded = Vec::new();
        for badge in select_awards(&standing, &catalog, &earned) {
            if record.earned.contains_key(&badge.id) {
                debug!(user_id = %action.user_id, badge_id = %badge.id, "Duplicate badge award ignored");
                continue;
            }
            let earned_badge = EarnedBadge {
                user_id: action.user_id.clone(),
                badge_id: badge.id.clone(),
                earned_at: action.at,
            };
            record.earned.insert(badge.id, earned_badge.clone());
            awarded.push(earned_badge);
        }

        if let Some(slot) = applied_slot {
            slot.insert(action.at);
        }

        Ok(AppliedAction {
            standing,
            awarded,
            replayed: false,
        })
    }

    fn standing(&self, user_id: &str) -> Result<Option<UserStanding>, StoreError> {
        Ok(self.users.get(user_id).map(|r| r.standing.clone()))
    }

    fn earned_badges(&self, user_id: &str) -> Result<Vec<EarnedBadge>, StoreError> {
        let Some(record) = self.users.get(user_id) else {
            return Ok(Vec::new());
        };
        let catalog = self.badge_catalog()?;

        // Catalog order first, then anything no longer in the catalog by id.
        let mut earned: Vec<EarnedBadge> = catalog
            .iter()
            .filter_map(|badge| record.earned.get(&badge.id).cloned())
            .collect();
        let known: HashSet<&str> = catalog.iter().map(|b| b.id.as_str()).collect();
        earned.extend(
            record
                .earned
                .values()
                .filter(|e| !known.contains(e.badge_id.as_str()))
                .cloned(),
        );
        Ok(earned)
    }

    fn badge_catalog(&self) -> Result<Vec<Badge>, StoreError> {
        self.catalog
            .read()
            .map(|catalog| catalog.clone())
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn upsert_badges(&self, badges: &[Badge]) -> Result<(), StoreError> {
        let mut catalog = self
            .catalog
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        for badge in badges {
            match catalog.iter_mut().find(|b| b.id == badge.id) {
                Some(existing) => *existing = badge.clone(),
                None => catalog.push(badge.clone()),
            }
        }
        sort_catalog(&mut catalog);
        Ok(())
    }

    fn top_standings(&self, limit: usize) -> Result<Vec<UserStanding>, StoreError> {
        let mut all: Vec<UserStanding> = self.users.iter().map(|r| r.standing.clone()).collect();
        all.sort_by(UserStanding::rank_cmp);
        all.truncate(limit);
        Ok(all)
    }

    fn insert_donation(&self, donation: &Donation) -> Result<(), StoreError> {
        match self.donations.entry(donation.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Unavailable(format!(
                "donation {} already exists",
                donation.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(donation.clone());
                Ok(())
            }
        }
    }

    fn donation(&self, id: &str) -> Result<Option<Donation>, StoreError> {
        Ok(self.donations.get(id).map(|d| d.clone()))
    }

    fn update_donation_status(
        &self,
        id: &str,
        status: DonationStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Donation>, StoreError> {
        Ok(self.donations.get_mut(id).map(|mut donation| {
            donation.status = status;
            donation.updated_at = at;
            donation.clone()
        }))
    }

    fn delete_donation(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.donations.remove(id).is_some())
    }

    fn available_donations(&self) -> Result<Vec<Donation>, StoreError> {
        let mut listings: Vec<Donation> = self
            .donations
            .iter()
            .filter(|d| d.status == DonationStatus::Available)
            .map(|d| d.clone())
            .collect();
        listings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(listings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::badges::{default_catalog, select_awards};

    fn action(user: &str, points: u64) -> LedgerAction {
        LedgerAction {
            user_id: user.to_string(),
            points_delta: points,
            donation_increment: 1,
            action_id: None,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_apply_and_read_back() {
        let store = MemoryStore::with_catalog(default_catalog());
        let applied = store.apply_action(&action("u1", 120), &select_awards).unwrap();

        let ids: Vec<_> = applied.awarded.iter().map(|e| e.badge_id.as_str()).collect();
        assert_eq!(ids, vec!["food-hero", "generous-giver", "community-champion"]);
        assert_eq!(store.earned_badges("u1").unwrap().len(), 3);
        assert_eq!(store.standing("u1").unwrap().unwrap().points, 120);
    }

    #[test]
    fn test_overflow_leaves_standing_untouched() {
        let store = MemoryStore::new();
        store.apply_action(&action("u1", u64::MAX), &select_awards).unwrap();

        let err = store.apply_action(&action("u1", 1), &select_awards).unwrap_err();
        assert!(matches!(err, StoreError::Overflow(_)));

        let standing = store.standing("u1").unwrap().unwrap();
        assert_eq!(standing.points, u64::MAX);
        assert_eq!(standing.donation_count, 1);
    }

    #[test]
    fn test_replayed_action_id() {
        let store = MemoryStore::new();
        let mut keyed = action("u2", 10);
        keyed.action_id = Some("a-1".into());

        assert!(!store.apply_action(&keyed, &select_awards).unwrap().replayed);
        assert!(store.apply_action(&keyed, &select_awards).unwrap().replayed);
        assert_eq!(store.standing("u2").unwrap().unwrap().points, 10);
    }

    #[test]
    fn test_action_id_is_scoped_per_user() {
        let store = MemoryStore::new();
        let mut first = action("u3", 10);
        first.action_id = Some("grant-1".into());
        let mut second = action("u4", 50);
        second.action_id = Some("grant-1".into());

        store.apply_action(&first, &select_awards).unwrap();
        let applied = store.apply_action(&second, &select_awards).unwrap();

        assert!(!applied.replayed);
        assert_eq!(applied.standing.points, 50);
    }

    #[test]
    fn test_upsert_badges_replaces_by_id() {
        let store = MemoryStore::with_catalog(default_catalog());
        let mut hero = default_catalog().remove(0);
        hero.points_required = 5;
        store.upsert_badges(&[hero]).unwrap();

        let catalog = store.badge_catalog().unwrap();
        assert_eq!(catalog.len(), 4);
        assert_eq!(catalog[0].points_required, 5);
    }
}

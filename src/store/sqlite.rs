//! SQLite-backed ledger store

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};

use super::{schema, AppliedAction, AwardSelector, LedgerAction, LedgerStore};
use crate::error::StoreError;
use crate::types::{Badge, Donation, DonationStatus, EarnedBadge, UserStanding};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type PooledConn = PooledConnection<SqliteConnectionManager>;

/// Connections kept open against the ledger file
const POOL_SIZE: u32 = 8;

const CONNECTION_PRAGMAS: &str = "PRAGMA busy_timeout=5000; PRAGMA synchronous=NORMAL;";

/// Durable ledger store.
///
/// Every write runs in an `IMMEDIATE` transaction so the standing increment,
/// the badge inserts and the idempotency record commit or roll back together.
/// The file is in WAL mode and each call checks out its own pooled
/// connection, so reads see the last commit instead of queueing behind a
/// writer.
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    /// Open or create `ledger.db` inside `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("ledger.db");
        info!(path = %db_path.display(), "Opening ledger database");

        // journal_mode is persistent; set it once before the pool fans out.
        let bootstrap = Connection::open(&db_path)?;
        bootstrap.execute_batch("PRAGMA journal_mode=WAL;")?;
        bootstrap.execute_batch(CONNECTION_PRAGMAS)?;
        schema::init_schema(&bootstrap)?;
        drop(bootstrap);

        let manager = SqliteConnectionManager::file(&db_path)
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(POOL_SIZE)
            .connection_timeout(Duration::from_secs(10))
            .build(manager)?;

        Ok(Self { pool })
    }

    /// Open an in-memory database (for testing)
    ///
    /// A private in-memory database lives and dies with its connection, so
    /// the pool holds exactly one and never recycles it.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("Opening in-memory ledger database");
        let manager = SqliteConnectionManager::memory().with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;

        let store = Self { pool };
        store.with_conn(schema::init_schema)?;
        Ok(store)
    }

    /// Get a connection from the pool
    fn conn(&self) -> Result<PooledConn, StoreError> {
        Ok(self.pool.get()?)
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn()?;
        f(&conn)
    }

    fn with_conn_mut<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError>,
    {
        let mut conn = self.conn()?;
        f(&mut conn)
    }
}

fn to_sql_int(value: u64, what: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Overflow(format!("{} {} exceeds i64", what, value)))
}

fn checked_add(current: u64, delta: u64, what: &str) -> Result<u64, StoreError> {
    current
        .checked_add(delta)
        .ok_or_else(|| StoreError::Overflow(format!("{} overflow: {} + {}", what, current, delta)))
}

fn from_sql_int(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Integer, Box::new(e)))
}

fn standing_from_row(row: &Row<'_>) -> rusqlite::Result<UserStanding> {
    Ok(UserStanding {
        user_id: row.get(0)?,
        points: from_sql_int(row, 1)?,
        donation_count: from_sql_int(row, 2)?,
        updated_at: row.get(3)?,
    })
}

fn badge_from_row(row: &Row<'_>) -> rusqlite::Result<Badge> {
    Ok(Badge {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        icon: row.get(3)?,
        points_required: from_sql_int(row, 4)?,
    })
}

fn earned_from_row(row: &Row<'_>) -> rusqlite::Result<EarnedBadge> {
    Ok(EarnedBadge {
        user_id: row.get(0)?,
        badge_id: row.get(1)?,
        earned_at: row.get(2)?,
    })
}

fn donation_from_row(row: &Row<'_>) -> rusqlite::Result<Donation> {
    let status: String = row.get(7)?;
    let status = status.parse::<DonationStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(Donation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        food_type: row.get(3)?,
        quantity: row.get(4)?,
        latitude: row.get(5)?,
        longitude: row.get(6)?,
        status,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

const STANDING_COLUMNS: &str = "user_id, points, donation_count, updated_at";
const BADGE_COLUMNS: &str = "id, name, description, icon, points_required";
const DONATION_COLUMNS: &str =
    "id, user_id, title, food_type, quantity, latitude, longitude, status, created_at, updated_at";

fn read_standing(conn: &Connection, user_id: &str) -> Result<Option<UserStanding>, StoreError> {
    let sql = format!("SELECT {} FROM user_stats WHERE user_id = ?1", STANDING_COLUMNS);
    let standing = conn
        .prepare_cached(&sql)?
        .query_row([user_id], standing_from_row)
        .optional()?;
    Ok(standing)
}

fn read_catalog(conn: &Connection) -> Result<Vec<Badge>, StoreError> {
    let sql = format!(
        "SELECT {} FROM badges ORDER BY points_required ASC, id ASC",
        BADGE_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let badges = stmt
        .query_map([], badge_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(badges)
}

fn read_earned(conn: &Connection, user_id: &str) -> Result<Vec<EarnedBadge>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT ub.user_id, ub.badge_id, ub.earned_at
         FROM user_badges ub
         LEFT JOIN badges b ON b.id = ub.badge_id
         WHERE ub.user_id = ?1
         ORDER BY b.points_required ASC, ub.badge_id ASC",
    )?;
    let earned = stmt
        .query_map([user_id], earned_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(earned)
}

fn read_donation(conn: &Connection, id: &str) -> Result<Option<Donation>, StoreError> {
    let sql = format!("SELECT {} FROM donations WHERE id = ?1", DONATION_COLUMNS);
    let donation = conn
        .prepare_cached(&sql)?
        .query_row([id], donation_from_row)
        .optional()?;
    Ok(donation)
}

impl LedgerStore for SqliteStore {
    fn apply_action(
        &self,
        action: &LedgerAction,
        select_awards: AwardSelector<'_>,
    ) -> Result<AppliedAction, StoreError> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(action_id) = &action.action_id {
                let seen = tx
                    .query_row(
                        "SELECT 1 FROM applied_actions WHERE user_id = ?1 AND action_id = ?2",
                        params![action.user_id, action_id],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();

                if seen {
                    let standing = read_standing(&tx, &action.user_id)?
                        .unwrap_or_else(|| UserStanding::zero(&action.user_id));
                    tx.commit()?;
                    return Ok(AppliedAction {
                        standing,
                        awarded: Vec::new(),
                        replayed: true,
                    });
                }
            }

            // The write lock is held from here on, so read-then-write is atomic.
            let current = read_standing(&tx, &action.user_id)?
                .unwrap_or_else(|| UserStanding::zero(&action.user_id));
            let standing = UserStanding {
                user_id: action.user_id.clone(),
                points: checked_add(current.points, action.points_delta, "points")?,
                donation_count: checked_add(current.donation_count, action.donation_increment, "donation_count")?,
                updated_at: Some(action.at),
            };

            tx.execute(
                "INSERT INTO user_stats (user_id, points, donation_count, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                    points = excluded.points,
                    donation_count = excluded.donation_count,
                    updated_at = excluded.updated_at",
                params![
                    action.user_id,
                    to_sql_int(standing.points, "points")?,
                    to_sql_int(standing.donation_count, "donation_count")?,
                    action.at
                ],
            )?;

            let catalog = read_catalog(&tx)?;
            let earned: HashSet<String> = read_earned(&tx, &action.user_id)?
                .into_iter()
                .map(|e| e.badge_id)
                .collect();

            let mut awarded = Vec::new();
            for badge in select_awards(&standing, &catalog, &earned) {
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO user_badges (user_id, badge_id, earned_at) VALUES (?1, ?2, ?3)",
                    params![action.user_id, badge.id, action.at],
                )?;
                if inserted == 0 {
                    debug!(user_id = %action.user_id, badge_id = %badge.id, "Duplicate badge award ignored");
                    continue;
                }
                awarded.push(EarnedBadge {
                    user_id: action.user_id.clone(),
                    badge_id: badge.id,
                    earned_at: action.at,
                });
            }

            if let Some(action_id) = &action.action_id {
                tx.execute(
                    "INSERT INTO applied_actions (user_id, action_id, applied_at) VALUES (?1, ?2, ?3)",
                    params![action.user_id, action_id, action.at],
                )?;
            }

            tx.commit()?;

            Ok(AppliedAction {
                standing,
                awarded,
                replayed: false,
            })
        })
    }

    fn standing(&self, user_id: &str) -> Result<Option<UserStanding>, StoreError> {
        self.with_conn(|conn| read_standing(conn, user_id))
    }

    fn earned_badges(&self, user_id: &str) -> Result<Vec<EarnedBadge>, StoreError> {
        self.with_conn(|conn| read_earned(conn, user_id))
    }

    fn badge_catalog(&self) -> Result<Vec<Badge>, StoreError> {
        self.with_conn(read_catalog)
    }

    fn upsert_badges(&self, badges: &[Badge]) -> Result<(), StoreError> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            for badge in badges {
                tx.execute(
                    "INSERT INTO badges (id, name, description, icon, points_required)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        description = excluded.description,
                        icon = excluded.icon,
                        points_required = excluded.points_required",
                    params![
                        badge.id,
                        badge.name,
                        badge.description,
                        badge.icon,
                        to_sql_int(badge.points_required, "points_required")?,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn top_standings(&self, limit: usize) -> Result<Vec<UserStanding>, StoreError> {
        let limit = to_sql_int(limit as u64, "limit")?;
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM user_stats ORDER BY points DESC, user_id ASC LIMIT ?1",
                STANDING_COLUMNS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map([limit], standing_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn insert_donation(&self, donation: &Donation) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO donations (id, user_id, title, food_type, quantity, latitude, longitude, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    donation.id,
                    donation.user_id,
                    donation.title,
                    donation.food_type,
                    donation.quantity,
                    donation.latitude,
                    donation.longitude,
                    donation.status.as_str(),
                    donation.created_at,
                    donation.updated_at,
                ],
            )?;
            Ok(())
        })
    }

    fn donation(&self, id: &str) -> Result<Option<Donation>, StoreError> {
        self.with_conn(|conn| read_donation(conn, id))
    }

    fn update_donation_status(
        &self,
        id: &str,
        status: DonationStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Donation>, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE donations SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), at],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            read_donation(conn, id)
        })
    }

    fn delete_donation(&self, id: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM donations WHERE id = ?1", [id])?;
            Ok(deleted > 0)
        })
    }

    fn available_donations(&self) -> Result<Vec<Donation>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM donations WHERE status = 'available' ORDER BY created_at DESC, id ASC",
                DONATION_COLUMNS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map([], donation_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::badges::{default_catalog, select_awards};

    fn action(user: &str, points: u64, donations: u64) -> LedgerAction {
        LedgerAction {
            user_id: user.to_string(),
            points_delta: points,
            donation_increment: donations,
            action_id: None,
            at: Utc::now(),
        }
    }

    fn seeded() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_badges(&default_catalog()).unwrap();
        store
    }

    #[test]
    fn test_first_action_creates_standing() {
        let store = seeded();
        assert!(store.standing("alice").unwrap().is_none());

        let applied = store.apply_action(&action("alice", 10, 1), &select_awards).unwrap();
        assert_eq!(applied.standing.points, 10);
        assert_eq!(applied.standing.donation_count, 1);
        assert_eq!(applied.awarded.len(), 1);
        assert_eq!(applied.awarded[0].badge_id, "food-hero");

        let stored = store.standing("alice").unwrap().unwrap();
        assert_eq!(stored.points, 10);
    }

    #[test]
    fn test_increments_accumulate() {
        let store = seeded();
        store.apply_action(&action("bob", 10, 1), &select_awards).unwrap();
        let applied = store.apply_action(&action("bob", 45, 0), &select_awards).unwrap();

        assert_eq!(applied.standing.points, 55);
        assert_eq!(applied.standing.donation_count, 1);
        assert_eq!(applied.awarded.len(), 1);
        assert_eq!(applied.awarded[0].badge_id, "generous-giver");
        assert_eq!(store.earned_badges("bob").unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_selection_is_ignored() {
        let store = seeded();
        store.apply_action(&action("carol", 10, 1), &select_awards).unwrap();

        // A selector that ignores the earned set still cannot double-award.
        let greedy = |standing: &UserStanding, catalog: &[Badge], _: &HashSet<String>| {
            select_awards(standing, catalog, &HashSet::new())
        };
        let applied = store.apply_action(&action("carol", 0, 0), &greedy).unwrap();

        assert!(applied.awarded.is_empty());
        assert_eq!(store.earned_badges("carol").unwrap().len(), 1);
    }

    #[test]
    fn test_action_id_applies_once() {
        let store = seeded();
        let mut keyed = action("dave", 10, 1);
        keyed.action_id = Some("donation:1".into());

        let first = store.apply_action(&keyed, &select_awards).unwrap();
        let second = store.apply_action(&keyed, &select_awards).unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert!(second.awarded.is_empty());
        assert_eq!(second.standing.points, 10);
        assert_eq!(store.standing("dave").unwrap().unwrap().donation_count, 1);
    }

    #[test]
    fn test_action_id_is_scoped_per_user() {
        let store = seeded();
        let mut ada = action("ada", 10, 0);
        ada.action_id = Some("grant-1".into());
        let mut bob = action("bob", 50, 0);
        bob.action_id = Some("grant-1".into());

        store.apply_action(&ada, &select_awards).unwrap();
        let applied = store.apply_action(&bob, &select_awards).unwrap();

        assert!(!applied.replayed);
        assert_eq!(applied.standing.points, 50);
        assert!(store.apply_action(&bob, &select_awards).unwrap().replayed);
    }

    #[test]
    fn test_reads_do_not_wait_for_another_users_write() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = std::sync::Arc::new(SqliteStore::open(dir.path()).unwrap());
        store.upsert_badges(&default_catalog()).unwrap();
        store.apply_action(&action("bob", 15, 1), &select_awards).unwrap();

        let writer = {
            let store = std::sync::Arc::clone(&store);
            std::thread::spawn(move || {
                let slow = |standing: &UserStanding, catalog: &[Badge], earned: &HashSet<String>| {
                    std::thread::sleep(Duration::from_millis(300));
                    select_awards(standing, catalog, earned)
                };
                store.apply_action(&action("ada", 10, 1), &slow).unwrap();
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        let started = std::time::Instant::now();
        let bob = store.standing("bob").unwrap().unwrap();
        let waited = started.elapsed();

        assert_eq!(bob.points, 15);
        assert!(waited < Duration::from_millis(200), "read waited {:?}", waited);
        writer.join().unwrap();
        assert_eq!(store.standing("ada").unwrap().unwrap().points, 10);
    }

    #[test]
    fn test_top_standings_order() {
        let store = seeded();
        store.apply_action(&action("zoe", 30, 0), &select_awards).unwrap();
        store.apply_action(&action("amy", 30, 0), &select_awards).unwrap();
        store.apply_action(&action("max", 50, 0), &select_awards).unwrap();

        let ids: Vec<_> = store
            .top_standings(2)
            .unwrap()
            .into_iter()
            .map(|s| s.user_id)
            .collect();
        assert_eq!(ids, vec!["max", "amy"]);
    }

    #[test]
    fn test_donation_lifecycle() {
        let store = seeded();
        let now = Utc::now();
        let donation = Donation {
            id: "d1".into(),
            user_id: "erin".into(),
            title: "Garden tomatoes".into(),
            food_type: "Vegetables".into(),
            quantity: "2 kg".into(),
            latitude: 51.5,
            longitude: -0.12,
            status: DonationStatus::Available,
            created_at: now,
            updated_at: now,
        };

        store.insert_donation(&donation).unwrap();
        assert_eq!(store.available_donations().unwrap().len(), 1);

        let claimed = store
            .update_donation_status("d1", DonationStatus::Claimed, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, DonationStatus::Claimed);
        assert!(store.available_donations().unwrap().is_empty());

        assert!(store.delete_donation("d1").unwrap());
        assert!(!store.delete_donation("d1").unwrap());
        assert!(store.donation("d1").unwrap().is_none());
    }

    #[test]
    fn test_reopen_keeps_standings() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let store = SqliteStore::open(dir.path()).unwrap();
            store.upsert_badges(&default_catalog()).unwrap();
            store.apply_action(&action("fay", 20, 2), &select_awards).unwrap();
        }

        let store = SqliteStore::open(dir.path()).unwrap();
        let standing = store.standing("fay").unwrap().unwrap();
        assert_eq!(standing.points, 20);
        assert_eq!(standing.donation_count, 2);
        assert_eq!(store.earned_badges("fay").unwrap().len(), 1);
    }
}

//! SQLite schema for the ledger store

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::StoreError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating ledger schema v{}", SCHEMA_VERSION);
        conn.execute_batch(LEDGER_SCHEMA)?;
        conn.execute_batch(DONATIONS_SCHEMA)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version == 1 {
        info!("Migrating ledger schema v1 -> v{}", SCHEMA_VERSION);
        conn.execute_batch(MIGRATE_V1_TO_V2)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version > SCHEMA_VERSION {
        return Err(StoreError::Unavailable(format!(
            "database schema v{} is newer than this build (v{})",
            current_version, SCHEMA_VERSION
        )));
    } else {
        info!("Ledger schema is up to date (v{})", current_version);
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32, StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StoreError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS user_stats (
    user_id TEXT PRIMARY KEY,
    points INTEGER NOT NULL DEFAULT 0 CHECK (points >= 0),
    donation_count INTEGER NOT NULL DEFAULT 0 CHECK (donation_count >= 0),
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_user_stats_rank ON user_stats (points DESC, user_id ASC);

CREATE TABLE IF NOT EXISTS badges (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    icon TEXT NOT NULL DEFAULT '',
    points_required INTEGER NOT NULL CHECK (points_required >= 0)
);

CREATE TABLE IF NOT EXISTS user_badges (
    user_id TEXT NOT NULL,
    badge_id TEXT NOT NULL,
    earned_at TEXT NOT NULL,
    PRIMARY KEY (user_id, badge_id)
);

CREATE TABLE IF NOT EXISTS applied_actions (
    user_id TEXT NOT NULL,
    action_id TEXT NOT NULL,
    applied_at TEXT NOT NULL,
    PRIMARY KEY (user_id, action_id)
);
"#;

// v1 keyed idempotency records by action_id alone.
const MIGRATE_V1_TO_V2: &str = r#"
BEGIN;
CREATE TABLE applied_actions_v2 (
    user_id TEXT NOT NULL,
    action_id TEXT NOT NULL,
    applied_at TEXT NOT NULL,
    PRIMARY KEY (user_id, action_id)
);
INSERT INTO applied_actions_v2 (user_id, action_id, applied_at)
    SELECT user_id, action_id, applied_at FROM applied_actions;
DROP TABLE applied_actions;
ALTER TABLE applied_actions_v2 RENAME TO applied_actions;
COMMIT;
"#;

const DONATIONS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS donations (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    food_type TEXT NOT NULL DEFAULT '',
    quantity TEXT NOT NULL DEFAULT '',
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    status TEXT NOT NULL DEFAULT 'available',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_donations_status ON donations (status);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_repeatable() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_migrates_v1_action_keys() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_version (version INTEGER NOT NULL);
             INSERT INTO schema_version (version) VALUES (1);
             CREATE TABLE applied_actions (
                 action_id TEXT PRIMARY KEY,
                 user_id TEXT NOT NULL,
                 applied_at TEXT NOT NULL
             );
             INSERT INTO applied_actions VALUES ('grant-1', 'ada', 'now');",
        )
        .unwrap();

        init_schema(&conn).unwrap();

        let insert = "INSERT INTO applied_actions (user_id, action_id, applied_at) VALUES ('bob', 'grant-1', 'now')";
        assert_eq!(conn.execute(insert, []).unwrap(), 1);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM applied_actions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_user_badges_pair_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let insert = "INSERT OR IGNORE INTO user_badges (user_id, badge_id, earned_at) VALUES ('u', 'b', 'now')";
        assert_eq!(conn.execute(insert, []).unwrap(), 1);
        assert_eq!(conn.execute(insert, []).unwrap(), 0);
    }
}

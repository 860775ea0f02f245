//! Versioned schema for contacts and call history
//!
//! Each migration runs in its own transaction and records its version in
//! `schema_version`; only versions above the recorded one are applied.

use crate::error::StoreResult;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tracing::info;

/// Current durable schema version
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Migration descriptor
pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub up_sql: &'static str,
}

/// All available migrations in order
pub fn get_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Contacts schema",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS schema_version (
                    version INTEGER PRIMARY KEY,
                    applied_at INTEGER NOT NULL
                );

                -- One row per direction of a mutual contact
                CREATE TABLE IF NOT EXISTS contacts (
                    user_id TEXT NOT NULL,
                    contact_id TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    PRIMARY KEY (user_id, contact_id),
                    CHECK (user_id <> contact_id)
                );

                CREATE INDEX IF NOT EXISTS idx_contacts_contact ON contacts(contact_id);
            "#,
        },
        Migration {
            version: 2,
            description: "Call history schema",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS calls (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    start_time INTEGER NOT NULL,            -- epoch millis
                    end_time INTEGER NOT NULL,              -- epoch millis
                    duration INTEGER NOT NULL               -- seconds
                );

                CREATE INDEX IF NOT EXISTS idx_calls_start ON calls(start_time);

                CREATE TABLE IF NOT EXISTS call_participants (
                    call_id INTEGER NOT NULL,
                    user_id TEXT NOT NULL,
                    PRIMARY KEY (call_id, user_id),
                    FOREIGN KEY (call_id) REFERENCES calls(id) ON DELETE CASCADE
                );

                CREATE INDEX IF NOT EXISTS idx_call_participants_user ON call_participants(user_id);
            "#,
        },
    ]
}

/// Get current schema version from database
fn get_current_version(pool: &Pool<SqliteConnectionManager>) -> StoreResult<i32> {
    let conn = pool.get()?;

    // Ensure schema_version table exists
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Result<i32, _> = conn.query_row(
        "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
        [],
        |row| row.get(0),
    );

    Ok(version.unwrap_or(0))
}

/// Run all pending migrations
pub fn migrate(pool: &Pool<SqliteConnectionManager>) -> StoreResult<()> {
    let current_version = get_current_version(pool)?;
    let migrations = get_migrations();

    let pending_migrations: Vec<_> =
        migrations.into_iter().filter(|m| m.version > current_version).collect();

    if pending_migrations.is_empty() {
        return Ok(());
    }

    let conn = pool.get()?;

    for migration in pending_migrations {
        let tx = conn.unchecked_transaction()?;

        tx.execute_batch(migration.up_sql)?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
            params![migration.version, Utc::now().timestamp_millis()],
        )?;

        tx.commit()?;

        info!(
            version = migration.version,
            description = migration.description,
            "Applied migration"
        );
    }

    Ok(())
}

/// Get the latest migration version available
pub fn get_latest_version() -> i32 {
    get_migrations().iter().map(|m| m.version).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_test_pool() -> Pool<SqliteConnectionManager> {
        let manager = SqliteConnectionManager::memory();
        Pool::builder().max_size(1).build(manager).expect("Failed to create pool")
    }

    #[test]
    fn test_initial_migration() {
        let pool = setup_test_pool();
        migrate(&pool).expect("Migration failed");

        let conn = pool.get().unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert!(tables.contains(&"contacts".to_string()));
        assert!(tables.contains(&"calls".to_string()));
        assert!(tables.contains(&"call_participants".to_string()));
    }

    #[test]
    fn test_migration_version_tracking() {
        let pool = setup_test_pool();
        migrate(&pool).expect("Migration failed");

        let version = get_current_version(&pool).expect("Failed to get version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
        assert_eq!(get_latest_version(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_idempotent_migrations() {
        let pool = setup_test_pool();

        migrate(&pool).expect("First migration failed");
        migrate(&pool).expect("Second migration failed");

        let version = get_current_version(&pool).expect("Failed to get version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_participants_cascade_with_call() {
        let pool = setup_test_pool();
        migrate(&pool).expect("Migration failed");

        let conn = pool.get().unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();

        conn.execute(
            "INSERT INTO calls (id, start_time, end_time, duration) VALUES (1, 0, 5000, 5)",
            [],
        )
        .unwrap();
        conn.execute("INSERT INTO call_participants (call_id, user_id) VALUES (1, 'alice')", [])
            .unwrap();

        conn.execute("DELETE FROM calls WHERE id = 1", []).unwrap();

        let count: i32 = conn
            .query_row("SELECT COUNT(*) FROM call_participants", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_self_contact_is_rejected() {
        let pool = setup_test_pool();
        migrate(&pool).expect("Migration failed");

        let conn = pool.get().unwrap();
        let result = conn.execute(
            "INSERT INTO contacts (user_id, contact_id, created_at) VALUES ('a', 'a', 0)",
            [],
        );
        assert!(result.is_err());
    }
}

//! Test database helpers.
//!
//! Each call returns a new, independent in-memory SQLite database so tests
//! never share state or touch the filesystem.

use diesel::connection::SimpleConnection;
use diesel::sqlite::SqliteConnection;
use diesel_migrations::MigrationHarness;

use super::db::MIGRATIONS;

/// Creates a synchronous in-memory SQLite database connection for unit
/// tests, with foreign keys enabled and all embedded migrations applied.
pub fn setup_test_db() -> SqliteConnection {
    use diesel::Connection;

    let mut conn = SqliteConnection::establish(":memory:")
        .expect("Failed to create in-memory SQLite database");
    conn.batch_execute("PRAGMA foreign_keys = ON")
        .expect("Failed to enable foreign keys");
    conn.run_pending_migrations(MIGRATIONS)
        .expect("Failed to run pending migrations");
    conn
}

/// Like [`setup_test_db`], but with the default resource bundles already
/// seeded, matching the state of a fresh production install.
pub fn setup_seeded_db() -> SqliteConnection {
    let mut conn = setup_test_db();
    super::defaults::insert_default_resources(&mut conn)
        .expect("Failed to seed default resources");
    conn
}

use std::path::Path;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};

use crate::error::IntegrityError;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(QueryableByName)]
struct LastInsertRowId {
    #[diesel(sql_type = BigInt)]
    last_insert_rowid: i64,
}

#[derive(QueryableByName)]
struct UserVersionRow {
    #[diesel(sql_type = Integer)]
    user_version: i32,
}

/// Opens the SQLite database at `path`, creating the file if it does not
/// exist, and enables foreign key support.
///
/// Foreign keys are disabled by default in SQLite for backwards
/// compatibility; all relationship cascades here rely on them.
pub fn connect(path: &Path) -> Result<SqliteConnection, IntegrityError> {
    let mut conn = SqliteConnection::establish(&path.to_string_lossy())?;
    conn.batch_execute("PRAGMA foreign_keys = ON")?;
    Ok(conn)
}

/// Applies all pending embedded migrations, creating the full schema on a
/// fresh database.
pub fn create_schema(conn: &mut SqliteConnection) -> Result<(), IntegrityError> {
    conn.run_pending_migrations(MIGRATIONS)
        .map(|_| ())
        .map_err(|e| IntegrityError::Schema(e.to_string()))
}

/// Reads the schema version stored in the `user_version` pragma.
pub fn database_version(conn: &mut SqliteConnection) -> QueryResult<i32> {
    diesel::sql_query("PRAGMA user_version")
        .get_result::<UserVersionRow>(conn)
        .map(|row| row.user_version)
}

/// Stores `version` in the `user_version` pragma.
pub fn set_database_version(conn: &mut SqliteConnection, version: i32) -> QueryResult<()> {
    // PRAGMA does not support bound parameters
    diesel::sql_query(format!("PRAGMA user_version = {version}")).execute(conn)?;
    Ok(())
}

/// Returns the rowid of the most recent insert on this connection.
pub(crate) fn last_insert_rowid(conn: &mut SqliteConnection) -> QueryResult<i32> {
    diesel::sql_query("SELECT last_insert_rowid() as last_insert_rowid")
        .get_result::<LastInsertRowId>(conn)
        .map(|row| row.last_insert_rowid as i32)
}

/// Deletes relationship rows whose endpoints no longer resolve.
///
/// The schema already cascades deletes through foreign keys; this sweep
/// runs inside every entity-delete transaction as a backstop and returns
/// the number of rows it removed.
pub fn sweep_orphan_links(conn: &mut SqliteConnection) -> QueryResult<usize> {
    let mut removed = 0;
    removed += diesel::sql_query(
        "DELETE FROM user_roles WHERE user_id NOT IN (SELECT id FROM users) \
         OR role_id NOT IN (SELECT id FROM roles)",
    )
    .execute(conn)?;
    removed += diesel::sql_query(
        "DELETE FROM roles_policies WHERE role_id NOT IN (SELECT id FROM roles) \
         OR policy_id NOT IN (SELECT id FROM policies)",
    )
    .execute(conn)?;
    removed += diesel::sql_query(
        "DELETE FROM roles_rules WHERE role_id NOT IN (SELECT id FROM roles) \
         OR rule_id NOT IN (SELECT id FROM rules)",
    )
    .execute(conn)?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orm::testing::setup_test_db;

    #[test]
    fn test_database_version_round_trip() {
        let mut conn = setup_test_db();

        assert_eq!(database_version(&mut conn).unwrap(), 0);
        set_database_version(&mut conn, 40817).unwrap();
        assert_eq!(database_version(&mut conn).unwrap(), 40817);
    }

    #[test]
    fn test_sweep_on_clean_database() {
        let mut conn = setup_test_db();
        assert_eq!(sweep_orphan_links(&mut conn).unwrap(), 0);
    }
}

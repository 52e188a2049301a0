//! Schema definitions and migration runner for SurrealDB.
//!
//! All table definitions use SCHEMAFULL mode. Record ids carry the
//! natural key of each row, so upserts address rows directly. Enums are
//! stored as strings with ASSERT constraints.

use surrealdb::{Connection, Surreal};
use surrealdb_types::SurrealValue;
use tracing::info;

use crate::error::DbError;

// -----------------------------------------------------------------------
// Migration tracking
// -----------------------------------------------------------------------

const MIGRATION_TABLE_DDL: &str = "\
DEFINE TABLE IF NOT EXISTS _migration SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS version ON TABLE _migration TYPE int;
DEFINE FIELD IF NOT EXISTS name ON TABLE _migration TYPE string;
DEFINE FIELD IF NOT EXISTS applied_at ON TABLE _migration TYPE datetime \
    DEFAULT time::now();
DEFINE INDEX IF NOT EXISTS idx_migration_version ON TABLE _migration \
    COLUMNS version UNIQUE;
";

#[derive(Debug, SurrealValue)]
struct MigrationRecord {
    version: u32,
    #[allow(dead_code)]
    name: String,
}

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: SCHEMA_V1,
}];

// -----------------------------------------------------------------------
// Schema v1: synchronized forest, permissions and users
// -----------------------------------------------------------------------

const SCHEMA_V1: &str = "\
-- =======================================================================
-- Tracked links (record id = link)
-- =======================================================================
DEFINE TABLE tracked_link SCHEMAFULL;
DEFINE FIELD link ON TABLE tracked_link TYPE string;
DEFINE FIELD created_at ON TABLE tracked_link TYPE datetime \
    DEFAULT time::now();
DEFINE INDEX idx_tracked_link_link ON TABLE tracked_link \
    COLUMNS link UNIQUE;

-- =======================================================================
-- Resources (record id = upstream id)
-- =======================================================================
DEFINE TABLE resource SCHEMAFULL;
DEFINE FIELD rid ON TABLE resource TYPE int;
DEFINE FIELD path ON TABLE resource TYPE string;
DEFINE FIELD link ON TABLE resource TYPE string;
DEFINE FIELD kind ON TABLE resource TYPE string \
    ASSERT $value IN ['organization', 'repository'];
DEFINE FIELD parent_id ON TABLE resource TYPE option<int>;
DEFINE FIELD lpath ON TABLE resource TYPE option<string>;
DEFINE INDEX idx_resource_link ON TABLE resource COLUMNS link UNIQUE;
DEFINE INDEX idx_resource_parent ON TABLE resource COLUMNS parent_id;

-- =======================================================================
-- Permissions (record id = principal_id|resource_link)
-- =======================================================================
DEFINE TABLE permission SCHEMAFULL;
DEFINE FIELD principal_id ON TABLE permission TYPE int;
DEFINE FIELD user_id ON TABLE permission TYPE option<int>;
DEFINE FIELD username ON TABLE permission TYPE string;
DEFINE FIELD resource_link ON TABLE permission TYPE string;
DEFINE FIELD resource_kind ON TABLE permission TYPE string \
    ASSERT $value IN ['organization', 'repository'];
DEFINE FIELD access_level ON TABLE permission TYPE string;
DEFINE FIELD parent_link ON TABLE permission TYPE option<string>;
DEFINE FIELD has_parent ON TABLE permission TYPE bool DEFAULT false;
DEFINE FIELD has_child ON TABLE permission TYPE bool DEFAULT false;
DEFINE FIELD avatar_url ON TABLE permission TYPE string DEFAULT '';
DEFINE FIELD created_at ON TABLE permission TYPE datetime \
    DEFAULT time::now();
DEFINE FIELD updated_at ON TABLE permission TYPE datetime \
    DEFAULT time::now();
DEFINE FIELD expires_at ON TABLE permission TYPE option<datetime>;
DEFINE FIELD version ON TABLE permission TYPE int DEFAULT 0;
DEFINE INDEX idx_permission_identity ON TABLE permission \
    COLUMNS principal_id, resource_link, resource_kind UNIQUE;
DEFINE INDEX idx_permission_link ON TABLE permission \
    COLUMNS resource_link;
DEFINE INDEX idx_permission_parent ON TABLE permission \
    COLUMNS principal_id, parent_link;

-- =======================================================================
-- Users (record id = principal_id)
-- =======================================================================
DEFINE TABLE user SCHEMAFULL;
DEFINE FIELD principal_id ON TABLE user TYPE int;
DEFINE FIELD user_id ON TABLE user TYPE option<int>;
DEFINE FIELD username ON TABLE user TYPE string;
DEFINE FIELD avatar_url ON TABLE user TYPE string DEFAULT '';
DEFINE FIELD created_at ON TABLE user TYPE datetime \
    DEFAULT time::now();
DEFINE FIELD updated_at ON TABLE user TYPE datetime \
    DEFAULT time::now();
DEFINE FIELD version ON TABLE user TYPE int DEFAULT 0;
DEFINE INDEX idx_user_username ON TABLE user COLUMNS username;
DEFINE INDEX idx_user_user_id ON TABLE user COLUMNS user_id;
";

// -----------------------------------------------------------------------
// Public API
// -----------------------------------------------------------------------

/// Run all pending migrations against the given SurrealDB client.
///
/// Creates a `_migration` tracking table on first run, then applies
/// each migration whose version exceeds the current maximum.
/// All DEFINE statements are idempotent so re-running is safe.
pub async fn run_migrations<C: Connection>(db: &Surreal<C>) -> Result<(), DbError> {
    // Ensure migration tracking table exists (idempotent).
    db.query(MIGRATION_TABLE_DDL)
        .await?
        .check()
        .map_err(|e| DbError::Migration(e.to_string()))?;

    // Determine current schema version.
    let mut result = db
        .query("SELECT * FROM _migration ORDER BY version DESC LIMIT 1")
        .await?;
    let records: Vec<MigrationRecord> = result.take(0)?;
    let current_version = records.first().map(|m| m.version).unwrap_or(0);

    for migration in MIGRATIONS {
        if migration.version > current_version {
            info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            db.query(migration.sql).await?.check().map_err(|e| {
                DbError::Migration(format!(
                    "Migration v{} '{}' failed: {}",
                    migration.version, migration.name, e,
                ))
            })?;

            // Record the applied migration.
            db.query(
                "CREATE _migration SET version = $version, \
                 name = $name",
            )
            .bind(("version", migration.version))
            .bind(("name", migration.name))
            .await?
            .check()
            .map_err(|e| {
                DbError::Migration(format!(
                    "Failed to record migration v{}: {}",
                    migration.version, e,
                ))
            })?;

            info!(
                version = migration.version,
                "Migration applied successfully"
            );
        }
    }

    Ok(())
}

/// Returns the raw schema DDL for version 1.
///
/// Exposed for testing with in-memory SurrealDB instances that
/// bypass the migration runner.
pub fn schema_v1() -> &'static str {
    SCHEMA_V1
}

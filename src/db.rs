//! Local SQLite document store for Shopkeeper.
//!
//! Uses rusqlite with WAL mode. Plays the role the hosted document database
//! played for the web frontend: shop profiles, staff records, branches, and
//! the per-shop invoice counter all live here, alongside the
//! `local_settings` category/key/value table used for persisted UI
//! preferences (e.g. the active-branch selection).
//!
//! Provides schema migrations, settings helpers, and shared state for the
//! service objects in `session`, `branches`, `staff`, and `invoices`.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::Result;

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/shopkeeper.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| crate::error::Error::Validation(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join("shopkeeper.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open a database through a SQLite URI (e.g. a shared-cache in-memory
/// database) and run migrations. For embedders that do not want a file on
/// disk.
pub fn init_uri(uri: &str) -> Result<DbState> {
    let conn = open_and_configure_uri(uri)?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(uri),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    Ok(conn)
}

fn open_and_configure_uri(uri: &str) -> Result<Connection> {
    use rusqlite::OpenFlags;
    let conn = Connection::open_with_flags(
        uri,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI,
    )?;
    configure(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: settings store and credential accounts.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- accounts (local credential store)
        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            email TEXT UNIQUE NOT NULL,
            password_hash TEXT,
            provider TEXT NOT NULL DEFAULT 'password',
            revoked INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key
            ON local_settings(setting_category, setting_key);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .inspect_err(|e| error!("Migration v1 failed: {e}"))?;

    info!("Applied migration v1 (settings, accounts)");
    Ok(())
}

/// Migration v2: shop profiles and staff records.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- shops (one row per owner principal; id = owner's account id)
        CREATE TABLE IF NOT EXISTS shops (
            id TEXT PRIMARY KEY,
            shop_name TEXT,
            user_email TEXT,
            phone TEXT,
            address TEXT,
            display_name TEXT,
            photo_url TEXT,
            auth_provider TEXT NOT NULL DEFAULT 'password',
            account_status TEXT NOT NULL DEFAULT 'active'
                CHECK (account_status IN ('active', 'locked')),
            is_guest INTEGER NOT NULL DEFAULT 0,
            guest_permissions TEXT,
            failed_login_attempts INTEGER NOT NULL DEFAULT 0,
            next_invoice_number INTEGER NOT NULL DEFAULT 0,
            invoice_counter_version INTEGER NOT NULL DEFAULT 0,
            created_at TEXT,
            last_login_at TEXT,
            last_failed_login_at TEXT,
            locked_at TEXT,
            last_password_change TEXT
        );

        -- staff (keyed by the staff member's account id)
        CREATE TABLE IF NOT EXISTS staff (
            id TEXT PRIMARY KEY,
            shop_id TEXT NOT NULL,
            name TEXT NOT NULL,
            email TEXT NOT NULL,
            permissions TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'active',
            account_type TEXT NOT NULL DEFAULT 'staff',
            created_at TEXT NOT NULL,
            updated_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_shops_user_email ON shops(user_email);
        CREATE INDEX IF NOT EXISTS idx_staff_shop_id ON staff(shop_id);
        CREATE INDEX IF NOT EXISTS idx_staff_email ON staff(email);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .inspect_err(|e| error!("Migration v2 failed: {e}"))?;

    info!("Applied migration v2 (shops, staff)");
    Ok(())
}

/// Migration v3: branches.
fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- branches (sub-scopes of a shop; the branch whose id equals the
        -- shop id is the implicit default and can never be deleted)
        CREATE TABLE IF NOT EXISTS branches (
            id TEXT PRIMARY KEY,
            shop_id TEXT NOT NULL,
            name TEXT NOT NULL,
            is_default INTEGER NOT NULL DEFAULT 0,
            created_by TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_branches_shop_id ON branches(shop_id);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .inspect_err(|e| error!("Migration v3 failed: {e}"))?;

    info!("Applied migration v3 (branches)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// Delete a single setting. Silently succeeds when absent.
pub fn delete_setting(conn: &Connection, category: &str, key: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
    )?;
    Ok(())
}

/// Build an in-memory `DbState` for tests.
#[cfg(test)]
pub fn test_state() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .expect("pragmas");
    run_migrations(&conn).expect("run_migrations should succeed in test");
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

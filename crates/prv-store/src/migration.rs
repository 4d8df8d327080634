//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use prv_core::now_millis;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 2;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema {current} is newer than supported {CURRENT_VERSION}"
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
            tracing::debug!(version, "applied schema migration");
        }

        tx.commit()?;
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        2 => apply_v2(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: peers, files and live grants.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Peer trust bindings, one per (chat, peer)
        CREATE TABLE peers (
            chat_id TEXT NOT NULL,
            peer_id TEXT NOT NULL,
            invitation_id TEXT NOT NULL,
            name TEXT NOT NULL,
            email TEXT,
            trust TEXT NOT NULL,              -- pending | trusted | rejected
            direction TEXT NOT NULL,          -- outbound | inbound
            reason TEXT,
            generation INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            resolved_at INTEGER,
            PRIMARY KEY (chat_id, peer_id)
        );

        -- Protected files
        CREATE TABLE files (
            file_id BLOB PRIMARY KEY,         -- 16 bytes
            chat_id TEXT NOT NULL,
            owner TEXT NOT NULL,
            file_name TEXT NOT NULL,
            artifact_path TEXT,
            created_at INTEGER NOT NULL,
            owner_key BLOB                    -- CBOR WrappedKey, owner side only
        );

        -- Live access grants, one per (file, peer)
        CREATE TABLE grants (
            file_id BLOB NOT NULL,
            peer_id TEXT NOT NULL,
            chat_id TEXT NOT NULL,
            role TEXT NOT NULL,               -- owner | grantee
            state TEXT NOT NULL,              -- requested | granted | denied | revoked
            allow_download INTEGER NOT NULL,
            allow_forward INTEGER NOT NULL,
            access_time INTEGER NOT NULL,     -- seconds, <= 0 = no expiry
            lifecycle INTEGER NOT NULL,
            requested_at INTEGER,
            granted_at INTEGER,
            expires_at INTEGER,
            resolved_at INTEGER,
            reason TEXT,
            wrapped_key BLOB,                 -- CBOR WrappedKey, only while granted
            PRIMARY KEY (file_id, peer_id)
        );

        CREATE INDEX idx_files_chat ON files(chat_id);
        CREATE INDEX idx_grants_chat ON grants(chat_id);
        "#,
    )?;

    Ok(())
}

/// Migration v2: archived grant lifecycles.
fn apply_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE grant_history (
            file_id BLOB NOT NULL,
            peer_id TEXT NOT NULL,
            lifecycle INTEGER NOT NULL,
            record BLOB NOT NULL,             -- CBOR AccessGrant without key
            archived_at INTEGER NOT NULL,
            PRIMARY KEY (file_id, peer_id, lifecycle)
        );
        "#,
    )?;

    Ok(())
}

//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend for the PRV engine. It uses
//! rusqlite with bundled SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use prv_core::{now_millis, ChatId, FileId, PeerId};
use prv_perms::{
    AccessGrant, Direction, GrantRole, GrantState, PeerRecord, Permissions, TrustState,
    WrappedKey,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{FileRecord, InsertResult, Store, StoreCounts};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn bad_column(idx: usize, name: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, name.into(), Type::Text)
}

fn file_id_from(row: &Row<'_>, idx: usize) -> rusqlite::Result<FileId> {
    let bytes: Vec<u8> = row.get(idx)?;
    let arr: [u8; 16] = bytes
        .try_into()
        .map_err(|_| rusqlite::Error::InvalidColumnType(idx, "file_id".into(), Type::Blob))?;
    Ok(FileId::from_bytes(arr))
}

fn wrapped_key_from(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<WrappedKey>> {
    let bytes: Option<Vec<u8>> = row.get(idx)?;
    bytes
        .map(|b| {
            WrappedKey::from_bytes(&b).map_err(|_| {
                rusqlite::Error::InvalidColumnType(idx, "wrapped_key".into(), Type::Blob)
            })
        })
        .transpose()
}

const PEER_COLUMNS: &str = "chat_id, peer_id, invitation_id, name, email, trust, direction,
     reason, generation, created_at, resolved_at";

fn row_to_peer(row: &Row<'_>) -> rusqlite::Result<PeerRecord> {
    let trust: String = row.get(5)?;
    let direction: String = row.get(6)?;
    Ok(PeerRecord {
        chat_id: ChatId(row.get(0)?),
        peer_id: PeerId(row.get(1)?),
        invitation_id: PeerId(row.get(2)?),
        name: row.get(3)?,
        email: row.get(4)?,
        trust: TrustState::parse(&trust).ok_or_else(|| bad_column(5, "trust"))?,
        direction: Direction::parse(&direction).ok_or_else(|| bad_column(6, "direction"))?,
        reason: row.get(7)?,
        generation: row.get(8)?,
        created_at: row.get(9)?,
        resolved_at: row.get(10)?,
    })
}

const FILE_COLUMNS: &str =
    "file_id, chat_id, owner, file_name, artifact_path, created_at, owner_key";

fn row_to_file(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let path: Option<String> = row.get(4)?;
    Ok(FileRecord {
        file_id: file_id_from(row, 0)?,
        chat_id: ChatId(row.get(1)?),
        owner: PeerId(row.get(2)?),
        file_name: row.get(3)?,
        artifact_path: path.map(PathBuf::from),
        created_at: row.get(5)?,
        owner_key: wrapped_key_from(row, 6)?,
    })
}

const GRANT_COLUMNS: &str = "file_id, peer_id, chat_id, role, state, allow_download,
     allow_forward, access_time, lifecycle, requested_at, granted_at, expires_at,
     resolved_at, reason, wrapped_key";

fn row_to_grant(row: &Row<'_>) -> rusqlite::Result<AccessGrant> {
    let role: String = row.get(3)?;
    let state: String = row.get(4)?;
    Ok(AccessGrant {
        file_id: file_id_from(row, 0)?,
        peer_id: PeerId(row.get(1)?),
        chat_id: ChatId(row.get(2)?),
        role: GrantRole::parse(&role).ok_or_else(|| bad_column(3, "role"))?,
        state: GrantState::parse(&state).ok_or_else(|| bad_column(4, "state"))?,
        permissions: Permissions {
            allow_download: row.get(5)?,
            allow_forward: row.get(6)?,
            access_time: row.get(7)?,
        },
        lifecycle: row.get(8)?,
        requested_at: row.get(9)?,
        granted_at: row.get(10)?,
        expires_at: row.get(11)?,
        resolved_at: row.get(12)?,
        reason: row.get(13)?,
        wrapped_key: wrapped_key_from(row, 14)?,
    })
}

fn encode_record(grant: &AccessGrant) -> Vec<u8> {
    let mut buf = Vec::new();
    ciborium::into_writer(grant, &mut buf).expect("CBOR serialization failed");
    buf
}

fn decode_record(bytes: &[u8]) -> Result<AccessGrant> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

#[async_trait]
impl Store for SqliteStore {
    async fn put_peer(&self, peer: &PeerRecord) -> Result<()> {
        let peer = peer.clone();
        self.run(move |conn| {
            write_peer(conn, &peer)?;
            Ok(())
        })
        .await
    }

    async fn get_peer(&self, chat_id: &ChatId, peer_id: &PeerId) -> Result<Option<PeerRecord>> {
        let chat_id = chat_id.clone();
        let peer_id = peer_id.clone();
        self.run(move |conn| {
            conn.query_row(
                &format!("SELECT {PEER_COLUMNS} FROM peers WHERE chat_id = ?1 AND peer_id = ?2"),
                params![chat_id.as_str(), peer_id.as_str()],
                row_to_peer,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn rekey_peer(&self, old_id: &PeerId, peer: &PeerRecord) -> Result<()> {
        let old_id = old_id.clone();
        let peer = peer.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM peers WHERE chat_id = ?1 AND peer_id = ?2",
                params![peer.chat_id.as_str(), old_id.as_str()],
            )?;
            write_peer(&tx, &peer)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_peers(&self, chat_id: &ChatId) -> Result<Vec<PeerRecord>> {
        let chat_id = chat_id.clone();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PEER_COLUMNS} FROM peers WHERE chat_id = ?1 ORDER BY peer_id"
            ))?;
            let rows = stmt.query_map(params![chat_id.as_str()], row_to_peer)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(StoreError::from)
        })
        .await
    }

    async fn insert_file(&self, file: &FileRecord) -> Result<InsertResult> {
        let file = file.clone();
        self.run(move |conn| {
            let inserted = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO files ({FILE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    file.file_id.as_bytes().as_slice(),
                    file.chat_id.as_str(),
                    file.owner.as_str(),
                    file.file_name,
                    file.artifact_path
                        .as_ref()
                        .map(|p| p.to_string_lossy().into_owned()),
                    file.created_at,
                    file.owner_key.as_ref().map(WrappedKey::to_bytes),
                ],
            )?;

            Ok(if inserted == 0 {
                InsertResult::AlreadyExists
            } else {
                InsertResult::Inserted
            })
        })
        .await
    }

    async fn get_file(&self, file_id: &FileId) -> Result<Option<FileRecord>> {
        let file_id = *file_id;
        self.run(move |conn| {
            conn.query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE file_id = ?1"),
                params![file_id.as_bytes().as_slice()],
                row_to_file,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn list_files(&self, chat_id: &ChatId) -> Result<Vec<FileRecord>> {
        let chat_id = chat_id.clone();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FILE_COLUMNS} FROM files WHERE chat_id = ?1 ORDER BY created_at, file_id"
            ))?;
            let rows = stmt.query_map(params![chat_id.as_str()], row_to_file)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(StoreError::from)
        })
        .await
    }

    async fn get_grant(&self, file_id: &FileId, peer_id: &PeerId) -> Result<Option<AccessGrant>> {
        let file_id = *file_id;
        let peer_id = peer_id.clone();
        self.run(move |conn| {
            conn.query_row(
                &format!("SELECT {GRANT_COLUMNS} FROM grants WHERE file_id = ?1 AND peer_id = ?2"),
                params![file_id.as_bytes().as_slice(), peer_id.as_str()],
                row_to_grant,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn commit_grant(
        &self,
        next: &AccessGrant,
        archived: Option<&AccessGrant>,
    ) -> Result<()> {
        let next = next.clone();
        let archived = archived.cloned();
        self.run(move |conn| {
            let tx = conn.transaction()?;

            if let Some(old) = &archived {
                let mut keyless = old.clone();
                keyless.wrapped_key = None;
                tx.execute(
                    "INSERT OR REPLACE INTO grant_history
                        (file_id, peer_id, lifecycle, record, archived_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        old.file_id.as_bytes().as_slice(),
                        old.peer_id.as_str(),
                        old.lifecycle,
                        encode_record(&keyless),
                        now_millis(),
                    ],
                )?;
            }

            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO grants ({GRANT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    next.file_id.as_bytes().as_slice(),
                    next.peer_id.as_str(),
                    next.chat_id.as_str(),
                    next.role.as_str(),
                    next.state.as_str(),
                    next.permissions.allow_download,
                    next.permissions.allow_forward,
                    next.permissions.access_time,
                    next.lifecycle,
                    next.requested_at,
                    next.granted_at,
                    next.expires_at,
                    next.resolved_at,
                    next.reason.as_deref(),
                    next.wrapped_key.as_ref().map(WrappedKey::to_bytes),
                ],
            )?;

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn grant_history(
        &self,
        file_id: &FileId,
        peer_id: &PeerId,
    ) -> Result<Vec<AccessGrant>> {
        let file_id = *file_id;
        let peer_id = peer_id.clone();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT record FROM grant_history
                 WHERE file_id = ?1 AND peer_id = ?2 ORDER BY lifecycle",
            )?;
            let blobs = stmt
                .query_map(params![file_id.as_bytes().as_slice(), peer_id.as_str()], |row| {
                    row.get::<_, Vec<u8>>(0)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            blobs.iter().map(|b| decode_record(b)).collect()
        })
        .await
    }

    async fn list_grants_for_file(&self, file_id: &FileId) -> Result<Vec<AccessGrant>> {
        let file_id = *file_id;
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {GRANT_COLUMNS} FROM grants WHERE file_id = ?1 ORDER BY peer_id"
            ))?;
            let rows = stmt.query_map(params![file_id.as_bytes().as_slice()], row_to_grant)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(StoreError::from)
        })
        .await
    }

    async fn list_grants_for_chat(&self, chat_id: &ChatId) -> Result<Vec<AccessGrant>> {
        let chat_id = chat_id.clone();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {GRANT_COLUMNS} FROM grants WHERE chat_id = ?1 ORDER BY file_id, peer_id"
            ))?;
            let rows = stmt.query_map(params![chat_id.as_str()], row_to_grant)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(StoreError::from)
        })
        .await
    }

    async fn counts(&self) -> Result<StoreCounts> {
        self.run(|conn| {
            let count = |sql: &str| -> Result<u64> {
                let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(n as u64)
            };
            Ok(StoreCounts {
                peers: count("SELECT COUNT(*) FROM peers")?,
                trusted_peers: count("SELECT COUNT(*) FROM peers WHERE trust = 'trusted'")?,
                files: count("SELECT COUNT(*) FROM files")?,
                grants: count("SELECT COUNT(*) FROM grants")?,
                granted: count("SELECT COUNT(*) FROM grants WHERE state = 'granted'")?,
                archived_grants: count("SELECT COUNT(*) FROM grant_history")?,
            })
        })
        .await
    }
}

fn write_peer(conn: &Connection, peer: &PeerRecord) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO peers ({PEER_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            peer.chat_id.as_str(),
            peer.peer_id.as_str(),
            peer.invitation_id.as_str(),
            peer.name,
            peer.email.as_deref(),
            peer.trust.as_str(),
            peer.direction.as_str(),
            peer.reason.as_deref(),
            peer.generation,
            peer.created_at,
            peer.resolved_at,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StoreExt;
    use prv_perms::{
        peer, state, EncryptionKey, GrantKey, Invitation, X25519StaticSecret,
    };

    fn file() -> FileRecord {
        FileRecord {
            file_id: FileId::from_bytes([9; 16]),
            chat_id: "chat1".into(),
            owner: "alice".into(),
            file_name: "plan.txt".into(),
            artifact_path: Some(PathBuf::from("/tmp/plan.txt.prv")),
            created_at: 1234,
            owner_key: None,
        }
    }

    fn wrapped_for(file_id: FileId, grantee: &str) -> WrappedKey {
        let secret = X25519StaticSecret::generate();
        WrappedKey::seal(
            file_id,
            grantee.into(),
            &EncryptionKey::generate(),
            &secret.public_key(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_peer_roundtrip() {
        let store = SqliteStore::open_memory().unwrap();
        let pending = peer::invite(
            None,
            Invitation {
                chat_id: "chat1".into(),
                peer_id: "bob".into(),
                name: "Bob".into(),
                email: Some("bob@example.org".into()),
                direction: Direction::Inbound,
            },
            5,
        )
        .unwrap();
        store.put_peer(&pending).await.unwrap();

        let trusted = peer::resolve(&pending, true, None, 6).unwrap().record;
        store.put_peer(&trusted).await.unwrap();

        let got = store
            .get_peer(&"chat1".into(), &"bob".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, trusted);
        assert_eq!(store.trusted_peers(&"chat1".into()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_roundtrip_with_owner_key() {
        let store = SqliteStore::open_memory().unwrap();
        let mut f = file();
        f.owner_key = Some(wrapped_for(f.file_id, "alice"));

        assert_eq!(store.insert_file(&f).await.unwrap(), InsertResult::Inserted);
        assert_eq!(
            store.insert_file(&f).await.unwrap(),
            InsertResult::AlreadyExists
        );
        assert_eq!(store.get_file(&f.file_id).await.unwrap(), Some(f));
    }

    #[tokio::test]
    async fn test_grant_commit_and_history() {
        let store = SqliteStore::open_memory().unwrap();
        let key = GrantKey::new(FileId::from_bytes([9; 16]), "bob".into());
        let chat = ChatId::from("chat1");

        let perms = Permissions::new(true, false, 30);
        let wk = wrapped_for(key.file_id, "bob");
        let granted = state::grant(None, &key, &chat, perms, wk.clone(), 1_000).unwrap();
        store.commit_transition(&granted).await.unwrap();

        let live = store.get_grant(&key.file_id, &key.peer_id).await.unwrap().unwrap();
        assert_eq!(live, granted.next);
        assert_eq!(live.wrapped_key, Some(wk));
        assert_eq!(live.expires_at, Some(31_000));

        let revoked = state::revoke(Some(&live), "done", 2_000).unwrap();
        store.commit_transition(&revoked).await.unwrap();
        let reopened = state::request(Some(&revoked.next), &key, &chat, GrantRole::Owner, 0, 3_000)
            .unwrap();
        store.commit_transition(&reopened).await.unwrap();

        let history = store.grant_history(&key.file_id, &key.peer_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, GrantState::Revoked);
        assert!(history[0].wrapped_key.is_none());

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.grants, 1);
        assert_eq!(counts.granted, 0);
        assert_eq!(counts.archived_grants, 1);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prv.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_file(&file()).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get_file(&file().file_id).await.unwrap().is_some());
        assert_eq!(store.list_files(&"chat1".into()).await.unwrap().len(), 1);
    }
}

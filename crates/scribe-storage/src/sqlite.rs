//! SQLite storage backend

use crate::{
    document_not_found, drain_updates, page_offset, seq_param, state_from_snapshot,
    DocumentStore, StorageError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use scribe_core::{
    now_millis, Collaborator, Document, DocumentId, DocumentPage, DocumentSnapshot,
    DocumentUpdate, MaterializedState, PageMeta, Role, SnapshotOutcome, UserId,
};
use std::path::Path;

const DOCUMENT_COLUMNS: &str = "id, title, owner_id, update_seq, created_at, updated_at";

/// SQLite storage backend
///
/// Embedded persistence suitable for single-node deployments. The connection
/// mutex serializes writers; every multi-statement operation runs inside one
/// SQLite transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        id: DocumentId(row.get::<_, i64>(0)? as u64),
        title: row.get(1)?,
        owner_id: UserId(row.get::<_, i64>(2)? as u64),
        update_seq: row.get::<_, i64>(3)? as u64,
        created_at: row.get::<_, i64>(4)? as u64,
        updated_at: row.get::<_, i64>(5)? as u64,
    })
}

fn parse_role(raw: &str) -> Result<Role, StorageError> {
    raw.parse()
        .map_err(|_| StorageError::Database(format!("invalid stored role: {raw}")))
}

impl SqliteStore {
    /// Create a new SQLite store with the given path
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(|e| StorageError::Connection(e.to_string()))?;
        Self::with_connection(conn)
    }

    /// Create an in-memory SQLite database (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StorageError::Connection(e.to_string()))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                owner_id INTEGER NOT NULL,
                update_seq INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_owner
                ON documents(owner_id, updated_at DESC);

            CREATE TABLE IF NOT EXISTS document_updates (
                document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                payload BLOB NOT NULL,
                author_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (document_id, seq)
            );

            CREATE TABLE IF NOT EXISTS document_snapshots (
                document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                payload BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (document_id, seq)
            );

            CREATE TABLE IF NOT EXISTS document_collaborators (
                document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                added_at INTEGER NOT NULL,
                PRIMARY KEY (document_id, user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_collaborators_user
                ON document_collaborators(user_id);
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }

    fn query_updates(
        conn: &Connection,
        id: DocumentId,
        since_seq: u64,
        limit: usize,
    ) -> Result<Vec<DocumentUpdate>, StorageError> {
        let mut stmt = conn
            .prepare(
                "SELECT seq, payload, author_id, created_at FROM document_updates
                 WHERE document_id = ?1 AND seq > ?2
                 ORDER BY seq ASC
                 LIMIT ?3",
            )
            .map_err(db_err)?;

        let updates = stmt
            .query_map(
                params![id.0 as i64, seq_param(since_seq), limit as i64],
                |row| {
                    Ok(DocumentUpdate {
                        document_id: id,
                        seq: row.get::<_, i64>(0)? as u64,
                        payload: row.get(1)?,
                        author_id: UserId(row.get::<_, i64>(2)? as u64),
                        created_at: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        Ok(updates)
    }

    fn query_latest_snapshot(
        conn: &Connection,
        id: DocumentId,
    ) -> Result<Option<DocumentSnapshot>, StorageError> {
        conn.query_row(
            "SELECT seq, payload, created_at FROM document_snapshots
             WHERE document_id = ?1
             ORDER BY seq DESC
             LIMIT 1",
            params![id.0 as i64],
            |row| {
                Ok(DocumentSnapshot {
                    document_id: id,
                    seq: row.get::<_, i64>(0)? as u64,
                    payload: row.get(1)?,
                    created_at: row.get::<_, i64>(2)? as u64,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn document_page(
        conn: &Connection,
        count_sql: &str,
        page_sql: &str,
        user: UserId,
        page: u32,
        per_page: u32,
    ) -> Result<DocumentPage, StorageError> {
        let total: i64 = conn
            .query_row(count_sql, params![user.0 as i64], |row| row.get(0))
            .map_err(db_err)?;

        let mut stmt = conn.prepare(page_sql).map_err(db_err)?;
        let documents = stmt
            .query_map(
                params![
                    user.0 as i64,
                    per_page as i64,
                    page_offset(page, per_page) as i64
                ],
                document_from_row,
            )
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        Ok(DocumentPage {
            documents,
            meta: PageMeta::new(total as u64, page, per_page),
        })
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn create_document(&self, owner: UserId, title: &str) -> Result<Document, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let now = now_millis();

        tx.execute(
            "INSERT INTO documents (title, owner_id, update_seq, created_at, updated_at)
             VALUES (?1, ?2, 0, ?3, ?3)",
            params![title, owner.0 as i64, now as i64],
        )
        .map_err(db_err)?;
        let id = DocumentId(tx.last_insert_rowid() as u64);

        tx.execute(
            "INSERT INTO document_collaborators (document_id, user_id, role, added_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id.0 as i64, owner.0 as i64, Role::Owner.as_str(), now as i64],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;

        Ok(Document {
            id,
            title: title.to_string(),
            owner_id: owner,
            update_seq: 0,
            created_at: now,
            updated_at: now,
        })
    }

    async fn find_document(&self, id: DocumentId) -> Result<Option<Document>, StorageError> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"),
            params![id.0 as i64],
            document_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    async fn rename_document(&self, id: DocumentId, title: &str) -> Result<Document, StorageError> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "UPDATE documents SET title = ?1, updated_at = ?2 WHERE id = ?3
                 RETURNING {DOCUMENT_COLUMNS}"
            ),
            params![title, now_millis() as i64, id.0 as i64],
            document_from_row,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| document_not_found(id))
    }

    async fn delete_document(&self, id: DocumentId) -> Result<bool, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;

        for table in ["document_updates", "document_snapshots", "document_collaborators"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE document_id = ?1"),
                params![id.0 as i64],
            )
            .map_err(db_err)?;
        }
        let affected = tx
            .execute("DELETE FROM documents WHERE id = ?1", params![id.0 as i64])
            .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(affected > 0)
    }

    async fn append_update(
        &self,
        id: DocumentId,
        author: UserId,
        payload: &[u8],
    ) -> Result<u64, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let now = now_millis() as i64;

        let seq: i64 = tx
            .query_row(
                "UPDATE documents SET update_seq = update_seq + 1, updated_at = ?1
                 WHERE id = ?2
                 RETURNING update_seq",
                params![now, id.0 as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| document_not_found(id))?;

        tx.execute(
            "INSERT INTO document_updates (document_id, seq, payload, author_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id.0 as i64, seq, payload, author.0 as i64, now],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(seq as u64)
    }

    async fn updates_since(
        &self,
        id: DocumentId,
        since_seq: u64,
        limit: usize,
    ) -> Result<Vec<DocumentUpdate>, StorageError> {
        let conn = self.conn.lock();
        Self::query_updates(&conn, id, since_seq, limit)
    }

    async fn current_seq(&self, id: DocumentId) -> Result<u64, StorageError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT update_seq FROM documents WHERE id = ?1",
            params![id.0 as i64],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(db_err)?
        .map(|seq| seq as u64)
        .ok_or_else(|| document_not_found(id))
    }

    async fn create_snapshot_if_absent(
        &self,
        id: DocumentId,
        seq: u64,
        payload: &[u8],
    ) -> Result<SnapshotOutcome, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;

        let current: i64 = tx
            .query_row(
                "SELECT update_seq FROM documents WHERE id = ?1",
                params![id.0 as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| document_not_found(id))?;

        if seq > current as u64 {
            return Err(StorageError::InvalidInput(format!(
                "snapshot seq {seq} is ahead of document {id} update_seq {current}"
            )));
        }

        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM document_snapshots WHERE document_id = ?1 AND seq = ?2)",
                params![id.0 as i64, seq as i64],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if exists {
            return Ok(SnapshotOutcome::AlreadyExists { seq });
        }

        tx.execute(
            "INSERT INTO document_snapshots (document_id, seq, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id.0 as i64, seq as i64, payload, now_millis() as i64],
        )
        .map_err(db_err)?;

        let pruned = tx
            .execute(
                "DELETE FROM document_updates WHERE document_id = ?1 AND seq <= ?2",
                params![id.0 as i64, seq as i64],
            )
            .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(SnapshotOutcome::Created {
            seq,
            pruned: pruned as u64,
        })
    }

    async fn latest_snapshot(&self, id: DocumentId) -> Result<Option<DocumentSnapshot>, StorageError> {
        let conn = self.conn.lock();
        Self::query_latest_snapshot(&conn, id)
    }

    async fn materialized_state(
        &self,
        id: DocumentId,
        page_size: usize,
    ) -> Result<MaterializedState, StorageError> {
        let mut conn = self.conn.lock();
        // One read transaction pins the snapshot and every page to the same view
        let tx = conn.transaction().map_err(db_err)?;

        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM documents WHERE id = ?1)",
                params![id.0 as i64],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if !exists {
            return Err(document_not_found(id));
        }

        let mut state = state_from_snapshot(Self::query_latest_snapshot(&tx, id)?);
        drain_updates(&mut state, page_size, |since, limit| {
            Self::query_updates(&tx, id, since, limit)
        })?;

        tx.commit().map_err(db_err)?;
        Ok(state)
    }

    async fn last_snapshot_seq(&self, id: DocumentId) -> Result<u64, StorageError> {
        let conn = self.conn.lock();
        let seq: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM document_snapshots WHERE document_id = ?1",
                params![id.0 as i64],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(seq as u64)
    }

    async fn role_of(&self, id: DocumentId, user: UserId) -> Result<Option<Role>, StorageError> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT role FROM document_collaborators WHERE document_id = ?1 AND user_id = ?2",
                params![id.0 as i64, user.0 as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        raw.as_deref().map(parse_role).transpose()
    }

    async fn list_collaborators(&self, id: DocumentId) -> Result<Vec<Collaborator>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT user_id, role, added_at FROM document_collaborators
                 WHERE document_id = ?1
                 ORDER BY added_at ASC, role = 'owner' DESC, user_id ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![id.0 as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|(user_id, role, added_at)| {
                Ok(Collaborator {
                    document_id: id,
                    user_id: UserId(user_id as u64),
                    role: parse_role(&role)?,
                    added_at: added_at as u64,
                })
            })
            .collect()
    }

    async fn add_collaborator(
        &self,
        id: DocumentId,
        user: UserId,
        role: Role,
    ) -> Result<Collaborator, StorageError> {
        let conn = self.conn.lock();
        let now = now_millis();

        let inserted = conn
            .execute(
                "INSERT INTO document_collaborators (document_id, user_id, role, added_at)
                 SELECT ?1, ?2, ?3, ?4 WHERE EXISTS (SELECT 1 FROM documents WHERE id = ?1)
                 ON CONFLICT (document_id, user_id) DO NOTHING",
                params![id.0 as i64, user.0 as i64, role.as_str(), now as i64],
            )
            .map_err(db_err)?;

        if inserted == 0 {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM documents WHERE id = ?1)",
                    params![id.0 as i64],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            return Err(if exists {
                StorageError::AlreadyExists(format!("user {user} on document {id}"))
            } else {
                document_not_found(id)
            });
        }

        Ok(Collaborator {
            document_id: id,
            user_id: user,
            role,
            added_at: now,
        })
    }

    async fn update_collaborator_role(
        &self,
        id: DocumentId,
        user: UserId,
        role: Role,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "UPDATE document_collaborators SET role = ?1 WHERE document_id = ?2 AND user_id = ?3",
                params![role.as_str(), id.0 as i64, user.0 as i64],
            )
            .map_err(db_err)?;

        if affected == 0 {
            return Err(StorageError::NotFound(format!("user {user} on document {id}")));
        }
        Ok(())
    }

    async fn remove_collaborator(&self, id: DocumentId, user: UserId) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "DELETE FROM document_collaborators WHERE document_id = ?1 AND user_id = ?2",
                params![id.0 as i64, user.0 as i64],
            )
            .map_err(db_err)?;

        if affected == 0 {
            return Err(StorageError::NotFound(format!("user {user} on document {id}")));
        }
        Ok(())
    }

    async fn list_owned_documents(
        &self,
        owner: UserId,
        page: u32,
        per_page: u32,
    ) -> Result<DocumentPage, StorageError> {
        let conn = self.conn.lock();
        Self::document_page(
            &conn,
            "SELECT COUNT(*) FROM documents WHERE owner_id = ?1",
            &format!(
                "SELECT {DOCUMENT_COLUMNS} FROM documents
                 WHERE owner_id = ?1
                 ORDER BY updated_at DESC, id DESC
                 LIMIT ?2 OFFSET ?3"
            ),
            owner,
            page,
            per_page,
        )
    }

    async fn list_shared_documents(
        &self,
        user: UserId,
        page: u32,
        per_page: u32,
    ) -> Result<DocumentPage, StorageError> {
        let conn = self.conn.lock();
        Self::document_page(
            &conn,
            "SELECT COUNT(*) FROM document_collaborators
             WHERE user_id = ?1 AND role <> 'owner'",
            "SELECT d.id, d.title, d.owner_id, d.update_seq, d.created_at, d.updated_at
             FROM documents d
             JOIN document_collaborators c ON c.document_id = d.id
             WHERE c.user_id = ?1 AND c.role <> 'owner'
             ORDER BY d.updated_at DESC, d.id DESC
             LIMIT ?2 OFFSET ?3",
            user,
            page,
            per_page,
        )
    }
}

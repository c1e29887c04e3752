//! In-memory storage backend

use crate::{
    document_not_found, drain_updates, page_offset, state_from_snapshot, DocumentStore,
    StorageError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use scribe_core::{
    now_millis, Collaborator, Document, DocumentId, DocumentPage, DocumentSnapshot,
    DocumentUpdate, MaterializedState, PageMeta, Role, SnapshotOutcome, UserId,
};
use std::collections::BTreeMap;

#[derive(Default)]
struct Tables {
    next_id: u64,
    documents: BTreeMap<DocumentId, Document>,
    /// (document, seq) -> update
    updates: BTreeMap<(DocumentId, u64), DocumentUpdate>,
    /// (document, seq) -> snapshot
    snapshots: BTreeMap<(DocumentId, u64), DocumentSnapshot>,
    /// (document, user) -> collaborator
    collaborators: BTreeMap<(DocumentId, UserId), Collaborator>,
}

impl Tables {
    fn document_mut(&mut self, id: DocumentId) -> Result<&mut Document, StorageError> {
        self.documents.get_mut(&id).ok_or_else(|| document_not_found(id))
    }

    fn updates_after(&self, id: DocumentId, since_seq: u64, limit: usize) -> Vec<DocumentUpdate> {
        if since_seq == u64::MAX {
            return Vec::new();
        }
        self.updates
            .range((id, since_seq + 1)..=(id, u64::MAX))
            .take(limit)
            .map(|(_, update)| update.clone())
            .collect()
    }

    fn latest_snapshot(&self, id: DocumentId) -> Option<DocumentSnapshot> {
        self.snapshots
            .range((id, 0)..=(id, u64::MAX))
            .next_back()
            .map(|(_, snapshot)| snapshot.clone())
    }

    fn page(&self, mut docs: Vec<&Document>, page: u32, per_page: u32) -> DocumentPage {
        docs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        let total = docs.len() as u64;
        let documents = docs
            .into_iter()
            .skip(page_offset(page, per_page) as usize)
            .take(per_page as usize)
            .cloned()
            .collect();

        DocumentPage {
            documents,
            meta: PageMeta::new(total, page, per_page),
        }
    }
}

/// In-memory storage backend
///
/// Every operation holds the single table lock for its whole body, which gives
/// the same all-or-nothing behaviour as a database transaction. Data is lost when
/// the process exits.
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Number of update rows currently held for a document
    pub fn update_count(&self, id: DocumentId) -> usize {
        let tables = self.tables.lock();
        tables
            .updates
            .range((id, 0)..=(id, u64::MAX))
            .count()
    }

    /// Number of snapshot rows currently held for a document
    pub fn snapshot_count(&self, id: DocumentId) -> usize {
        let tables = self.tables.lock();
        tables
            .snapshots
            .range((id, 0)..=(id, u64::MAX))
            .count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_document(&self, owner: UserId, title: &str) -> Result<Document, StorageError> {
        let mut tables = self.tables.lock();
        tables.next_id += 1;

        let now = now_millis();
        let doc = Document {
            id: DocumentId(tables.next_id),
            title: title.to_string(),
            owner_id: owner,
            update_seq: 0,
            created_at: now,
            updated_at: now,
        };
        tables.documents.insert(doc.id, doc.clone());
        tables.collaborators.insert(
            (doc.id, owner),
            Collaborator {
                document_id: doc.id,
                user_id: owner,
                role: Role::Owner,
                added_at: now,
            },
        );

        Ok(doc)
    }

    async fn find_document(&self, id: DocumentId) -> Result<Option<Document>, StorageError> {
        Ok(self.tables.lock().documents.get(&id).cloned())
    }

    async fn rename_document(&self, id: DocumentId, title: &str) -> Result<Document, StorageError> {
        let mut tables = self.tables.lock();
        let doc = tables.document_mut(id)?;
        doc.title = title.to_string();
        doc.updated_at = now_millis();
        Ok(doc.clone())
    }

    async fn delete_document(&self, id: DocumentId) -> Result<bool, StorageError> {
        let mut tables = self.tables.lock();
        if tables.documents.remove(&id).is_none() {
            return Ok(false);
        }
        tables.updates.retain(|(doc, _), _| *doc != id);
        tables.snapshots.retain(|(doc, _), _| *doc != id);
        tables.collaborators.retain(|(doc, _), _| *doc != id);
        Ok(true)
    }

    async fn append_update(
        &self,
        id: DocumentId,
        author: UserId,
        payload: &[u8],
    ) -> Result<u64, StorageError> {
        let mut tables = self.tables.lock();
        let now = now_millis();

        let doc = tables.document_mut(id)?;
        doc.update_seq += 1;
        doc.updated_at = now;
        let seq = doc.update_seq;

        tables.updates.insert(
            (id, seq),
            DocumentUpdate {
                document_id: id,
                seq,
                payload: payload.to_vec(),
                author_id: author,
                created_at: now,
            },
        );

        Ok(seq)
    }

    async fn updates_since(
        &self,
        id: DocumentId,
        since_seq: u64,
        limit: usize,
    ) -> Result<Vec<DocumentUpdate>, StorageError> {
        Ok(self.tables.lock().updates_after(id, since_seq, limit))
    }

    async fn current_seq(&self, id: DocumentId) -> Result<u64, StorageError> {
        let tables = self.tables.lock();
        tables
            .documents
            .get(&id)
            .map(|doc| doc.update_seq)
            .ok_or_else(|| document_not_found(id))
    }

    async fn create_snapshot_if_absent(
        &self,
        id: DocumentId,
        seq: u64,
        payload: &[u8],
    ) -> Result<SnapshotOutcome, StorageError> {
        let mut tables = self.tables.lock();

        let current = tables.document_mut(id)?.update_seq;
        if seq > current {
            return Err(StorageError::InvalidInput(format!(
                "snapshot seq {seq} is ahead of document {id} update_seq {current}"
            )));
        }

        if tables.snapshots.contains_key(&(id, seq)) {
            return Ok(SnapshotOutcome::AlreadyExists { seq });
        }

        tables.snapshots.insert(
            (id, seq),
            DocumentSnapshot {
                document_id: id,
                seq,
                payload: payload.to_vec(),
                created_at: now_millis(),
            },
        );

        let before = tables.updates.len();
        tables
            .updates
            .retain(|(doc, update_seq), _| *doc != id || *update_seq > seq);
        let pruned = (before - tables.updates.len()) as u64;

        Ok(SnapshotOutcome::Created { seq, pruned })
    }

    async fn latest_snapshot(&self, id: DocumentId) -> Result<Option<DocumentSnapshot>, StorageError> {
        Ok(self.tables.lock().latest_snapshot(id))
    }

    async fn materialized_state(
        &self,
        id: DocumentId,
        page_size: usize,
    ) -> Result<MaterializedState, StorageError> {
        let tables = self.tables.lock();
        if !tables.documents.contains_key(&id) {
            return Err(document_not_found(id));
        }

        let mut state = state_from_snapshot(tables.latest_snapshot(id));
        drain_updates(&mut state, page_size, |since, limit| {
            Ok(tables.updates_after(id, since, limit))
        })?;
        Ok(state)
    }

    async fn role_of(&self, id: DocumentId, user: UserId) -> Result<Option<Role>, StorageError> {
        let tables = self.tables.lock();
        Ok(tables.collaborators.get(&(id, user)).map(|c| c.role))
    }

    async fn list_collaborators(&self, id: DocumentId) -> Result<Vec<Collaborator>, StorageError> {
        let tables = self.tables.lock();
        let mut collaborators: Vec<Collaborator> = tables
            .collaborators
            .range((id, UserId(0))..=(id, UserId(u64::MAX)))
            .map(|(_, c)| c.clone())
            .collect();
        collaborators.sort_by_key(|c| (c.added_at, c.role != Role::Owner));
        Ok(collaborators)
    }

    async fn add_collaborator(
        &self,
        id: DocumentId,
        user: UserId,
        role: Role,
    ) -> Result<Collaborator, StorageError> {
        let mut tables = self.tables.lock();
        tables.document_mut(id)?;

        if tables.collaborators.contains_key(&(id, user)) {
            return Err(StorageError::AlreadyExists(format!(
                "user {user} on document {id}"
            )));
        }

        let collaborator = Collaborator {
            document_id: id,
            user_id: user,
            role,
            added_at: now_millis(),
        };
        tables.collaborators.insert((id, user), collaborator.clone());
        Ok(collaborator)
    }

    async fn update_collaborator_role(
        &self,
        id: DocumentId,
        user: UserId,
        role: Role,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.lock();
        match tables.collaborators.get_mut(&(id, user)) {
            Some(collaborator) => {
                collaborator.role = role;
                Ok(())
            }
            None => Err(StorageError::NotFound(format!(
                "user {user} on document {id}"
            ))),
        }
    }

    async fn remove_collaborator(&self, id: DocumentId, user: UserId) -> Result<(), StorageError> {
        let mut tables = self.tables.lock();
        tables
            .collaborators
            .remove(&(id, user))
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("user {user} on document {id}")))
    }

    async fn list_owned_documents(
        &self,
        owner: UserId,
        page: u32,
        per_page: u32,
    ) -> Result<DocumentPage, StorageError> {
        let tables = self.tables.lock();
        let docs = tables
            .documents
            .values()
            .filter(|doc| doc.owner_id == owner)
            .collect();
        Ok(tables.page(docs, page, per_page))
    }

    async fn list_shared_documents(
        &self,
        user: UserId,
        page: u32,
        per_page: u32,
    ) -> Result<DocumentPage, StorageError> {
        let tables = self.tables.lock();
        let docs = tables
            .collaborators
            .values()
            .filter(|c| c.user_id == user && c.role != Role::Owner)
            .filter_map(|c| tables.documents.get(&c.document_id))
            .collect();
        Ok(tables.page(docs, page, per_page))
    }
}

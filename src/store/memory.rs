//! In-process store for local runs and tests.
//!
//! All tables live behind one `RwLock`, so every write (including the status
//! transitions) is atomic. Stored files are served back through
//! `GET /files/{storage_ref}` on this service.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use super::{ComparisonStore, ContactStore, DocumentStore};
use crate::error::StoreError;
use crate::schema::{
    new_id, Blob, Comparison, ComparisonResult, ComparisonStatus, Contact, ContactPatch,
    NewComparison, NewContact, SourceDocument, StatusKind, StatusUpdate,
};

#[derive(Debug, Default)]
struct Tables {
    contacts: Vec<Contact>,
    comparisons: Vec<Comparison>,
    documents: Vec<SourceDocument>,
    blobs: HashMap<String, Blob>,
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Tables>>,
    public_base_url: String,
}

impl MemoryStore {
    pub fn new(public_base_url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Tables::default())),
            public_base_url: public_base_url.into(),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

impl Tables {
    fn comparison_mut(&mut self, id: &str) -> Result<&mut Comparison, StoreError> {
        self.comparisons
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| StoreError::not_found("comparison", id))
    }
}

#[async_trait]
impl ContactStore for MemoryStore {
    async fn create_contact(&self, user_id: &str, input: NewContact) -> Result<Contact, StoreError> {
        let contact = Contact::new(user_id, input);
        self.write()?.contacts.push(contact.clone());
        Ok(contact)
    }

    async fn get_contact(&self, id: &str) -> Result<Option<Contact>, StoreError> {
        Ok(self.read()?.contacts.iter().find(|c| c.id == id).cloned())
    }

    async fn list_contacts(&self, user_id: &str) -> Result<Vec<Contact>, StoreError> {
        Ok(self
            .read()?
            .contacts
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn search_contacts(&self, user_id: &str, query: &str) -> Result<Vec<Contact>, StoreError> {
        let needle = query.trim().to_lowercase();
        Ok(self
            .read()?
            .contacts
            .iter()
            .filter(|c| c.user_id == user_id)
            .filter(|c| needle.is_empty() || c.name.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }

    async fn update_contact(&self, id: &str, patch: ContactPatch) -> Result<Contact, StoreError> {
        let mut tables = self.write()?;
        let contact = tables
            .contacts
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| StoreError::not_found("contact", id))?;
        contact.apply(patch);
        Ok(contact.clone())
    }

    async fn delete_contact(&self, id: &str) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let before = tables.contacts.len();
        tables.contacts.retain(|c| c.id != id);
        if tables.contacts.len() == before {
            return Err(StoreError::not_found("contact", id));
        }
        Ok(())
    }
}

#[async_trait]
impl ComparisonStore for MemoryStore {
    async fn create_comparison(
        &self,
        user_id: &str,
        input: NewComparison,
    ) -> Result<Comparison, StoreError> {
        let comparison = Comparison::new(user_id, input);
        self.write()?.comparisons.push(comparison.clone());
        Ok(comparison)
    }

    async fn get_comparison(&self, id: &str) -> Result<Option<Comparison>, StoreError> {
        Ok(self.read()?.comparisons.iter().find(|c| c.id == id).cloned())
    }

    async fn list_comparisons(&self, user_id: &str) -> Result<Vec<Comparison>, StoreError> {
        Ok(self
            .read()?
            .comparisons
            .iter()
            .rev()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_comparisons_by_contact(
        &self,
        contact_id: &str,
    ) -> Result<Vec<Comparison>, StoreError> {
        Ok(self
            .read()?
            .comparisons
            .iter()
            .rev()
            .filter(|c| c.contact_id == contact_id)
            .cloned()
            .collect())
    }

    async fn set_status(&self, id: &str, update: StatusUpdate) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let comparison = tables.comparison_mut(id)?;
        comparison
            .apply_status(update)
            .map_err(|(from, to)| StoreError::InvalidTransition { from, to })?;
        debug!("Comparison {} -> {}", id, comparison.state.kind());
        Ok(())
    }

    async fn store_result(&self, id: &str, result: ComparisonResult) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        tables
            .comparison_mut(id)?
            .complete(result)
            .map_err(|(from, to)| StoreError::InvalidTransition { from, to })
    }

    async fn delete_comparison(&self, id: &str) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let before = tables.comparisons.len();
        tables.comparisons.retain(|c| c.id != id);
        if tables.comparisons.len() == before {
            return Err(StoreError::not_found("comparison", id));
        }

        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut tables.documents)
            .into_iter()
            .partition(|d| d.comparison_id == id);
        tables.documents = kept;
        for document in &removed {
            tables.blobs.remove(&document.storage_ref);
        }
        debug!("Deleted comparison {} and {} documents", id, removed.len());
        Ok(())
    }

    async fn list_stale_processing(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Comparison>, StoreError> {
        Ok(self
            .read()?
            .comparisons
            .iter()
            .filter(|c| {
                matches!(c.state, ComparisonStatus::Processing { started_at } if started_at <= started_before)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn put_blob(&self, data: Vec<u8>, mime_type: &str) -> Result<String, StoreError> {
        let storage_ref = new_id("blob");
        let size = data.len();
        self.write()?.blobs.insert(
            storage_ref.clone(),
            Blob {
                data,
                mime_type: mime_type.to_string(),
            },
        );
        debug!("MemoryStore: stored '{}' ({} bytes)", storage_ref, size);
        Ok(storage_ref)
    }

    async fn get_blob(&self, storage_ref: &str) -> Result<Option<Blob>, StoreError> {
        Ok(self.read()?.blobs.get(storage_ref).cloned())
    }

    async fn add_document(&self, document: SourceDocument) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let status = match tables.comparisons.iter().find(|c| c.id == document.comparison_id) {
            Some(comparison) => comparison.state.kind(),
            None => return Err(StoreError::not_found("comparison", document.comparison_id)),
        };
        if status != StatusKind::Uploading {
            return Err(StoreError::NotUploading { status });
        }
        tables.documents.push(document);
        Ok(())
    }

    async fn list_documents(&self, comparison_id: &str) -> Result<Vec<SourceDocument>, StoreError> {
        Ok(self
            .read()?
            .documents
            .iter()
            .filter(|d| d.comparison_id == comparison_id)
            .cloned()
            .collect())
    }

    async fn resolve_url(&self, storage_ref: &str) -> Result<Option<String>, StoreError> {
        let exists = self.read()?.blobs.contains_key(storage_ref);
        Ok(exists.then(|| format!("{}/files/{}", self.public_base_url, storage_ref)))
    }
}

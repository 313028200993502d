//! Persistence boundary.
//!
//! Defines the store traits the pipeline and HTTP handlers call into, so the
//! backing system (in-process memory or Supabase) can be swapped at startup.

pub mod memory;
pub mod supabase;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::schema::{
    Blob, Comparison, ComparisonResult, Contact, ContactPatch, NewComparison, NewContact,
    SourceDocument, StatusUpdate,
};

/// Broker contacts.
#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn create_contact(&self, user_id: &str, input: NewContact) -> Result<Contact, StoreError>;
    async fn get_contact(&self, id: &str) -> Result<Option<Contact>, StoreError>;
    async fn list_contacts(&self, user_id: &str) -> Result<Vec<Contact>, StoreError>;
    /// Case-insensitive name match. An empty query lists everything.
    async fn search_contacts(&self, user_id: &str, query: &str) -> Result<Vec<Contact>, StoreError>;
    async fn update_contact(&self, id: &str, patch: ContactPatch) -> Result<Contact, StoreError>;
    async fn delete_contact(&self, id: &str) -> Result<(), StoreError>;
}

/// Comparisons and their status/result writes.
#[async_trait]
pub trait ComparisonStore: Send + Sync {
    async fn create_comparison(
        &self,
        user_id: &str,
        input: NewComparison,
    ) -> Result<Comparison, StoreError>;
    async fn get_comparison(&self, id: &str) -> Result<Option<Comparison>, StoreError>;
    /// Newest first.
    async fn list_comparisons(&self, user_id: &str) -> Result<Vec<Comparison>, StoreError>;
    /// Newest first.
    async fn list_comparisons_by_contact(
        &self,
        contact_id: &str,
    ) -> Result<Vec<Comparison>, StoreError>;
    /// Atomic, validated status write. Rejects transitions the lifecycle forbids.
    async fn set_status(&self, id: &str, update: StatusUpdate) -> Result<(), StoreError>;
    /// Attach the result and mark the comparison completed in one write.
    async fn store_result(&self, id: &str, result: ComparisonResult) -> Result<(), StoreError>;
    /// Delete the comparison along with its documents and stored files.
    async fn delete_comparison(&self, id: &str) -> Result<(), StoreError>;
    /// Comparisons that entered `processing` before `started_before`.
    async fn list_stale_processing(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Comparison>, StoreError>;
}

/// Uploaded quote files and their bytes.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store file bytes, returning an opaque storage reference.
    async fn put_blob(&self, data: Vec<u8>, mime_type: &str) -> Result<String, StoreError>;
    async fn get_blob(&self, storage_ref: &str) -> Result<Option<Blob>, StoreError>;
    async fn add_document(&self, document: SourceDocument) -> Result<(), StoreError>;
    /// In upload order.
    async fn list_documents(&self, comparison_id: &str) -> Result<Vec<SourceDocument>, StoreError>;
    /// A URL the stored bytes can be fetched from, if they still exist.
    async fn resolve_url(&self, storage_ref: &str) -> Result<Option<String>, StoreError>;
}

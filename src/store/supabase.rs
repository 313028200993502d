//! Supabase-backed store: PostgREST tables plus Storage for document bytes.
//!
//! Status writes are compare-and-set PATCHes filtered on the current status,
//! so two racing runs cannot both leave `uploading`.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{ComparisonStore, ContactStore, DocumentStore};
use crate::config::SupabaseConfig;
use crate::error::StoreError;
use crate::schema::{
    new_id, Blob, Comparison, ComparisonResult, ComparisonStatus, Contact, ContactPatch,
    NewComparison, NewContact, SourceDocument, StatusKind, StatusUpdate,
};

/// Lifetime of signed document URLs handed to the extraction stage.
const SIGNED_URL_TTL_SECS: u64 = 3600;

#[derive(Clone)]
pub struct SupabaseStore {
    client: Client,
    base_url: String,
    service_role_key: String,
    bucket: String,
    schema: String,
}

fn backend(err: impl fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

impl SupabaseStore {
    pub fn new(config: &SupabaseConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.url.trim_end_matches('/').to_string(),
            service_role_key: config.service_role_key.clone(),
            bucket: config.bucket.clone(),
            schema: config.schema.clone(),
        }
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn object_url(&self, storage_ref: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url, self.bucket, storage_ref
        )
    }

    /// Fail on non-success, keeping the response body in the error.
    async fn check(resp: Response, what: &str) -> Result<Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(StoreError::Backend(format!(
            "Supabase {} failed: {} - {}",
            what, status, text
        )))
    }

    // ========================================================================
    // PostgREST helpers
    // ========================================================================

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, StoreError> {
        let resp = self
            .authed(self.client.get(self.rest_url(table)))
            .header("Accept-Profile", &self.schema)
            .query(query)
            .send()
            .await
            .map_err(backend)?;
        let resp = Self::check(resp, &format!("GET {}", table)).await?;
        resp.json().await.map_err(backend)
    }

    async fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        let rows: Vec<T> = self
            .select(table, &[("id", format!("eq.{}", id)), ("select", "*".into())])
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn insert<B: Serialize + ?Sized>(&self, table: &str, body: &B) -> Result<(), StoreError> {
        let resp = self
            .authed(self.client.post(self.rest_url(table)))
            .header("Content-Profile", &self.schema)
            .header("Prefer", "return=minimal")
            .json(body)
            .send()
            .await
            .map_err(backend)?;
        Self::check(resp, &format!("insert into {}", table)).await?;
        Ok(())
    }

    /// PATCH rows matching `query`, returning the rows that were changed.
    async fn update<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
        body: &Value,
    ) -> Result<Vec<T>, StoreError> {
        let resp = self
            .authed(self.client.patch(self.rest_url(table)))
            .header("Content-Profile", &self.schema)
            .header("Prefer", "return=representation")
            .query(query)
            .json(body)
            .send()
            .await
            .map_err(backend)?;
        let resp = Self::check(resp, &format!("update {}", table)).await?;
        resp.json().await.map_err(backend)
    }

    /// DELETE rows matching `query`, returning the rows that were removed.
    async fn remove<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, StoreError> {
        let resp = self
            .authed(self.client.delete(self.rest_url(table)))
            .header("Content-Profile", &self.schema)
            .header("Prefer", "return=representation")
            .query(query)
            .send()
            .await
            .map_err(backend)?;
        let resp = Self::check(resp, &format!("delete from {}", table)).await?;
        resp.json().await.map_err(backend)
    }

    /// Compare-and-set status write: only rows whose current status may move
    /// to `to` are touched.
    async fn transition(&self, id: &str, to: StatusKind, body: Value) -> Result<(), StoreError> {
        let query = [
            ("id", format!("eq.{}", id)),
            ("status", format!("in.({})", transition_sources(to).join(","))),
        ];
        let changed: Vec<ComparisonRow> = self.update("comparisons", &query, &body).await?;
        if !changed.is_empty() {
            debug!("Comparison {} -> {}", id, to);
            return Ok(());
        }

        match self.get_comparison(id).await? {
            Some(current) => Err(StoreError::InvalidTransition {
                from: current.state.kind(),
                to,
            }),
            None => Err(StoreError::not_found("comparison", id)),
        }
    }

    async fn delete_blobs(&self, refs: &[String]) -> Result<(), StoreError> {
        if refs.is_empty() {
            return Ok(());
        }
        let url = format!("{}/storage/v1/object/{}", self.base_url, self.bucket);
        let resp = self
            .authed(self.client.delete(url))
            .json(&json!({ "prefixes": refs }))
            .send()
            .await
            .map_err(backend)?;
        Self::check(resp, "storage delete").await?;
        debug!("Deleted {} stored files", refs.len());
        Ok(())
    }
}

/// Statuses a row may currently hold for a write to `to` to be accepted.
fn transition_sources(to: StatusKind) -> Vec<&'static str> {
    [
        StatusKind::Uploading,
        StatusKind::Processing,
        StatusKind::Completed,
        StatusKind::Failed,
    ]
    .into_iter()
    .filter(|from| from.can_transition_to(to))
    .map(StatusKind::as_str)
    .collect()
}

#[async_trait]
impl ContactStore for SupabaseStore {
    async fn create_contact(&self, user_id: &str, input: NewContact) -> Result<Contact, StoreError> {
        let contact = Contact::new(user_id, input);
        self.insert("contacts", &ContactRow::from(&contact)).await?;
        Ok(contact)
    }

    async fn get_contact(&self, id: &str) -> Result<Option<Contact>, StoreError> {
        let row: Option<ContactRow> = self.select_one("contacts", id).await?;
        Ok(row.map(Contact::from))
    }

    async fn list_contacts(&self, user_id: &str) -> Result<Vec<Contact>, StoreError> {
        let rows: Vec<ContactRow> = self
            .select(
                "contacts",
                &[
                    ("user_id", format!("eq.{}", user_id)),
                    ("order", "created_at.asc".into()),
                ],
            )
            .await?;
        Ok(rows.into_iter().map(Contact::from).collect())
    }

    async fn search_contacts(&self, user_id: &str, query: &str) -> Result<Vec<Contact>, StoreError> {
        let needle = query.trim();
        if needle.is_empty() {
            return self.list_contacts(user_id).await;
        }
        let rows: Vec<ContactRow> = self
            .select(
                "contacts",
                &[
                    ("user_id", format!("eq.{}", user_id)),
                    ("name", format!("ilike.*{}*", needle)),
                    ("order", "created_at.asc".into()),
                ],
            )
            .await?;
        Ok(rows.into_iter().map(Contact::from).collect())
    }

    async fn update_contact(&self, id: &str, patch: ContactPatch) -> Result<Contact, StoreError> {
        let body = serde_json::to_value(&patch).map_err(backend)?;
        let rows: Vec<ContactRow> = self
            .update("contacts", &[("id", format!("eq.{}", id))], &body)
            .await?;
        rows.into_iter()
            .next()
            .map(Contact::from)
            .ok_or_else(|| StoreError::not_found("contact", id))
    }

    async fn delete_contact(&self, id: &str) -> Result<(), StoreError> {
        let rows: Vec<Value> = self
            .remove("contacts", &[("id", format!("eq.{}", id))])
            .await?;
        if rows.is_empty() {
            return Err(StoreError::not_found("contact", id));
        }
        Ok(())
    }
}

#[async_trait]
impl ComparisonStore for SupabaseStore {
    async fn create_comparison(
        &self,
        user_id: &str,
        input: NewComparison,
    ) -> Result<Comparison, StoreError> {
        let comparison = Comparison::new(user_id, input);
        self.insert("comparisons", &ComparisonRow::from(&comparison))
            .await?;
        info!("Created comparison {}", comparison.id);
        Ok(comparison)
    }

    async fn get_comparison(&self, id: &str) -> Result<Option<Comparison>, StoreError> {
        let row: Option<ComparisonRow> = self.select_one("comparisons", id).await?;
        row.map(Comparison::try_from).transpose()
    }

    async fn list_comparisons(&self, user_id: &str) -> Result<Vec<Comparison>, StoreError> {
        let rows: Vec<ComparisonRow> = self
            .select(
                "comparisons",
                &[
                    ("user_id", format!("eq.{}", user_id)),
                    ("order", "created_at.desc".into()),
                ],
            )
            .await?;
        rows.into_iter().map(Comparison::try_from).collect()
    }

    async fn list_comparisons_by_contact(
        &self,
        contact_id: &str,
    ) -> Result<Vec<Comparison>, StoreError> {
        let rows: Vec<ComparisonRow> = self
            .select(
                "comparisons",
                &[
                    ("contact_id", format!("eq.{}", contact_id)),
                    ("order", "created_at.desc".into()),
                ],
            )
            .await?;
        rows.into_iter().map(Comparison::try_from).collect()
    }

    async fn set_status(&self, id: &str, update: StatusUpdate) -> Result<(), StoreError> {
        let to = update.kind();
        let body = match update {
            StatusUpdate::Processing => json!({
                "status": to,
                "started_at": Utc::now(),
            }),
            StatusUpdate::Failed { error } => json!({
                "status": to,
                "error": error,
                "failed_at": Utc::now(),
            }),
        };
        self.transition(id, to, body).await
    }

    async fn store_result(&self, id: &str, result: ComparisonResult) -> Result<(), StoreError> {
        let body = json!({
            "status": StatusKind::Completed,
            "result": result,
            "completed_at": Utc::now(),
        });
        self.transition(id, StatusKind::Completed, body).await
    }

    async fn delete_comparison(&self, id: &str) -> Result<(), StoreError> {
        if self.get_comparison(id).await?.is_none() {
            return Err(StoreError::not_found("comparison", id));
        }

        // Documents go before the parent row; blobs last.
        let removed: Vec<DocumentRow> = self
            .remove("documents", &[("comparison_id", format!("eq.{}", id))])
            .await?;
        let _: Vec<Value> = self
            .remove("comparisons", &[("id", format!("eq.{}", id))])
            .await?;

        let refs: Vec<String> = removed.into_iter().map(|d| d.storage_ref).collect();
        self.delete_blobs(&refs).await?;

        info!("Deleted comparison {} and {} documents", id, refs.len());
        Ok(())
    }

    async fn list_stale_processing(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Comparison>, StoreError> {
        let rows: Vec<ComparisonRow> = self
            .select(
                "comparisons",
                &[
                    ("status", "eq.processing".into()),
                    ("started_at", format!("lte.{}", started_before.to_rfc3339())),
                ],
            )
            .await?;
        rows.into_iter().map(Comparison::try_from).collect()
    }
}

#[async_trait]
impl DocumentStore for SupabaseStore {
    async fn put_blob(&self, data: Vec<u8>, mime_type: &str) -> Result<String, StoreError> {
        let storage_ref = new_id("blob");
        let size = data.len();
        let resp = self
            .authed(self.client.post(self.object_url(&storage_ref)))
            .header("Content-Type", mime_type)
            .body(data)
            .send()
            .await
            .map_err(backend)?;
        Self::check(resp, "storage upload").await?;
        debug!("Uploaded '{}' ({} bytes)", storage_ref, size);
        Ok(storage_ref)
    }

    async fn get_blob(&self, storage_ref: &str) -> Result<Option<Blob>, StoreError> {
        let resp = self
            .authed(self.client.get(self.object_url(storage_ref)))
            .send()
            .await
            .map_err(backend)?;
        // Storage answers 400 for missing objects as well as 404.
        if matches!(resp.status(), StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST) {
            return Ok(None);
        }
        let resp = Self::check(resp, "storage download").await?;
        let mime_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = resp.bytes().await.map_err(backend)?.to_vec();
        Ok(Some(Blob { data, mime_type }))
    }

    async fn add_document(&self, document: SourceDocument) -> Result<(), StoreError> {
        let comparison = self
            .get_comparison(&document.comparison_id)
            .await?
            .ok_or_else(|| StoreError::not_found("comparison", &document.comparison_id))?;
        let status = comparison.state.kind();
        if status != StatusKind::Uploading {
            return Err(StoreError::NotUploading { status });
        }
        self.insert("documents", &DocumentRow::from(&document)).await
    }

    async fn list_documents(&self, comparison_id: &str) -> Result<Vec<SourceDocument>, StoreError> {
        let rows: Vec<DocumentRow> = self
            .select(
                "documents",
                &[
                    ("comparison_id", format!("eq.{}", comparison_id)),
                    ("order", "uploaded_at.asc".into()),
                ],
            )
            .await?;
        Ok(rows.into_iter().map(SourceDocument::from).collect())
    }

    async fn resolve_url(&self, storage_ref: &str) -> Result<Option<String>, StoreError> {
        let url = format!(
            "{}/storage/v1/object/sign/{}/{}",
            self.base_url, self.bucket, storage_ref
        );
        let resp = self
            .authed(self.client.post(url))
            .json(&json!({ "expiresIn": SIGNED_URL_TTL_SECS }))
            .send()
            .await
            .map_err(backend)?;
        if matches!(resp.status(), StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST) {
            return Ok(None);
        }
        let resp = Self::check(resp, "storage sign").await?;
        let signed: SignedUrl = resp.json().await.map_err(backend)?;
        Ok(Some(format!("{}/storage/v1{}", self.base_url, signed.signed_url)))
    }
}

// ============================================================================
// Supabase row types
// ============================================================================

#[derive(Debug, Deserialize)]
struct SignedUrl {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContactRow {
    id: String,
    user_id: String,
    name: String,
    email: Option<String>,
    phone: Option<String>,
    company: Option<String>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<&Contact> for ContactRow {
    fn from(c: &Contact) -> Self {
        Self {
            id: c.id.clone(),
            user_id: c.user_id.clone(),
            name: c.name.clone(),
            email: c.email.clone(),
            phone: c.phone.clone(),
            company: c.company.clone(),
            notes: c.notes.clone(),
            created_at: c.created_at,
        }
    }
}

impl From<ContactRow> for Contact {
    fn from(r: ContactRow) -> Self {
        Self {
            id: r.id,
            user_id: r.user_id,
            name: r.name,
            email: r.email,
            phone: r.phone,
            company: r.company,
            notes: r.notes,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ComparisonRow {
    id: String,
    user_id: String,
    contact_id: String,
    title: String,
    insurance_type: Option<String>,
    status: StatusKind,
    #[serde(default)]
    result: Option<ComparisonResult>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    failed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<&Comparison> for ComparisonRow {
    fn from(c: &Comparison) -> Self {
        let mut row = Self {
            id: c.id.clone(),
            user_id: c.user_id.clone(),
            contact_id: c.contact_id.clone(),
            title: c.title.clone(),
            insurance_type: c.insurance_type.clone(),
            status: c.state.kind(),
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            created_at: c.created_at,
        };
        match &c.state {
            ComparisonStatus::Uploading => {}
            ComparisonStatus::Processing { started_at } => row.started_at = Some(*started_at),
            ComparisonStatus::Completed {
                result,
                completed_at,
            } => {
                row.result = Some(result.clone());
                row.completed_at = Some(*completed_at);
            }
            ComparisonStatus::Failed { error, failed_at } => {
                row.error = Some(error.clone());
                row.failed_at = Some(*failed_at);
            }
        }
        row
    }
}

impl TryFrom<ComparisonRow> for Comparison {
    type Error = StoreError;

    fn try_from(r: ComparisonRow) -> Result<Self, StoreError> {
        // Rows written before a timestamp column existed fall back to creation time.
        let state = match r.status {
            StatusKind::Uploading => ComparisonStatus::Uploading,
            StatusKind::Processing => ComparisonStatus::Processing {
                started_at: r.started_at.unwrap_or(r.created_at),
            },
            StatusKind::Completed => ComparisonStatus::Completed {
                result: r.result.ok_or_else(|| {
                    StoreError::Backend(format!("completed comparison {} has no result", r.id))
                })?,
                completed_at: r.completed_at.unwrap_or(r.created_at),
            },
            StatusKind::Failed => ComparisonStatus::Failed {
                error: r.error.unwrap_or_default(),
                failed_at: r.failed_at.unwrap_or(r.created_at),
            },
        };
        Ok(Self {
            id: r.id,
            user_id: r.user_id,
            contact_id: r.contact_id,
            title: r.title,
            insurance_type: r.insurance_type,
            state,
            created_at: r.created_at,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DocumentRow {
    id: String,
    comparison_id: String,
    file_name: String,
    storage_ref: String,
    mime_type: String,
    size_bytes: u64,
    content_hash: String,
    page_count: Option<u32>,
    uploaded_at: DateTime<Utc>,
}

impl From<&SourceDocument> for DocumentRow {
    fn from(d: &SourceDocument) -> Self {
        Self {
            id: d.id.clone(),
            comparison_id: d.comparison_id.clone(),
            file_name: d.file_name.clone(),
            storage_ref: d.storage_ref.clone(),
            mime_type: d.mime_type.clone(),
            size_bytes: d.size_bytes,
            content_hash: d.content_hash.clone(),
            page_count: d.page_count,
            uploaded_at: d.uploaded_at,
        }
    }
}

impl From<DocumentRow> for SourceDocument {
    fn from(r: DocumentRow) -> Self {
        Self {
            id: r.id,
            comparison_id: r.comparison_id,
            file_name: r.file_name,
            storage_ref: r.storage_ref,
            mime_type: r.mime_type,
            size_bytes: r.size_bytes,
            content_hash: r.content_hash,
            page_count: r.page_count,
            uploaded_at: r.uploaded_at,
        }
    }
}

//! HTTP surface: contacts, comparisons, document upload, processing and export.

use std::io::Cursor;
use std::sync::Arc;

use axum::{
    async_trait,
    extract::{DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::ApiError;
use crate::export::{email_subject, export_document, render_body, render_markdown};
use crate::fetch::DocumentFetcher;
use crate::gemini::ModelProvider;
use crate::pipeline::QuoteProcessor;
use crate::schema::{
    new_id, Comparison, ComparisonResult, Contact, ContactPatch, NewComparison, NewContact,
    SourceDocument, StatusKind,
};
use crate::store::{ComparisonStore, ContactStore, DocumentStore};

/// Header carrying the authenticated user id, set by the upstream auth proxy.
pub const USER_HEADER: &str = "x-user-id";

const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub contacts: Arc<dyn ContactStore>,
    pub comparisons: Arc<dyn ComparisonStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub processor: QuoteProcessor,
}

impl AppState {
    pub fn from_store<S>(
        store: Arc<S>,
        fetcher: Arc<dyn DocumentFetcher>,
        provider: Option<Arc<dyn ModelProvider>>,
        pipeline: &PipelineConfig,
    ) -> Self
    where
        S: ContactStore + ComparisonStore + DocumentStore + 'static,
    {
        let contacts: Arc<dyn ContactStore> = store.clone();
        let comparisons: Arc<dyn ComparisonStore> = store.clone();
        let documents: Arc<dyn DocumentStore> = store;
        let processor = QuoteProcessor::new(
            comparisons.clone(),
            documents.clone(),
            fetcher,
            provider,
            pipeline,
        );
        Self {
            contacts,
            comparisons,
            documents,
            processor,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/contacts", get(list_contacts).post(create_contact))
        .route("/contacts/search", get(search_contacts))
        .route(
            "/contacts/:id",
            get(get_contact).patch(update_contact).delete(delete_contact),
        )
        .route("/contacts/:id/comparisons", get(contact_comparisons))
        .route("/comparisons", get(list_comparisons).post(create_comparison))
        .route(
            "/comparisons/:id",
            get(get_comparison).delete(delete_comparison),
        )
        .route(
            "/comparisons/:id/documents",
            get(list_documents).post(upload_document),
        )
        .route("/comparisons/:id/process", post(process_comparison))
        .route("/comparisons/:id/email", get(comparison_email))
        .route("/comparisons/:id/export", get(export_comparison))
        .route("/files/:storage_ref", get(get_file))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// The caller's user id.
pub struct CurrentUser(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| CurrentUser(v.to_string()))
            .ok_or(ApiError::Unauthorized)
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> &'static str {
    "ok"
}

// Contacts

async fn list_contacts(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Vec<Contact>>, ApiError> {
    Ok(Json(state.contacts.list_contacts(&user).await?))
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
}

async fn search_contacts(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<Contact>>, ApiError> {
    Ok(Json(state.contacts.search_contacts(&user, &query.q).await?))
}

async fn create_contact(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(mut input): Json<NewContact>,
) -> Result<(StatusCode, Json<Contact>), ApiError> {
    input.name = required("name", &input.name)?;
    let contact = state.contacts.create_contact(&user, input).await?;
    info!("Created contact {}", contact.id);
    Ok((StatusCode::CREATED, Json(contact)))
}

async fn get_contact(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<Contact>, ApiError> {
    Ok(Json(owned_contact(&state, &user, &id).await?))
}

async fn update_contact(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
    Json(mut patch): Json<ContactPatch>,
) -> Result<Json<Contact>, ApiError> {
    owned_contact(&state, &user, &id).await?;
    if let Some(name) = &patch.name {
        patch.name = Some(required("name", name)?);
    }
    Ok(Json(state.contacts.update_contact(&id, patch).await?))
}

async fn delete_contact(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    owned_contact(&state, &user, &id).await?;
    state.contacts.delete_contact(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn contact_comparisons(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<Comparison>>, ApiError> {
    owned_contact(&state, &user, &id).await?;
    let comparisons = state
        .comparisons
        .list_comparisons_by_contact(&id)
        .await?
        .into_iter()
        .filter(|c| c.user_id == user)
        .collect();
    Ok(Json(comparisons))
}

// Comparisons

async fn list_comparisons(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Vec<Comparison>>, ApiError> {
    Ok(Json(state.comparisons.list_comparisons(&user).await?))
}

async fn create_comparison(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(mut input): Json<NewComparison>,
) -> Result<(StatusCode, Json<Comparison>), ApiError> {
    input.title = required("title", &input.title)?;
    owned_contact(&state, &user, &input.contact_id).await?;
    let comparison = state.comparisons.create_comparison(&user, input).await?;
    Ok((StatusCode::CREATED, Json(comparison)))
}

#[derive(Serialize)]
struct ComparisonDetail {
    #[serde(flatten)]
    comparison: Comparison,
    documents: Vec<SourceDocument>,
}

async fn get_comparison(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<ComparisonDetail>, ApiError> {
    let comparison = owned_comparison(&state, &user, &id).await?;
    let documents = state.documents.list_documents(&id).await?;
    Ok(Json(ComparisonDetail {
        comparison,
        documents,
    }))
}

async fn delete_comparison(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    owned_comparison(&state, &user, &id).await?;
    state.comparisons.delete_comparison(&id).await?;
    info!("Deleted comparison {}", id);
    Ok(StatusCode::NO_CONTENT)
}

// Documents

async fn list_documents(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<SourceDocument>>, ApiError> {
    owned_comparison(&state, &user, &id).await?;
    Ok(Json(state.documents.list_documents(&id).await?))
}

/// Upload one quote file (multipart field `file`).
async fn upload_document(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SourceDocument>), ApiError> {
    let comparison = owned_comparison(&state, &user, &id).await?;
    if comparison.state.kind() != StatusKind::Uploading {
        return Err(ApiError::Conflict(format!(
            "Documents can only be added while uploading (comparison is {})",
            comparison.state.kind()
        )));
    }

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Multipart error: {}", e)))?
    {
        if field.name() == Some("file") {
            let file_name = field.file_name().unwrap_or("document").to_string();
            let declared = field.content_type().map(str::to_string);
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(format!("Failed to read file: {}", e)))?;
            upload = Some((file_name, declared, data.to_vec()));
            break;
        }
    }

    let Some((file_name, declared, data)) = upload else {
        return Err(ApiError::BadRequest("No file uploaded".to_string()));
    };
    if data.is_empty() {
        return Err(ApiError::BadRequest(format!("{} is empty", file_name)));
    }

    let mime_type = detect_mime(&file_name, declared.as_deref()).ok_or_else(|| {
        ApiError::BadRequest(format!(
            "Unsupported file type for {}. Accepted: PDF, PNG, JPEG, WEBP",
            file_name
        ))
    })?;

    let page_count = if mime_type == "application/pdf" {
        Some(pdf_page_count(&data).map_err(|e| {
            ApiError::BadRequest(format!("{} is not a readable PDF: {}", file_name, e))
        })?)
    } else {
        None
    };

    let content_hash = format!("{:x}", Sha256::digest(&data));
    let size_bytes = data.len() as u64;
    let storage_ref = state.documents.put_blob(data, mime_type).await?;

    let document = SourceDocument {
        id: new_id("doc"),
        comparison_id: id,
        file_name,
        storage_ref,
        mime_type: mime_type.to_string(),
        size_bytes,
        content_hash,
        page_count,
        uploaded_at: Utc::now(),
    };
    state.documents.add_document(document.clone()).await?;

    info!(
        "Uploaded {} ({} bytes, {}) to comparison {}",
        document.file_name, document.size_bytes, document.mime_type, document.comparison_id
    );
    Ok((StatusCode::CREATED, Json(document)))
}

// Processing

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ProcessRequest {
    #[serde(default)]
    client_name: Option<String>,
}

/// Run the pipeline and wait for it to finish.
///
/// The run is spawned onto its own task so a dropped connection cannot
/// cancel it between the `processing` write and the terminal write.
async fn process_comparison(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
    body: Option<Json<ProcessRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let comparison = owned_comparison(&state, &user, &id).await?;
    let request = body.map(|Json(b)| b).unwrap_or_default();

    let client_name = match request.client_name.filter(|n| !n.trim().is_empty()) {
        Some(name) => name,
        None => state
            .contacts
            .get_contact(&comparison.contact_id)
            .await?
            .map(|c| c.name)
            .ok_or_else(|| ApiError::BadRequest("clientName is required".to_string()))?,
    };

    let processor = state.processor.clone();
    let run = tokio::spawn(async move { processor.process_quotes(&id, &client_name).await });
    run.await
        .map_err(|e| ApiError::Internal(format!("Processing task failed: {}", e)))??;

    Ok(Json(json!({ "success": true })))
}

// Export

#[derive(Serialize)]
struct EmailDraft {
    subject: String,
    body: String,
}

async fn comparison_email(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<EmailDraft>, ApiError> {
    let comparison = owned_comparison(&state, &user, &id).await?;
    let result = completed_result(&comparison)?;
    Ok(Json(EmailDraft {
        subject: email_subject(&comparison.title),
        body: render_body(result),
    }))
}

#[derive(Deserialize)]
struct ExportQuery {
    #[serde(default)]
    format: Option<String>,
}

async fn export_comparison(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let comparison = owned_comparison(&state, &user, &id).await?;
    let result = completed_result(&comparison)?;
    let contact_name = state
        .contacts
        .get_contact(&comparison.contact_id)
        .await?
        .map(|c| c.name)
        .unwrap_or_default();
    let today = Utc::now().date_naive();

    match query.format.as_deref().unwrap_or("markdown") {
        "markdown" => {
            let markdown = render_markdown(&comparison.title, &contact_name, result, today);
            Ok((
                [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
                markdown,
            )
                .into_response())
        }
        "blocks" => Ok(Json(export_document(&comparison.title, &contact_name, result, today))
            .into_response()),
        other => Err(ApiError::BadRequest(format!(
            "Unknown export format: {}. Available: markdown, blocks",
            other
        ))),
    }
}

// Files

/// Serve stored bytes. Storage refs are unguessable, so no identity is
/// required; the extraction stage fetches through here.
async fn get_file(
    State(state): State<AppState>,
    Path(storage_ref): Path<String>,
) -> Result<Response, ApiError> {
    let blob = state
        .documents
        .get_blob(&storage_ref)
        .await?
        .ok_or(ApiError::NotFound("File"))?;
    Ok(([(header::CONTENT_TYPE, blob.mime_type)], blob.data).into_response())
}

// ============================================================================
// Helper functions
// ============================================================================

fn required(field: &str, value: &str) -> Result<String, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ApiError::BadRequest(format!("{} is required", field)));
    }
    Ok(value.to_string())
}

async fn owned_contact(state: &AppState, user: &str, id: &str) -> Result<Contact, ApiError> {
    match state.contacts.get_contact(id).await? {
        Some(contact) if contact.user_id == user => Ok(contact),
        Some(_) => {
            warn!("User {} denied access to contact {}", user, id);
            Err(ApiError::NotFound("Contact"))
        }
        None => Err(ApiError::NotFound("Contact")),
    }
}

async fn owned_comparison(state: &AppState, user: &str, id: &str) -> Result<Comparison, ApiError> {
    match state.comparisons.get_comparison(id).await? {
        Some(comparison) if comparison.user_id == user => Ok(comparison),
        Some(_) => {
            warn!("User {} denied access to comparison {}", user, id);
            Err(ApiError::NotFound("Comparison"))
        }
        None => Err(ApiError::NotFound("Comparison")),
    }
}

fn completed_result(comparison: &Comparison) -> Result<&ComparisonResult, ApiError> {
    comparison.result().ok_or_else(|| {
        ApiError::Conflict(format!(
            "Comparison is {}, no result available",
            comparison.state.kind()
        ))
    })
}

/// Accepted upload type, from the declared content type or the extension.
fn detect_mime(file_name: &str, declared: Option<&str>) -> Option<&'static str> {
    let normalize = |mime: &str| match mime.trim().to_ascii_lowercase().as_str() {
        "application/pdf" => Some("application/pdf"),
        "image/png" => Some("image/png"),
        "image/jpeg" | "image/jpg" => Some("image/jpeg"),
        "image/webp" => Some("image/webp"),
        _ => None,
    };

    if let Some(mime) = declared.and_then(normalize) {
        return Some(mime);
    }

    let extension = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
    match extension.as_str() {
        "pdf" => Some("application/pdf"),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Load a PDF with lopdf, returning its page count.
fn pdf_page_count(data: &[u8]) -> anyhow::Result<u32> {
    let doc = lopdf::Document::load_from(Cursor::new(data))
        .map_err(|e| anyhow::anyhow!("Failed to load PDF: {}", e))?;
    let pages = doc.get_pages().len();
    if pages == 0 {
        anyhow::bail!("PDF has no pages");
    }
    Ok(pages as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::testing::{wrapped, ScriptedModel, StoreFetcher};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "quote-compare-boundary";

    fn app(model: Option<Arc<ScriptedModel>>) -> Router {
        let store = MemoryStore::new("http://localhost:3000");
        let pipeline = PipelineConfig {
            pacing: Duration::ZERO,
            ..Default::default()
        };
        let state = AppState::from_store(
            Arc::new(store.clone()),
            Arc::new(StoreFetcher { store }),
            model.map(|m| m as Arc<dyn ModelProvider>),
            &pipeline,
        );
        router(state)
    }

    fn request(method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user);
        }
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    fn upload(uri: &str, user: &str, file_name: &str, mime: &str, data: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: {mime}\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(USER_HEADER, user)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn seed(app: &Router, user: &str) -> (String, String) {
        let (_, contact) = send(
            app,
            request("POST", "/contacts", Some(user), Some(json!({"name": "Jane Doe"}))),
        )
        .await;
        let contact_id = contact["id"].as_str().unwrap().to_string();
        let (_, comparison) = send(
            app,
            request(
                "POST",
                "/comparisons",
                Some(user),
                Some(json!({"contactId": contact_id, "title": "Motor renewal"})),
            ),
        )
        .await;
        (contact_id, comparison["id"].as_str().unwrap().to_string())
    }

    fn comparison_reply() -> Result<String, crate::error::ProviderError> {
        wrapped(
            &json!({
                "summary": "Beta is cheaper.",
                "premiumComparison": {"items": [], "cheapest": "Beta"},
                "recommendation": "Beta.",
                "emailDraft": "Dear Jane Doe,\n\n**Premiums**\n\n| Insurer | Monthly |\n|---|---|\n| Beta | R450 |"
            })
            .to_string(),
        )
    }

    #[tokio::test]
    async fn test_requests_without_identity_are_rejected() {
        let app = app(None);
        let (status, body) = send(&app, request("GET", "/contacts", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Not authenticated");

        let (status, _) = send(&app, request("GET", "/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_contacts_crud_and_search() {
        let app = app(None);
        let (contact_id, _) = seed(&app, "u1").await;
        send(&app, request("POST", "/contacts", Some("u1"), Some(json!({"name": "Pieter"})))).await;

        let (status, found) = send(&app, request("GET", "/contacts/search?q=jane", Some("u1"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(found.as_array().unwrap().len(), 1);

        let (status, updated) = send(
            &app,
            request(
                "PATCH",
                &format!("/contacts/{}", contact_id),
                Some("u1"),
                Some(json!({"email": "jane@example.com"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["email"], "jane@example.com");
        assert_eq!(updated["name"], "Jane Doe");

        let (status, comparisons) = send(
            &app,
            request("GET", &format!("/contacts/{}/comparisons", contact_id), Some("u1"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(comparisons.as_array().unwrap().len(), 1);

        let (status, _) = send(&app, request("DELETE", &format!("/contacts/{}", contact_id), Some("u1"), None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_blank_names_are_rejected() {
        let app = app(None);
        let (status, body) = send(&app, request("POST", "/contacts", Some("u1"), Some(json!({"name": "  "})))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "name is required");
    }

    #[tokio::test]
    async fn test_foreign_records_are_not_found() {
        let app = app(None);
        let (contact_id, comparison_id) = seed(&app, "u1").await;

        let (status, _) = send(&app, request("GET", &format!("/contacts/{}", contact_id), Some("u2"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, request("GET", &format!("/comparisons/{}", comparison_id), Some("u2"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app,
            request(
                "POST",
                "/comparisons",
                Some("u2"),
                Some(json!({"contactId": contact_id, "title": "Steal"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upload_validation() {
        let app = app(None);
        let (_, comparison_id) = seed(&app, "u1").await;
        let uri = format!("/comparisons/{}/documents", comparison_id);

        let (status, _) = send(&app, upload(&uri, "u1", "notes.txt", "text/plain", b"hello")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, upload(&uri, "u1", "broken.pdf", "application/pdf", b"not a pdf")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("not a readable PDF"));

        let (status, doc) = send(&app, upload(&uri, "u1", "quote.png", "application/octet-stream", b"\x89PNG")).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(doc["mimeType"], "image/png");
        assert_eq!(doc["sizeBytes"], 4);
        assert_eq!(doc["contentHash"].as_str().unwrap().len(), 64);

        let (_, docs) = send(&app, request("GET", &uri, Some("u1"), None)).await;
        assert_eq!(docs.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_flow_to_export() {
        let model = Arc::new(ScriptedModel::new(vec![
            wrapped(r#"{"insurerName": "Alpha"}"#),
            wrapped(r#"{"insurerName": "Beta"}"#),
            comparison_reply(),
        ]));
        let app = app(Some(model.clone()));
        let (_, comparison_id) = seed(&app, "u1").await;
        let uri = format!("/comparisons/{}/documents", comparison_id);
        send(&app, upload(&uri, "u1", "alpha.png", "image/png", b"alpha")).await;
        send(&app, upload(&uri, "u1", "beta.jpg", "image/jpg", b"beta")).await;

        let (status, body) = send(
            &app,
            request("POST", &format!("/comparisons/{}/process", comparison_id), Some("u1"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true}));
        assert_eq!(model.calls(), 3);

        let (_, comparison) = send(&app, request("GET", &format!("/comparisons/{}", comparison_id), Some("u1"), None)).await;
        assert_eq!(comparison["status"], "completed");
        assert_eq!(comparison["result"]["summary"], "Beta is cheaper.");
        assert_eq!(comparison["documents"].as_array().unwrap().len(), 2);

        let (status, email) = send(&app, request("GET", &format!("/comparisons/{}/email", comparison_id), Some("u1"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(email["subject"], "Insurance quote comparison: Motor renewal");
        assert!(email["body"].as_str().unwrap().starts_with("Dear Jane Doe"));

        let (status, export) = send(
            &app,
            request("GET", &format!("/comparisons/{}/export?format=blocks", comparison_id), Some("u1"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(export["fileName"], "Motor_renewal_comparison.pdf");
        let blocks = export["blocks"].as_array().unwrap();
        assert_eq!(blocks[1], json!({"type": "heading", "level": 3, "text": "Premiums"}));
        assert_eq!(blocks[2]["type"], "table");

        let response = app
            .clone()
            .oneshot(request("GET", &format!("/comparisons/{}/export", comparison_id), Some("u1"), None))
            .await
            .unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/markdown; charset=utf-8");

        // Completed comparisons accept no more documents or runs.
        let (status, _) = send(&app, upload(&uri, "u1", "late.png", "image/png", b"late")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = send(
            &app,
            request("POST", &format!("/comparisons/{}/process", comparison_id), Some("u1"), None),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_process_with_one_document_fails_comparison() {
        let model = Arc::new(ScriptedModel::default());
        let app = app(Some(model.clone()));
        let (_, comparison_id) = seed(&app, "u1").await;
        send(
            &app,
            upload(&format!("/comparisons/{}/documents", comparison_id), "u1", "a.png", "image/png", b"a"),
        )
        .await;

        let (status, body) = send(
            &app,
            request(
                "POST",
                &format!("/comparisons/{}/process", comparison_id),
                Some("u1"),
                Some(json!({"clientName": "Jane"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("At least 2 documents"));
        assert_eq!(model.calls(), 0);

        let (_, comparison) = send(&app, request("GET", &format!("/comparisons/{}", comparison_id), Some("u1"), None)).await;
        assert_eq!(comparison["status"], "failed");
        assert!(comparison.get("result").is_none());

        let (status, _) = send(&app, request("GET", &format!("/comparisons/{}/email", comparison_id), Some("u1"), None)).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_process_without_credential() {
        let app = app(None);
        let (_, comparison_id) = seed(&app, "u1").await;

        let (status, body) = send(
            &app,
            request("POST", &format!("/comparisons/{}/process", comparison_id), Some("u1"), None),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "GEMINI_API_KEY not configured");
    }

    #[tokio::test]
    async fn test_delete_comparison() {
        let app = app(None);
        let (_, comparison_id) = seed(&app, "u1").await;
        let (_, doc) = send(
            &app,
            upload(&format!("/comparisons/{}/documents", comparison_id), "u1", "a.png", "image/png", b"a"),
        )
        .await;
        let file_uri = format!("/files/{}", doc["storageRef"].as_str().unwrap());

        let response = app.clone().oneshot(request("GET", &file_uri, None, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");

        let (status, _) = send(&app, request("DELETE", &format!("/comparisons/{}", comparison_id), Some("u1"), None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(&app, request("GET", &format!("/comparisons/{}", comparison_id), Some("u1"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, request("GET", &file_uri, None, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_detect_mime() {
        assert_eq!(detect_mime("a.pdf", Some("application/pdf")), Some("application/pdf"));
        assert_eq!(detect_mime("a.bin", Some("image/jpg")), Some("image/jpeg"));
        assert_eq!(detect_mime("scan.JPEG", Some("application/octet-stream")), Some("image/jpeg"));
        assert_eq!(detect_mime("scan.webp", None), Some("image/webp"));
        assert_eq!(detect_mime("notes.txt", Some("text/plain")), None);
        assert_eq!(detect_mime("README", None), None);
    }
}

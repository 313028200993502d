//! Test doubles for the model provider and document fetching.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::error::ProviderError;
use crate::fetch::DocumentFetcher;
use crate::gemini::{ModelProvider, PromptPart};
use crate::schema::{new_id, Comparison, NewComparison, SourceDocument};
use crate::store::memory::MemoryStore;
use crate::store::{ComparisonStore, DocumentStore};

/// Replays queued responses in order and records every prompt it receives.
#[derive(Default)]
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<Vec<PromptPart>>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<Vec<PromptPart>> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedModel {
    async fn generate(&self, parts: &[PromptPart]) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(parts.to_vec());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::transport("script exhausted")))
    }
}

/// Serves `/files/{storage_ref}` URLs straight out of a `MemoryStore`.
pub struct StoreFetcher {
    pub store: MemoryStore,
}

#[async_trait]
impl DocumentFetcher for StoreFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let (_, storage_ref) = url
            .rsplit_once("/files/")
            .ok_or_else(|| anyhow!("unexpected url {}", url))?;
        let blob = self
            .store
            .get_blob(storage_ref)
            .await?
            .ok_or_else(|| anyhow!("no blob at {}", url))?;
        Ok(blob.data)
    }
}

pub fn rate_limited() -> ProviderError {
    ProviderError::http(429, "Gemini API error (429 Too Many Requests): RESOURCE_EXHAUSTED")
}

/// A model reply wrapping `json` in the kind of prose Gemini tends to add.
pub fn wrapped(json: &str) -> Result<String, ProviderError> {
    Ok(format!("Here is the result:\n```json\n{}\n```", json))
}

/// An `uploading` comparison with `docs` stored PDF documents.
pub async fn seed_comparison(store: &MemoryStore, docs: usize) -> Comparison {
    let comparison = store
        .create_comparison(
            "user_1",
            NewComparison {
                contact_id: "ctc_1".to_string(),
                title: "Motor renewal".to_string(),
                insurance_type: Some("motor".to_string()),
            },
        )
        .await
        .unwrap();

    for i in 0..docs {
        let data = format!("%PDF-1.4 quote {}", i + 1).into_bytes();
        let storage_ref = store.put_blob(data.clone(), "application/pdf").await.unwrap();
        add_document(store, &comparison.id, &format!("quote-{}.pdf", i + 1), &storage_ref, data.len())
            .await;
    }
    comparison
}

/// Register a document row without checking that its bytes exist.
pub async fn add_document(
    store: &MemoryStore,
    comparison_id: &str,
    file_name: &str,
    storage_ref: &str,
    size: usize,
) {
    store
        .add_document(SourceDocument {
            id: new_id("doc"),
            comparison_id: comparison_id.to_string(),
            file_name: file_name.to_string(),
            storage_ref: storage_ref.to_string(),
            mime_type: "application/pdf".to_string(),
            size_bytes: size as u64,
            content_hash: String::new(),
            page_count: Some(1),
            uploaded_at: Utc::now(),
        })
        .await
        .unwrap();
}

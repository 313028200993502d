//! Extraction stage: one model call per quote document.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::encoding::encode_document;
use crate::error::{PipelineError, SanitizeError};
use crate::fetch::DocumentFetcher;
use crate::gemini::{PromptPart, RetryingModel};
use crate::prompts::EXTRACTION_PROMPT;
use crate::sanitize::parse_model_json;
use crate::schema::{ExtractedQuote, QuoteData, SourceDocument};
use crate::store::DocumentStore;

/// Fewest documents a comparison can be run with.
pub const MIN_DOCUMENTS: usize = 2;

pub struct Extractor {
    model: RetryingModel,
    documents: Arc<dyn DocumentStore>,
    fetcher: Arc<dyn DocumentFetcher>,
    pacing: Duration,
}

impl Extractor {
    pub fn new(
        model: RetryingModel,
        documents: Arc<dyn DocumentStore>,
        fetcher: Arc<dyn DocumentFetcher>,
        pacing: Duration,
    ) -> Self {
        Self {
            model,
            documents,
            fetcher,
            pacing,
        }
    }

    /// Extract every document in order. The first failure aborts the stage;
    /// nothing after it is attempted.
    pub async fn extract_all(
        &self,
        documents: &[SourceDocument],
    ) -> Result<Vec<ExtractedQuote>, PipelineError> {
        if documents.len() < MIN_DOCUMENTS {
            return Err(PipelineError::InsufficientDocuments {
                found: documents.len(),
            });
        }

        let mut quotes = Vec::with_capacity(documents.len());
        for (i, document) in documents.iter().enumerate() {
            if i > 0 {
                debug!("Pacing {}ms before next document", self.pacing.as_millis());
                tokio::time::sleep(self.pacing).await;
            }
            info!(
                "Extracting {} ({}/{})",
                document.file_name,
                i + 1,
                documents.len()
            );
            quotes.push(self.extract_one(document).await?);
        }

        Ok(quotes)
    }

    async fn extract_one(&self, document: &SourceDocument) -> Result<ExtractedQuote, PipelineError> {
        let url = self
            .documents
            .resolve_url(&document.storage_ref)
            .await?
            .ok_or_else(|| PipelineError::StorageResolution {
                file_name: document.file_name.clone(),
            })?;

        let bytes = self
            .fetcher
            .fetch(&url)
            .await
            .map_err(|e| PipelineError::Download {
                file_name: document.file_name.clone(),
                message: format!("{:#}", e),
            })?;

        let encoded = encode_document(&bytes);
        debug!(
            "Encoded {} ({} bytes -> {} chars)",
            document.file_name,
            bytes.len(),
            encoded.len()
        );

        let parts = [
            PromptPart::text(EXTRACTION_PROMPT),
            PromptPart::inline(&document.mime_type, encoded),
        ];
        let text = self.model.invoke(&parts).await?;

        let value: Value = parse_model_json(&text).map_err(|e| match e {
            SanitizeError::NoJsonObject => PipelineError::ExtractionFormat {
                file_name: document.file_name.clone(),
            },
            SanitizeError::Parse(e) => PipelineError::Parse(e),
        })?;
        let data = QuoteData::from_model_output(value).map_err(PipelineError::Parse)?;

        Ok(ExtractedQuote {
            file_name: document.file_name.clone(),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::ModelProvider;
    use crate::retry::RetryPolicy;
    use crate::store::memory::MemoryStore;
    use crate::testing::{add_document, seed_comparison, wrapped, ScriptedModel, StoreFetcher};
    use tokio::time::Instant;

    const PACING: Duration = Duration::from_millis(3000);

    fn extractor(store: &MemoryStore, model: Arc<ScriptedModel>) -> Extractor {
        let provider: Arc<dyn ModelProvider> = model;
        Extractor::new(
            RetryingModel::new(provider, RetryPolicy::default()),
            Arc::new(store.clone()),
            Arc::new(StoreFetcher {
                store: store.clone(),
            }),
            PACING,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_extracts_in_order_with_pacing() {
        let store = MemoryStore::new("http://localhost:3000");
        let comparison = seed_comparison(&store, 3).await;
        let documents = store.list_documents(&comparison.id).await.unwrap();
        let model = Arc::new(ScriptedModel::new(vec![
            wrapped(r#"{"insurerName": "Alpha"}"#),
            wrapped(r#"{"insurerName": "Beta"}"#),
            wrapped(r#"{"insurerName": "Gamma"}"#),
        ]));
        let started = Instant::now();

        let quotes = extractor(&store, model.clone())
            .extract_all(&documents)
            .await
            .unwrap();

        let insurers: Vec<_> = quotes
            .iter()
            .map(|q| q.data.insurer_name.clone().unwrap())
            .collect();
        assert_eq!(insurers, vec!["Alpha", "Beta", "Gamma"]);
        assert_eq!(quotes[0].file_name, "quote-1.pdf");
        assert_eq!(started.elapsed(), PACING * 2);
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_carries_document_inline() {
        let store = MemoryStore::new("http://localhost:3000");
        let comparison = seed_comparison(&store, 2).await;
        let documents = store.list_documents(&comparison.id).await.unwrap();
        let model = Arc::new(ScriptedModel::new(vec![
            wrapped("{}"),
            wrapped("{}"),
        ]));

        extractor(&store, model.clone())
            .extract_all(&documents)
            .await
            .unwrap();

        let prompt = &model.prompts()[0];
        assert_eq!(prompt[0], PromptPart::text(EXTRACTION_PROMPT));
        assert_eq!(
            prompt[1],
            PromptPart::inline("application/pdf", encode_document(b"%PDF-1.4 quote 1"))
        );
    }

    #[tokio::test]
    async fn test_single_document_makes_no_calls() {
        let store = MemoryStore::new("http://localhost:3000");
        let comparison = seed_comparison(&store, 1).await;
        let documents = store.list_documents(&comparison.id).await.unwrap();
        let model = Arc::new(ScriptedModel::default());

        let err = extractor(&store, model.clone())
            .extract_all(&documents)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::InsufficientDocuments { found: 1 }));
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_bytes_short_circuit() {
        let store = MemoryStore::new("http://localhost:3000");
        let comparison = seed_comparison(&store, 1).await;
        add_document(&store, &comparison.id, "lost.pdf", "blob_gone", 10).await;
        add_document(&store, &comparison.id, "never.pdf", "blob_never", 10).await;
        let documents = store.list_documents(&comparison.id).await.unwrap();
        let model = Arc::new(ScriptedModel::new(vec![wrapped("{}"), wrapped("{}")]));

        let err = extractor(&store, model.clone())
            .extract_all(&documents)
            .await
            .unwrap_err();

        match err {
            PipelineError::StorageResolution { file_name } => assert_eq!(file_name, "lost.pdf"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_without_object_names_the_file() {
        let store = MemoryStore::new("http://localhost:3000");
        let comparison = seed_comparison(&store, 2).await;
        let documents = store.list_documents(&comparison.id).await.unwrap();
        let model = Arc::new(ScriptedModel::new(vec![Ok(
            "Sorry, I cannot read this document.".to_string()
        )]));

        let err = extractor(&store, model)
            .extract_all(&documents)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Failed to extract data from quote-1.pdf");
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_newlines_in_reply_are_kept() {
        let store = MemoryStore::new("http://localhost:3000");
        let comparison = seed_comparison(&store, 2).await;
        let documents = store.list_documents(&comparison.id).await.unwrap();
        let model = Arc::new(ScriptedModel::new(vec![
            wrapped("{\"additionalNotes\": \"line1\nline2\"}"),
            wrapped("{}"),
        ]));

        let quotes = extractor(&store, model)
            .extract_all(&documents)
            .await
            .unwrap();

        assert_eq!(
            quotes[0].data.additional_notes.as_deref(),
            Some("line1\nline2")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_scalar_premium_and_excess_are_kept_raw() {
        let store = MemoryStore::new("http://localhost:3000");
        let comparison = seed_comparison(&store, 2).await;
        let documents = store.list_documents(&comparison.id).await.unwrap();
        let model = Arc::new(ScriptedModel::new(vec![
            wrapped(r#"{"insurerName":"Alpha","premium":"R450 per month","excess":"R5,000 basic"}"#),
            wrapped(r#"{"insurerName":"Beta","premium":{"monthly":520}}"#),
        ]));

        let quotes = extractor(&store, model)
            .extract_all(&documents)
            .await
            .unwrap();

        let alpha = &quotes[0].data;
        assert_eq!(alpha.insurer_name.as_deref(), Some("Alpha"));
        assert!(alpha.premium.is_none());
        assert!(alpha.excess.is_none());
        assert_eq!(alpha.extra["premium"], "R450 per month");
        assert_eq!(alpha.extra["excess"], "R5,000 basic");

        let serialized = serde_json::to_value(alpha).unwrap();
        assert_eq!(serialized["premium"], "R450 per month");

        assert_eq!(quotes[1].data.premium.as_ref().unwrap().monthly, Some(520.0));
    }
}

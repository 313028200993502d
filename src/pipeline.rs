//! Quote processing run: `uploading -> processing -> completed | failed`.
//!
//! Every failure after the run is admitted is written back as `failed` and
//! returned to the caller. A result is only ever written together with
//! `completed`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, ProviderError};
use crate::extraction::Extractor;
use crate::fetch::DocumentFetcher;
use crate::gemini::{ModelProvider, RetryingModel};
use crate::retry::RetryPolicy;
use crate::schema::{ComparisonResult, StatusUpdate};
use crate::store::{ComparisonStore, DocumentStore};
use crate::synthesis::Synthesizer;

#[derive(Clone)]
pub struct QuoteProcessor {
    comparisons: Arc<dyn ComparisonStore>,
    documents: Arc<dyn DocumentStore>,
    fetcher: Arc<dyn DocumentFetcher>,
    /// `None` when no model credential is configured.
    provider: Option<Arc<dyn ModelProvider>>,
    policy: RetryPolicy<ProviderError>,
    pacing: Duration,
}

impl QuoteProcessor {
    pub fn new(
        comparisons: Arc<dyn ComparisonStore>,
        documents: Arc<dyn DocumentStore>,
        fetcher: Arc<dyn DocumentFetcher>,
        provider: Option<Arc<dyn ModelProvider>>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            comparisons,
            documents,
            fetcher,
            provider,
            policy: RetryPolicy::rate_limited(config.max_retries, config.base_delay),
            pacing: config.pacing,
        }
    }

    /// Run extraction and synthesis for one comparison.
    ///
    /// A comparison that is not in `uploading` is rejected with
    /// `InvalidTransition` and left untouched.
    pub async fn process_quotes(
        &self,
        comparison_id: &str,
        client_name: &str,
    ) -> Result<(), PipelineError> {
        let Some(provider) = self.provider.clone() else {
            let err = PipelineError::MissingCredential;
            error!("Cannot process comparison {}: {}", comparison_id, err);
            self.mark_failed(comparison_id, &err).await;
            return Err(err);
        };

        self.comparisons
            .set_status(comparison_id, StatusUpdate::Processing)
            .await?;
        info!("Processing comparison {}", comparison_id);

        match self.run(comparison_id, client_name, provider).await {
            Ok(()) => {
                info!("Comparison {} completed", comparison_id);
                Ok(())
            }
            Err(err) => {
                error!("Processing failed for comparison {}: {}", comparison_id, err);
                self.mark_failed(comparison_id, &err).await;
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        comparison_id: &str,
        client_name: &str,
        provider: Arc<dyn ModelProvider>,
    ) -> Result<(), PipelineError> {
        let model = RetryingModel::new(provider, self.policy);
        let documents = self.documents.list_documents(comparison_id).await?;

        let extractor = Extractor::new(
            model.clone(),
            self.documents.clone(),
            self.fetcher.clone(),
            self.pacing,
        );
        let quotes = extractor.extract_all(&documents).await?;

        let result: ComparisonResult = Synthesizer::new(model)
            .synthesize(client_name, &quotes)
            .await?;

        self.comparisons.store_result(comparison_id, result).await?;
        Ok(())
    }

    /// Best-effort `failed` write. A rejected write (e.g. the run was already
    /// swept) is logged, never returned.
    async fn mark_failed(&self, comparison_id: &str, err: &PipelineError) {
        let update = StatusUpdate::Failed {
            error: err.to_string(),
        };
        if let Err(e) = self.comparisons.set_status(comparison_id, update).await {
            warn!("Could not mark comparison {} failed: {}", comparison_id, e);
        }
    }
}

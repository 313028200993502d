//! Synthesis stage: one model call turning all extracted quotes into the
//! client-facing comparison.

use serde_json::Value;
use tracing::info;

use crate::error::{PipelineError, SanitizeError};
use crate::gemini::{PromptPart, RetryingModel};
use crate::prompts::comparison_prompt;
use crate::sanitize::parse_model_json;
use crate::schema::{ComparisonResult, ExtractedQuote};

pub struct Synthesizer {
    model: RetryingModel,
}

impl Synthesizer {
    pub fn new(model: RetryingModel) -> Self {
        Self { model }
    }

    pub async fn synthesize(
        &self,
        client_name: &str,
        quotes: &[ExtractedQuote],
    ) -> Result<ComparisonResult, PipelineError> {
        let prompt = comparison_prompt(client_name, quotes).map_err(PipelineError::Parse)?;
        info!(
            "Generating comparison for {} quotes ({} chars)",
            quotes.len(),
            prompt.len()
        );

        let text = self.model.invoke(&[PromptPart::text(prompt)]).await?;

        let value: Value = parse_model_json(&text).map_err(|e| match e {
            SanitizeError::NoJsonObject => PipelineError::SynthesisFormat,
            SanitizeError::Parse(e) => PipelineError::Parse(e),
        })?;

        Ok(ComparisonResult::from_model_output(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::ModelProvider;
    use crate::retry::RetryPolicy;
    use crate::schema::QuoteData;
    use crate::testing::{wrapped, ScriptedModel};
    use serde_json::json;
    use std::sync::Arc;

    fn synthesizer(model: Arc<ScriptedModel>) -> Synthesizer {
        let provider: Arc<dyn ModelProvider> = model;
        Synthesizer::new(RetryingModel::new(provider, RetryPolicy::default()))
    }

    fn quotes() -> Vec<ExtractedQuote> {
        ["Alpha", "Beta"]
            .iter()
            .enumerate()
            .map(|(i, name)| ExtractedQuote {
                file_name: format!("quote-{}.pdf", i + 1),
                data: QuoteData {
                    insurer_name: Some(name.to_string()),
                    ..Default::default()
                },
            })
            .collect()
    }

    #[tokio::test]
    async fn test_full_result() {
        let reply = json!({
            "summary": "Beta is cheaper.",
            "premiumComparison": {"items": [], "difference": "R50", "cheapest": "Beta"},
            "coverComparison": {"features": []},
            "excessComparison": {"insurers": {}, "analysis": "similar"},
            "conditionsDifferences": {"insurers": {}, "analysis": "none"},
            "recommendation": "Take Beta.",
            "emailDraft": "Dear Jane Doe,\n\n### Summary"
        });
        let model = Arc::new(ScriptedModel::new(vec![wrapped(&reply.to_string())]));

        let result = synthesizer(model.clone())
            .synthesize("Jane Doe", &quotes())
            .await
            .unwrap();

        assert_eq!(result.summary, "Beta is cheaper.");
        assert_eq!(result.premium_comparison["cheapest"], "Beta");
        assert!(result.email_draft.starts_with("Dear Jane Doe"));
        assert_eq!(model.calls(), 1);

        let prompt = &model.prompts()[0];
        assert_eq!(prompt.len(), 1);
        match &prompt[0] {
            PromptPart::Text { text } => {
                assert!(text.contains("Client Name: Jane Doe"));
                assert!(text.contains("\"insurerName\": \"Beta\""));
            }
            other => panic!("unexpected part: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_fields_default() {
        let model = Arc::new(ScriptedModel::new(vec![wrapped(
            r#"{"summary": "Only a summary", "coverComparison": "n/a"}"#,
        )]));

        let result = synthesizer(model)
            .synthesize("Jane", &quotes())
            .await
            .unwrap();

        assert_eq!(result.summary, "Only a summary");
        assert_eq!(result.recommendation, "");
        assert_eq!(result.email_draft, "");
        assert_eq!(result.cover_comparison, json!({}));
        assert_eq!(result.premium_comparison, json!({}));
    }

    #[tokio::test]
    async fn test_reply_without_object() {
        let model = Arc::new(ScriptedModel::new(vec![Ok("I am unable to compare these.".to_string())]));

        let err = synthesizer(model)
            .synthesize("Jane", &quotes())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::SynthesisFormat));
        assert_eq!(err.to_string(), "Failed to generate comparison");
    }

    #[tokio::test]
    async fn test_unparseable_object() {
        let model = Arc::new(ScriptedModel::new(vec![Ok("{summary: oops}".to_string())]));

        let err = synthesizer(model)
            .synthesize("Jane", &quotes())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Parse(_)));
    }
}

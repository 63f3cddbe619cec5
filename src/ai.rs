//! Word plausibility checks delegated to an external AI service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("AI validation is not configured")]
    Disabled,
    #[error("AI validation failed: {0}")]
    Upstream(String),
}

#[async_trait]
pub trait AiValidator: Send + Sync {
    /// Judges a batch of words of one language. Words absent from the
    /// returned map are left unresolved.
    async fn validate_batch(
        &self,
        language: &str,
        words: &[String],
    ) -> Result<HashMap<String, bool>, AiError>;
}

/// Used when no AI service is configured; every pending word stays unscored.
pub struct DisabledAiValidator;

#[async_trait]
impl AiValidator for DisabledAiValidator {
    async fn validate_batch(
        &self,
        _language: &str,
        _words: &[String],
    ) -> Result<HashMap<String, bool>, AiError> {
        Err(AiError::Disabled)
    }
}

/// Runs one batch on its own task under a hard deadline. Failures, panics and
/// timeouts yield no verdicts.
pub async fn validate_with_timeout(
    ai: Arc<dyn AiValidator>,
    language: &str,
    words: &[String],
    limit: Duration,
) -> HashMap<String, bool> {
    if words.is_empty() {
        return HashMap::new();
    }

    let language = language.to_string();
    let batch = words.to_vec();
    let mut call = tokio::spawn(async move { ai.validate_batch(&language, &batch).await });

    let outcome = match tokio::time::timeout(limit, &mut call).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(join)) => Ok(Err(AiError::Upstream(join.to_string()))),
        Err(elapsed) => {
            call.abort();
            Err(elapsed)
        }
    };

    match outcome {
        Ok(Ok(verdicts)) => {
            tracing::debug!("AI judged {} of {} words", verdicts.len(), words.len());
            verdicts
        }
        Ok(Err(AiError::Disabled)) => HashMap::new(),
        Ok(Err(e)) => {
            tracing::warn!("{}", e);
            HashMap::new()
        }
        Err(_) => {
            tracing::warn!(
                "AI validation of {} words timed out after {:?}",
                words.len(),
                limit
            );
            HashMap::new()
        }
    }
}

//! Capability interfaces for the external services the pipeline calls.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::registry::FieldSchema;

/// Pipeline stage, used for logging and error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Download,
    Transcribe,
    ExtractText,
    Summarize,
    Publish,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Transcribe => "transcribe",
            Stage::ExtractText => "extract-text",
            Stage::Summarize => "summarize",
            Stage::Publish => "publish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeout, rate limit, 5xx: worth another attempt
    Transient,
    /// Bad input, auth failure, exhausted quota: retrying cannot help
    Permanent,
}

/// Failure reported by a stage client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StageError {
    pub kind: FailureKind,
    pub message: String,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    pub fn timed_out(stage: Stage, after: Duration) -> Self {
        Self::transient(format!("{} timed out after {}s", stage, after.as_secs()))
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

/// Run one stage call under a deadline. A timeout counts as a transient failure.
pub async fn with_timeout<T, Fut>(stage: Stage, limit: Duration, call: Fut) -> Result<T, StageError>
where
    Fut: Future<Output = Result<T, StageError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StageError::timed_out(stage, limit)),
    }
}

#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetch the video at `source_url` into `destination`. Returns the path
    /// actually written, which may differ from `destination` (e.g. extension).
    async fn download(&self, source_url: &str, destination: &Path) -> Result<PathBuf, StageError>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, media: &Path) -> Result<String, StageError>;
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Best effort on-screen text recognition
    async fn extract_text(&self, media: &Path) -> Result<String, StageError>;
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        transcript: &str,
        extracted_text: &str,
        field_schema: &FieldSchema,
        prompt_override: Option<&str>,
    ) -> Result<Value, StageError>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Write the record into the target database and return a confirmation (page id)
    async fn write(&self, target_resource_id: &str, record: &Value, source_url: &str) -> Result<String, StageError>;
}

/// The set of stage clients one orchestrator runs with
#[derive(Clone)]
pub struct StageClients {
    pub downloader: Arc<dyn Downloader>,
    pub transcriber: Arc<dyn Transcriber>,
    pub text_extractor: Arc<dyn TextExtractor>,
    pub summarizer: Arc<dyn Summarizer>,
    pub publisher: Arc<dyn Publisher>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let err = with_timeout(Stage::ExtractText, Duration::from_secs(120), async {
            tokio::time::sleep(Duration::from_secs(121)).await;
            Ok::<_, StageError>("late".to_string())
        })
        .await
        .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.message, "extract-text timed out after 120s");
    }

    #[tokio::test]
    async fn test_result_passes_through() {
        let ok = with_timeout(Stage::Download, Duration::from_secs(1), async { Ok::<_, StageError>(7) }).await;
        assert_eq!(ok, Ok(7));

        let err = with_timeout(Stage::Download, Duration::from_secs(1), async {
            Err::<u8, _>(StageError::permanent("403 forbidden"))
        })
        .await
        .unwrap_err();
        assert!(!err.is_retryable());
    }
}

//! Drives one work item through download, transcription, text extraction,
//! summarization and publishing.
//!
//! The item's status in the ledger is the single-writer token: a run starts by
//! claiming `pending -> downloading` with a compare-and-set, and every later
//! write is a compare-and-set against the status this run wrote last. If that
//! status changed underneath (stale recovery handed the item to another
//! worker), the run stops without writing anything further. Every write goes
//! through `WorkStatus::next`.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use futures::FutureExt;
use log::{debug, error, info, warn};
use serde_json::Value;

use crate::config::StageTimeouts;
use crate::item::{next_timestamp, WorkItem};
use crate::ledger::{StatusLedger, StatusUpdate};
use crate::registry::SchemaBinding;
use crate::retry::RetryPolicy;
use crate::scratch::{ArtifactKind, ScratchDir, ScratchFile};
use crate::stage::{with_timeout, Stage, StageClients, StageError};
use crate::status::{Trigger, WorkStatus};

/// Everything one run accumulates. Lives for the duration of the run only.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// Snapshot of the item; `status` and `updated_at` track the last write
    pub item: WorkItem,
    pub binding: SchemaBinding,
    pub downloaded_file: Option<PathBuf>,
    pub transcript: Option<String>,
    pub ocr_text: Option<String>,
    pub summary: Option<Value>,
}

impl PipelineContext {
    pub fn new(item: WorkItem, binding: SchemaBinding) -> Self {
        Self {
            item,
            binding,
            downloaded_file: None,
            transcript: None,
            ocr_text: None,
            summary: None,
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed { confirmation: String },
    Failed { message: String },
    /// The item was not claimed; nothing was written
    Skipped { reason: String },
    /// Another writer changed the status mid-run; this run stopped writing
    Superseded { reason: String },
}

/// Why a run stopped early. Its display form becomes the item's error message.
#[derive(Debug, Clone)]
struct Failure {
    stage: Option<Stage>,
    message: String,
    /// The run no longer owns the item and must not record anything
    superseded: bool,
}

impl Failure {
    fn stage(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage: Some(stage),
            message: message.into(),
            superseded: false,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            stage: None,
            message: message.into(),
            superseded: false,
        }
    }

    fn superseded(expected: WorkStatus, next: WorkStatus) -> Self {
        Self {
            stage: None,
            message: format!("status is no longer {}, not recording {}", expected, next),
            superseded: true,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Some(stage) => write!(f, "{} failed: {}", stage, self.message),
            None => f.write_str(&self.message),
        }
    }
}

pub struct PipelineOrchestrator {
    ledger: Arc<dyn StatusLedger>,
    clients: StageClients,
    scratch: ScratchDir,
    retry: RetryPolicy,
    timeouts: StageTimeouts,
}

impl PipelineOrchestrator {
    pub fn new(
        ledger: Arc<dyn StatusLedger>,
        clients: StageClients,
        scratch: ScratchDir,
        retry: RetryPolicy,
        timeouts: StageTimeouts,
    ) -> Self {
        Self {
            ledger,
            clients,
            scratch,
            retry,
            timeouts,
        }
    }

    pub fn scratch(&self) -> &ScratchDir {
        &self.scratch
    }

    /// Process one item to a terminal status. Never panics and never returns an
    /// error: every failure is recorded on the item instead.
    pub async fn run(&self, item: WorkItem, binding: SchemaBinding) -> Outcome {
        let mut ctx = PipelineContext::new(item, binding);
        let id = ctx.item.id.clone();

        match self.claim(&mut ctx).await {
            Ok(true) => {}
            Ok(false) => {
                info!("Item {}: already claimed elsewhere, skipping", id);
                return Outcome::Skipped {
                    reason: "item is no longer pending".to_string(),
                };
            }
            Err(failure) => {
                error!("Item {}: could not claim: {}", id, failure);
                return Outcome::Skipped {
                    reason: failure.to_string(),
                };
            }
        }

        // Both guards outlive the stage sequence, whatever way it ends
        let mut video = self.scratch.acquire(ArtifactKind::Video);
        let mut adopted: Option<ScratchFile> = None;

        let caught = AssertUnwindSafe(self.drive(&mut ctx, &video, &mut adopted))
            .catch_unwind()
            .await;
        let result = match caught {
            Ok(result) => result,
            Err(panic) => Err(Failure::internal(format!(
                "panicked while {}: {}",
                ctx.item.status,
                panic_message(panic.as_ref())
            ))),
        };

        let outcome = match result {
            Ok(confirmation) => {
                info!("✅ Item {}: completed ({})", id, confirmation);
                Outcome::Completed { confirmation }
            }
            Err(failure) if failure.superseded => {
                warn!("Item {}: taken over by another writer, stopping: {}", id, failure);
                Outcome::Superseded {
                    reason: failure.to_string(),
                }
            }
            Err(failure) => {
                error!("❌ Item {}: {}", id, failure);
                self.record_failure(&mut ctx, &failure).await;
                Outcome::Failed {
                    message: failure.to_string(),
                }
            }
        };

        if let Some(mut file) = adopted {
            if let Err(e) = file.release() {
                warn!("Item {}: {:#}", id, e);
            }
        }
        if let Err(e) = video.release() {
            warn!("Item {}: {:#}", id, e);
        }
        outcome
    }

    /// Take the single-writer token: `pending -> downloading` if still pending
    async fn claim(&self, ctx: &mut PipelineContext) -> Result<bool, Failure> {
        let next = ctx
            .item
            .status
            .next(Trigger::Dispatched)
            .map_err(|e| Failure::internal(e.to_string()))?;
        let at = next_timestamp(ctx.item.updated_at);
        let claimed = self
            .ledger
            .compare_and_set(&ctx.item.id, WorkStatus::Pending, StatusUpdate::new(next, at))
            .await
            .map_err(|e| Failure::internal(e.to_string()))?;
        if claimed {
            info!("Item {}: {} -> {}", ctx.item.id, ctx.item.status, next);
            ctx.item.status = next;
            ctx.item.updated_at = at;
        }
        Ok(claimed)
    }

    async fn drive(
        &self,
        ctx: &mut PipelineContext,
        video: &ScratchFile,
        adopted: &mut Option<ScratchFile>,
    ) -> Result<String, Failure> {
        let id = ctx.item.id.clone();
        let source_url = ctx.item.source_url.clone();

        let destination = video.path().to_path_buf();
        let downloaded = self
            .attempt(&id, Stage::Download, self.timeouts.download(), || {
                self.clients.downloader.download(&source_url, &destination)
            })
            .await?;
        if downloaded != destination {
            // Never take ownership of (and later delete) a file outside scratch
            let file = self
                .scratch
                .adopt(downloaded.clone())
                .map_err(|e| Failure::stage(Stage::Download, format!("{:#}", e)))?;
            *adopted = Some(file);
        }
        ctx.downloaded_file = Some(downloaded.clone());
        self.advance(ctx, Trigger::Downloaded).await?;

        let transcript = self
            .attempt(&id, Stage::Transcribe, self.timeouts.transcribe(), || {
                self.clients.transcriber.transcribe(&downloaded)
            })
            .await?;
        debug!("Item {}: transcript has {} characters", id, transcript.len());
        ctx.transcript = Some(transcript.clone());
        self.advance(ctx, Trigger::Transcribed).await?;

        // Text extraction is an enrichment; the item carries on without it
        let extraction = AssertUnwindSafe(self.attempt(&id, Stage::ExtractText, self.timeouts.extract_text(), || {
            self.clients.text_extractor.extract_text(&downloaded)
        }))
        .catch_unwind()
        .await;
        match extraction {
            Ok(Ok(text)) => ctx.ocr_text = Some(text),
            Ok(Err(failure)) => warn!("Item {}: continuing with transcript only, {}", id, failure),
            Err(panic) => warn!(
                "Item {}: continuing with transcript only, {} panicked: {}",
                id,
                Stage::ExtractText,
                panic_message(panic.as_ref())
            ),
        }
        ctx.item.status = ctx
            .item
            .status
            .next(Trigger::TextExtracted)
            .map_err(|e| Failure::internal(e.to_string()))?;

        let extracted = ctx.ocr_text.clone().unwrap_or_default();
        let schema = ctx.binding.field_schema.clone();
        let prompt = ctx.binding.prompt_override.clone();
        let summary = self
            .attempt(&id, Stage::Summarize, self.timeouts.summarize(), || {
                self.clients
                    .summarizer
                    .summarize(&transcript, &extracted, &schema, prompt.as_deref())
            })
            .await?;
        ctx.summary = Some(summary.clone());
        self.advance(ctx, Trigger::Summarized).await?;

        let target = ctx.binding.target_resource_id.clone();
        let confirmation = self
            .attempt(&id, Stage::Publish, self.timeouts.publish(), || {
                self.clients.publisher.write(&target, &summary, &source_url)
            })
            .await?;
        self.advance(ctx, Trigger::Published).await?;

        Ok(confirmation)
    }

    /// One stage call under the retry policy, each attempt under the stage timeout
    async fn attempt<T, F, Fut>(&self, id: &str, stage: Stage, limit: Duration, mut call: F) -> Result<T, Failure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        self.retry
            .execute(
                |attempt| {
                    debug!("Item {}: {} attempt {}/{}", id, stage, attempt, self.retry.max_attempts);
                    with_timeout(stage, limit, call())
                },
                StageError::is_retryable,
            )
            .await
            .map_err(|e| Failure::stage(stage, e.to_string()))
    }

    /// Apply `trigger` and persist the new status with a fresh timestamp,
    /// provided the ledger still holds the status this run wrote last
    async fn advance(&self, ctx: &mut PipelineContext, trigger: Trigger) -> Result<(), Failure> {
        let from = ctx.item.status;
        let next = from.next(trigger).map_err(|e| Failure::internal(e.to_string()))?;
        let at = next_timestamp(ctx.item.updated_at);
        let written = self
            .ledger
            .compare_and_set(&ctx.item.id, from, StatusUpdate::new(next, at))
            .await
            .map_err(|e| Failure::internal(format!("could not record {}: {}", next, e)))?;
        if !written {
            return Err(Failure::superseded(from, next));
        }
        info!("Item {}: {} -> {}", ctx.item.id, from, next);
        ctx.item.status = next;
        ctx.item.updated_at = at;
        Ok(())
    }

    async fn record_failure(&self, ctx: &mut PipelineContext, failure: &Failure) {
        if let Err(e) = ctx.item.status.next(Trigger::StageFailed) {
            error!("Item {}: not recording failure: {}", ctx.item.id, e);
            return;
        }
        let at = next_timestamp(ctx.item.updated_at);
        match self
            .ledger
            .compare_and_set(&ctx.item.id, ctx.item.status, StatusUpdate::failed(at, failure.to_string()))
            .await
        {
            Ok(false) => warn!(
                "Item {}: status is no longer {}, leaving it to its new owner",
                ctx.item.id, ctx.item.status
            ),
            Ok(true) => {
                info!("Item {}: {} -> {}", ctx.item.id, ctx.item.status, WorkStatus::Failed);
                ctx.item.status = WorkStatus::Failed;
                ctx.item.updated_at = at;
                ctx.item.error_message = Some(failure.to_string());
            }
            Err(e) => error!("Item {}: could not record failure: {}", ctx.item.id, e),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

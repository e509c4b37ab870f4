//! Scripted stage clients and fixtures shared by the orchestrator and
//! discovery tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Semaphore;

use crate::config::StageTimeouts;
use crate::item::next_timestamp;
use crate::ledger::MemoryLedger;
use crate::orchestrator::PipelineOrchestrator;
use crate::registry::{FieldSchema, FieldSpec, SchemaBinding};
use crate::retry::RetryPolicy;
use crate::scratch::ScratchDir;
use crate::stage::{Downloader, Publisher, Stage, StageClients, StageError, Summarizer, TextExtractor, Transcriber};
use crate::status::WorkStatus;

/// What each fake stage does. `None` means succeed.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    pub download: Option<StageError>,
    pub transcribe: Option<StageError>,
    pub extract_text: Option<StageError>,
    pub summarize: Option<StageError>,
    pub publish: Option<StageError>,
    pub panic_at: Option<Stage>,
    /// Downloader writes next to the destination instead of onto it
    pub download_renames: bool,
    /// Downloader writes here and reports it, wherever it is
    pub download_to: Option<PathBuf>,
    /// Downloads wait for a permit from this semaphore
    pub gate: Option<Arc<Semaphore>>,
}

#[derive(Default)]
pub struct Calls {
    download: AtomicU32,
    transcribe: AtomicU32,
    extract_text: AtomicU32,
    summarize: AtomicU32,
    publish: AtomicU32,
    last_extracted_text: Mutex<Option<String>>,
    last_target: Mutex<Option<String>>,
    forget: Mutex<Option<(Arc<MemoryLedger>, String)>>,
    take_over: Mutex<Option<(Arc<MemoryLedger>, String, WorkStatus)>>,
}

impl Calls {
    pub fn download(&self) -> u32 {
        self.download.load(Ordering::SeqCst)
    }

    pub fn transcribe(&self) -> u32 {
        self.transcribe.load(Ordering::SeqCst)
    }

    pub fn extract_text(&self) -> u32 {
        self.extract_text.load(Ordering::SeqCst)
    }

    pub fn summarize(&self) -> u32 {
        self.summarize.load(Ordering::SeqCst)
    }

    pub fn publish(&self) -> u32 {
        self.publish.load(Ordering::SeqCst)
    }

    pub fn last_extracted_text(&self) -> Option<String> {
        self.last_extracted_text.lock().clone()
    }

    pub fn last_target(&self) -> Option<String> {
        self.last_target.lock().clone()
    }

    /// Delete `id` from `ledger` while its download is running
    pub fn forget_on_download(&self, ledger: Arc<MemoryLedger>, id: &str) {
        *self.forget.lock() = Some((ledger, id.to_string()));
    }

    /// Overwrite the status of `id` while its transcription is running, as a
    /// second writer would
    pub fn take_over_on_transcribe(&self, ledger: Arc<MemoryLedger>, id: &str, status: WorkStatus) {
        *self.take_over.lock() = Some((ledger, id.to_string(), status));
    }
}

struct Fake {
    behavior: Behavior,
    calls: Arc<Calls>,
}

impl Fake {
    fn enter(&self, stage: Stage, counter: &AtomicU32) -> Result<(), StageError> {
        counter.fetch_add(1, Ordering::SeqCst);
        if self.behavior.panic_at == Some(stage) {
            panic!("{} client crashed", stage);
        }
        let scripted = match stage {
            Stage::Download => &self.behavior.download,
            Stage::Transcribe => &self.behavior.transcribe,
            Stage::ExtractText => &self.behavior.extract_text,
            Stage::Summarize => &self.behavior.summarize,
            Stage::Publish => &self.behavior.publish,
        };
        match scripted {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Downloader for Fake {
    async fn download(&self, _source_url: &str, destination: &Path) -> Result<PathBuf, StageError> {
        if let Some(gate) = &self.behavior.gate {
            let _permit = gate.acquire().await;
        }
        if let Some((ledger, id)) = self.calls.forget.lock().take() {
            ledger.remove(&id);
        }
        let written = if let Some(path) = &self.behavior.download_to {
            path.clone()
        } else if self.behavior.download_renames {
            destination.with_extension("webm")
        } else {
            destination.to_path_buf()
        };
        // A partial file exists whether or not the download succeeds
        std::fs::write(&written, b"partial video").map_err(|e| StageError::permanent(e.to_string()))?;
        self.enter(Stage::Download, &self.calls.download)?;
        Ok(written)
    }
}

#[async_trait]
impl Transcriber for Fake {
    async fn transcribe(&self, media: &Path) -> Result<String, StageError> {
        if let Some((ledger, id, status)) = self.calls.take_over.lock().take() {
            if let Some(mut item) = ledger.get(&id) {
                item.status = status;
                item.updated_at = next_timestamp(item.updated_at);
                ledger.insert(item);
            }
        }
        self.enter(Stage::Transcribe, &self.calls.transcribe)?;
        assert!(media.exists(), "transcribing a missing file");
        Ok("Today we are making hand-pulled noodles".to_string())
    }
}

#[async_trait]
impl TextExtractor for Fake {
    async fn extract_text(&self, _media: &Path) -> Result<String, StageError> {
        self.enter(Stage::ExtractText, &self.calls.extract_text)?;
        Ok("Noodle Bar 123 Main St".to_string())
    }
}

#[async_trait]
impl Summarizer for Fake {
    async fn summarize(
        &self,
        _transcript: &str,
        extracted_text: &str,
        _field_schema: &FieldSchema,
        _prompt_override: Option<&str>,
    ) -> Result<Value, StageError> {
        *self.calls.last_extracted_text.lock() = Some(extracted_text.to_string());
        self.enter(Stage::Summarize, &self.calls.summarize)?;
        Ok(json!({"title": "Hand-pulled noodles", "summary": "A noodle recipe"}))
    }
}

#[async_trait]
impl Publisher for Fake {
    async fn write(&self, target_resource_id: &str, _record: &Value, _source_url: &str) -> Result<String, StageError> {
        *self.calls.last_target.lock() = Some(target_resource_id.to_string());
        self.enter(Stage::Publish, &self.calls.publish)?;
        Ok(format!("page-{}", self.calls.publish()))
    }
}

pub struct Fixture {
    pub ledger: Arc<MemoryLedger>,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub calls: Arc<Calls>,
    dir: TempDir,
}

impl Fixture {
    pub fn scratch_root(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }
}

pub fn fixture(behavior: Behavior) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let scratch = ScratchDir::open(dir.path().join("scratch")).unwrap();
    let ledger = Arc::new(MemoryLedger::new());
    let calls = Arc::new(Calls::default());
    let fake = Arc::new(Fake {
        behavior,
        calls: Arc::clone(&calls),
    });
    let clients = StageClients {
        downloader: fake.clone(),
        transcriber: fake.clone(),
        text_extractor: fake.clone(),
        summarizer: fake.clone(),
        publisher: fake,
    };
    let orchestrator = PipelineOrchestrator::new(
        ledger.clone(),
        clients,
        scratch,
        RetryPolicy::new(3, Duration::from_millis(10)),
        StageTimeouts::default(),
    );
    Fixture {
        ledger,
        orchestrator: Arc::new(orchestrator),
        calls,
        dir,
    }
}

pub fn binding(tag: &str) -> SchemaBinding {
    let schema: FieldSchema = [
        ("title".to_string(), FieldSpec::new("title")),
        ("summary".to_string(), FieldSpec::new("rich_text")),
    ]
    .into_iter()
    .collect();
    SchemaBinding::new("u1", tag, format!("db-{}", tag), schema)
}

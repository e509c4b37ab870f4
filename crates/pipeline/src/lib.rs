pub mod config;
pub mod status;
pub mod item;
pub mod ledger;
pub mod registry;
pub mod prompt;
pub mod retry;
pub mod stage;
pub mod scratch;
pub mod command;
pub mod orchestrator;
pub mod discovery;

#[cfg(test)]
mod testing;

pub use config::PipelineConfig;
pub use status::{Trigger, WorkStatus};
pub use item::WorkItem;
pub use ledger::{FileLedger, LedgerError, MemoryLedger, StatusLedger, StatusUpdate};
pub use registry::{FieldSchema, FieldSpec, RegistryError, SchemaBinding, SchemaRegistry};
pub use retry::{RetryError, RetryPolicy};
pub use stage::{Stage, StageClients, StageError};
pub use scratch::{ArtifactKind, ScratchDir, ScratchFile};
pub use orchestrator::{Outcome, PipelineContext, PipelineOrchestrator};
pub use discovery::{PollReport, SourceValidator, ValidationError, WorkDiscoveryLoop};

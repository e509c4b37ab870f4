use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use pipeline::{
    command::command_clients,
    discovery::SourceValidator,
    registry::{field_schema_from_properties, validate_link_schema},
    FileLedger, PipelineConfig, PipelineOrchestrator, RetryPolicy, SchemaBinding, SchemaRegistry,
    ScratchDir, StatusLedger, WorkDiscoveryLoop, WorkItem,
};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Social video processing daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the ledger and process pending items until interrupted
    Run {
        /// Run a single poll, wait for dispatched items, then exit
        #[arg(long)]
        once: bool,
    },
    /// Bind a tag to a target database
    Register {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        tag: String,
        /// Target database id
        #[arg(long)]
        target: String,
        /// JSON file with the target database `properties` object
        #[arg(long)]
        schema: PathBuf,
        /// Mapping instructions for the summarizer
        #[arg(long)]
        prompt: Option<String>,
    },
    /// Replace or clear the mapping instructions of a binding
    Prompt {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        tag: String,
        /// New instructions; omit to clear
        prompt: Option<String>,
    },
    /// List an owner's bindings, newest first
    Bindings {
        #[arg(long)]
        owner: String,
    },
    /// Queue a video URL for processing
    Enqueue {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        tag: String,
        url: String,
    },
    /// Check that a link database exposes the fields the poller needs
    ValidateLink {
        /// JSON file with the link database `properties` object
        schema: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = PipelineConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command {
        Command::Run { once } => run(cfg, once).await,
        Command::Register { owner, tag, target, schema, prompt } => {
            let registry = SchemaRegistry::open(&cfg.bindings_path)?;
            let field_schema = field_schema_from_properties(&read_json(&schema)?)?;
            let mut binding = SchemaBinding::new(owner, tag, target, field_schema);
            if let Some(prompt) = prompt {
                binding = binding.with_prompt(prompt);
            }
            registry.register(binding)?;
            Ok(())
        }
        Command::Prompt { owner, tag, prompt } => {
            let registry = SchemaRegistry::open(&cfg.bindings_path)?;
            let binding = registry.set_prompt(&owner, &tag, prompt)?;
            match binding.prompt_override {
                Some(_) => info!("Updated prompt for tag '{}'", tag),
                None => info!("Cleared prompt for tag '{}'", tag),
            }
            Ok(())
        }
        Command::Bindings { owner } => {
            let registry = SchemaRegistry::open(&cfg.bindings_path)?;
            for binding in registry.list(&owner) {
                println!(
                    "{}\t{}\t{} field(s)\t{}\t{}",
                    binding.tag,
                    binding.target_resource_id,
                    binding.field_schema.len(),
                    if binding.prompt_override.is_some() { "custom prompt" } else { "default prompt" },
                    binding.created_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
            Ok(())
        }
        Command::Enqueue { owner, tag, url } => {
            let validator = SourceValidator::new(&cfg.source_patterns)?;
            if !validator.is_supported(&url) {
                warn!("{} does not look like a supported video URL; it will be rejected", url);
            }
            let ledger = FileLedger::open(&cfg.ledger_dir)?;
            let item = WorkItem::new(owner, url, tag);
            ledger.save(&item)?;
            info!("Created item {} for: {}", item.id, item.source_url);
            println!("{}", item.id);
            Ok(())
        }
        Command::ValidateLink { schema } => {
            let field_schema = field_schema_from_properties(&read_json(&schema)?)?;
            validate_link_schema(&field_schema)?;
            println!("✅ {} is a valid link database schema", schema.display());
            Ok(())
        }
    }
}

async fn run(cfg: PipelineConfig, once: bool) -> Result<()> {
    info!("Social video processor starting");
    info!("Configuration loaded:");
    info!("  Ledger dir: {}", cfg.ledger_dir.display());
    info!("  Bindings: {}", cfg.bindings_path.display());
    info!("  Scratch dir: {}", cfg.scratch_dir.display());
    info!("  Poll interval: {}s", cfg.poll_interval_secs);
    info!("  Max concurrent: {}", cfg.max_concurrent);
    info!(
        "  Retry: {} attempt(s), base delay {}ms",
        cfg.retry.max_attempts, cfg.retry.base_delay_ms
    );

    let scratch = ScratchDir::open(&cfg.scratch_dir)?;
    let ledger: Arc<dyn StatusLedger> = Arc::new(FileLedger::open(&cfg.ledger_dir)?);
    let registry = Arc::new(SchemaRegistry::open(&cfg.bindings_path)?);
    let clients = command_clients(&cfg.commands, &scratch).context("Failed to set up stage clients")?;

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        Arc::clone(&ledger),
        clients,
        scratch,
        RetryPolicy::from_settings(&cfg.retry),
        cfg.timeouts.clone(),
    ));
    let mut discovery = WorkDiscoveryLoop::new(ledger, registry, orchestrator, &cfg)?;

    discovery.recover_on_startup().await?;

    if once {
        let report = discovery.poll_once().await?;
        discovery.drain().await;
        info!("Single poll finished: {} dispatched, {} rejected", report.dispatched, report.rejected);
        return Ok(());
    }

    discovery.run(shutdown_signal()).await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C"),
        Err(e) => {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse JSON: {}", path.display()))?;
    // Accept either the bare properties object or a full database object
    match value.get("properties") {
        Some(properties) => Ok(properties.clone()),
        None if value.is_object() => Ok(value),
        None => bail!("{} does not contain a JSON object", path.display()),
    }
}

//! The poll loop: finds pending items, validates them, and hands them to a
//! bounded pool of orchestrations.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use regex::Regex;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::PipelineConfig;
use crate::item::{next_timestamp, WorkItem};
use crate::ledger::{StatusLedger, StatusUpdate};
use crate::orchestrator::PipelineOrchestrator;
use crate::registry::{RegistryError, SchemaBinding, SchemaRegistry};
use crate::scratch::format_age;
use crate::status::{Trigger, WorkStatus};

/// Why an item was rejected before dispatch
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unsupported source URL: {0}")]
    UnsupportedSource(String),
    #[error(transparent)]
    Schema(#[from] RegistryError),
}

/// Accepts source URLs matching one of a set of patterns
#[derive(Debug, Clone)]
pub struct SourceValidator {
    patterns: Vec<Regex>,
}

impl SourceValidator {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("Invalid source pattern: {}", p)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_supported(&self, url: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(url))
    }
}

/// Counts from one poll
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub discovered: usize,
    pub dispatched: usize,
    pub rejected: usize,
    /// Valid but left pending because every worker was busy
    pub deferred: usize,
    /// Still pending in the ledger but already running here
    pub already_running: usize,
}

type InFlightSet = Arc<Mutex<HashSet<String>>>;

/// Membership of one id in the in-flight set, removed on drop
struct InFlightGuard {
    id: String,
    set: InFlightSet,
}

impl InFlightGuard {
    fn enter(set: &InFlightSet, id: &str) -> Self {
        set.lock().insert(id.to_string());
        Self {
            id: id.to_string(),
            set: Arc::clone(set),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

pub struct WorkDiscoveryLoop {
    ledger: Arc<dyn StatusLedger>,
    registry: Arc<SchemaRegistry>,
    orchestrator: Arc<PipelineOrchestrator>,
    validator: SourceValidator,
    permits: Arc<Semaphore>,
    in_flight: InFlightSet,
    tasks: JoinSet<()>,
    owner: Option<String>,
    poll_interval: Duration,
    sweep_interval: Duration,
    orphan_max_age: Duration,
    stale_after: chrono::Duration,
    max_requeues: u32,
}

impl WorkDiscoveryLoop {
    pub fn new(
        ledger: Arc<dyn StatusLedger>,
        registry: Arc<SchemaRegistry>,
        orchestrator: Arc<PipelineOrchestrator>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ledger,
            registry,
            orchestrator,
            validator: SourceValidator::new(&config.source_patterns)?,
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tasks: JoinSet::new(),
            owner: None,
            poll_interval: config.poll_interval(),
            sweep_interval: config.sweep_interval(),
            orphan_max_age: config.orphan_max_age(),
            stale_after: config.stale_after(),
            max_requeues: config.max_requeues,
        })
    }

    /// Only poll items belonging to `owner`
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Requeue stalled items and sweep scratch files a previous process left behind
    pub async fn recover_on_startup(&self) -> Result<(usize, usize)> {
        info!("🔄 Starting recovery checks...");
        let recovered = self
            .recover_stalled()
            .await
            .context("Failed to recover stalled items on startup")?;
        let swept = self
            .sweep_orphans()
            .await
            .context("Failed to sweep orphaned scratch files on startup")?;
        if recovered > 0 || swept > 0 {
            info!(
                "✅ Startup recovery complete: {} item(s) recovered, {} scratch file(s) cleaned",
                recovered, swept
            );
        } else {
            info!("✅ Startup recovery complete: no stalled items or orphaned files found");
        }
        Ok((recovered, swept))
    }

    /// One discovery pass: list pending items and dispatch as many as the pool allows
    pub async fn poll_once(&mut self) -> Result<PollReport> {
        self.reap_finished();

        // Bindings may be registered by another process while the loop runs
        if let Err(e) = self.registry.reload() {
            warn!("Failed to reload schema bindings, using the last loaded set: {:#}", e);
        }

        let pending = self
            .ledger
            .list_pending(self.owner.as_deref())
            .await
            .context("Failed to list pending items")?;
        let mut report = PollReport {
            discovered: pending.len(),
            ..PollReport::default()
        };

        for item in pending {
            if self.in_flight.lock().contains(&item.id) {
                debug!("Item {}: already running, skipping", item.id);
                report.already_running += 1;
                continue;
            }

            let binding = match self.validate(&item) {
                Ok(binding) => binding,
                Err(e) => {
                    self.reject(&item, &e).await;
                    report.rejected += 1;
                    continue;
                }
            };

            let permit = match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("Item {}: all workers busy, leaving pending", item.id);
                    report.deferred += 1;
                    continue;
                }
            };

            info!("Item {}: dispatching {} (tag {})", item.id, item.source_url, item.tag);
            let guard = InFlightGuard::enter(&self.in_flight, &item.id);
            let orchestrator = Arc::clone(&self.orchestrator);
            self.tasks.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                orchestrator.run(item, binding).await;
            });
            report.dispatched += 1;
        }

        if report.discovered > 0 {
            info!(
                "Poll summary: {} pending, {} dispatched, {} rejected, {} deferred, {} already running",
                report.discovered, report.dispatched, report.rejected, report.deferred, report.already_running
            );
        } else {
            debug!("No pending items");
        }
        Ok(report)
    }

    fn validate(&self, item: &WorkItem) -> Result<SchemaBinding, ValidationError> {
        if !self.validator.is_supported(&item.source_url) {
            return Err(ValidationError::UnsupportedSource(item.source_url.clone()));
        }
        self.registry
            .resolve(&item.owner_id, &item.tag)
            .ok_or_else(|| {
                ValidationError::Schema(RegistryError::UnknownTag {
                    owner_id: item.owner_id.clone(),
                    tag: item.tag.clone(),
                })
            })
    }

    /// Mark a pending item failed without running any stage
    async fn reject(&self, item: &WorkItem, reason: &ValidationError) {
        warn!("Item {}: rejected: {}", item.id, reason);
        if let Err(e) = item.status.next(Trigger::StageFailed) {
            error!("Item {}: {}", item.id, e);
            return;
        }
        let update = StatusUpdate::failed(next_timestamp(item.updated_at), reason.to_string());
        match self.ledger.compare_and_set(&item.id, WorkStatus::Pending, update).await {
            Ok(true) => {}
            Ok(false) => debug!("Item {}: changed before it could be rejected", item.id),
            Err(e) => error!("Item {}: could not record rejection: {}", item.id, e),
        }
    }

    /// Requeue (or abandon) in-flight items not written to within `stale_after`
    pub async fn recover_stalled(&self) -> Result<usize> {
        self.recover_stalled_before(Utc::now() - self.stale_after).await
    }

    pub async fn recover_stalled_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let stalled = self
            .ledger
            .list_stalled(cutoff)
            .await
            .context("Failed to list stalled items")?;
        let now = Utc::now();
        let mut recovered = 0;

        for item in stalled {
            if self.in_flight.lock().contains(&item.id) {
                continue;
            }
            let age = format_age((now - item.updated_at).to_std().unwrap_or_default());
            let at = next_timestamp(item.updated_at);

            let (update, trigger) = if item.retry_count >= self.max_requeues {
                let message = format!(
                    "abandoned after {} requeue(s): stuck in {} for {}",
                    item.retry_count, item.status, age
                );
                (
                    StatusUpdate::failed(at, message).with_retry_count(item.retry_count),
                    Trigger::StageFailed,
                )
            } else {
                (
                    StatusUpdate::new(WorkStatus::Pending, at).with_retry_count(item.retry_count + 1),
                    Trigger::Requeued,
                )
            };
            if let Err(e) = item.status.next(trigger) {
                warn!("Item {}: not recovering: {}", item.id, e);
                continue;
            }

            let target = update.status;
            match self.ledger.compare_and_set(&item.id, item.status, update).await {
                Ok(true) => {
                    warn!(
                        "⚠️  Item {}: stuck in {} for {}, now {} (requeue {}/{})",
                        item.id, item.status, age, target, item.retry_count, self.max_requeues
                    );
                    recovered += 1;
                }
                Ok(false) => debug!("Item {}: moved on before recovery", item.id),
                Err(e) => warn!("Item {}: could not recover: {}", item.id, e),
            }
        }
        Ok(recovered)
    }

    /// Delete old scratch files that no running item owns
    pub async fn sweep_orphans(&self) -> Result<usize> {
        let scratch = self.orchestrator.scratch().clone();
        let max_age = self.orphan_max_age;
        tokio::task::spawn_blocking(move || scratch.sweep_orphans(max_age))
            .await
            .context("Orphan sweep task panicked")?
    }

    fn reap_finished(&mut self) {
        while let Some(Some(result)) = self.tasks.join_next().now_or_never() {
            if let Err(e) = result {
                error!("Worker task ended abnormally: {}", e);
            }
        }
    }

    /// Wait for every dispatched item to finish
    pub async fn drain(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!("Worker task ended abnormally: {}", e);
            }
        }
    }

    /// Poll until `shutdown` resolves, then wait for in-flight items
    pub async fn run<S>(&mut self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut last_sweep = Instant::now();

        loop {
            match self.recover_stalled().await {
                Ok(0) => {}
                Ok(n) => info!("⚠️  Recovered {} stalled item(s) during periodic check", n),
                Err(e) => error!("Stale recovery failed: {:#}", e),
            }

            if let Err(e) = self.poll_once().await {
                error!("Poll failed: {:#}", e);
            }

            if last_sweep.elapsed() >= self.sweep_interval {
                if let Err(e) = self.sweep_orphans().await {
                    error!("Orphan sweep failed: {:#}", e);
                }
                last_sweep = Instant::now();
            }

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("Shutdown requested, waiting for {} in-flight item(s)", self.in_flight());
        self.drain().await;
        info!("All in-flight items finished");
        Ok(())
    }
}

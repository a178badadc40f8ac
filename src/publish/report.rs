//! Run results and progress reporting.

use std::collections::BTreeSet;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// The steps a layer goes through during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStep {
    Symbology,
    Data,
    Metadata,
    Groups,
}

impl PublishStep {
    pub fn label(&self) -> &'static str {
        match self {
            PublishStep::Symbology => "symbology",
            PublishStep::Data => "data",
            PublishStep::Metadata => "metadata",
            PublishStep::Groups => "groups",
        }
    }
}

/// How a run ended. Cancelled and failed runs still carry the results of
/// the layers that were handled before the run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Per-layer issues collected during a run. Sets keep repeated messages
/// from piling up and give the report a stable order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerResult {
    pub warnings: BTreeSet<String>,
    pub errors: BTreeSet<String>,
}

impl LayerResult {
    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.insert(message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.insert(message.into());
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Outcome of a publish run: how it ended plus layer results in
/// publication order.
#[derive(Debug, Clone)]
pub struct PublishReport {
    pub outcome: RunOutcome,
    pub results: IndexMap<String, LayerResult>,
}

impl PublishReport {
    pub fn new(outcome: RunOutcome, results: IndexMap<String, LayerResult>) -> Self {
        Self { outcome, results }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            outcome: RunOutcome::Failed(message.into()),
            results: IndexMap::new(),
        }
    }

    /// Names of layers that were published without errors.
    pub fn clean_layers(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|(_, r)| r.is_clean())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn has_errors(&self) -> bool {
        !matches!(self.outcome, RunOutcome::Completed)
            || self.results.values().any(|r| !r.is_clean())
    }
}

/// Progress events emitted while a run executes.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn step_started(&self, layer: &str, step: PublishStep);
    async fn step_finished(&self, layer: &str, step: PublishStep);
    async fn step_skipped(&self, layer: &str, step: PublishStep);
    async fn report_progress(&self, done: usize, total: usize);
    async fn report_completion(&self, outcome: &RunOutcome);
}

/// Default reporter that logs events.
pub struct TracingReporter;

#[async_trait]
impl ProgressReporter for TracingReporter {
    async fn step_started(&self, layer: &str, step: PublishStep) {
        info!("[{}] {} started", layer, step.label());
    }

    async fn step_finished(&self, layer: &str, step: PublishStep) {
        info!("[{}] {} finished", layer, step.label());
    }

    async fn step_skipped(&self, layer: &str, step: PublishStep) {
        info!("[{}] {} skipped", layer, step.label());
    }

    async fn report_progress(&self, done: usize, total: usize) {
        if total > 0 {
            info!("progress: {}/{} layers", done, total);
        }
    }

    async fn report_completion(&self, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Completed => info!("publish run completed"),
            RunOutcome::Cancelled => warn!("publish run cancelled"),
            RunOutcome::Failed(message) => error!("publish run failed: {}", message),
        }
    }
}

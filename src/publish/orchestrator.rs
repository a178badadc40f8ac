//! The publish run loop.
//!
//! A run executes on a background task and walks the selected layers in
//! order: symbology, then data, then metadata, each step fault-isolated so
//! one broken layer never stops the others. Cancellation is cooperative
//! and only honored at layer boundaries; a layer that started publishing
//! finishes before the run stops. Group creation and `close_publishing`
//! run exactly once, after the last layer.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::export::ArtifactConsolidator;
use crate::layers::LayerRef;
use crate::project::ProjectSnapshot;
use crate::servers::{DataCatalog, MetaCatalog, ServerInstance};

use super::report::{
    LayerResult, ProgressReporter, PublishReport, PublishStep, RunOutcome, TracingReporter,
};

/// Whether layers with incomplete metadata may be published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetadataPolicy {
    /// Neither data nor metadata is published for invalid layers
    Disallow,
    /// Everything is published; missing metadata fields are autofilled
    #[default]
    Allow,
    /// Data is published, the metadata record is withheld
    AllowDataOnly,
}

impl FromStr for MetadataPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disallow" => Ok(MetadataPolicy::Disallow),
            "allow" => Ok(MetadataPolicy::Allow),
            "allow-data-only" => Ok(MetadataPolicy::AllowDataOnly),
            other => Err(format!(
                "'{other}' is not a metadata policy (disallow, allow, allow-data-only)"
            )),
        }
    }
}

/// Everything a run needs, captured up front.
#[derive(Clone)]
pub struct PublishRequest {
    pub project: ProjectSnapshot,
    /// Layer ids to publish; empty means every layer in the project
    pub layer_ids: Vec<String>,
    pub only_symbology: bool,
    pub policy: MetadataPolicy,
}

impl PublishRequest {
    fn selected_layers(&self) -> Vec<LayerRef> {
        if self.layer_ids.is_empty() {
            return self.project.layers.clone();
        }
        self.layer_ids
            .iter()
            .filter_map(|id| self.project.layer(id).cloned())
            .collect()
    }
}

/// Handle to a run executing in the background.
pub struct RunningPublish {
    handle: JoinHandle<PublishReport>,
    cancel: Arc<AtomicBool>,
}

impl RunningPublish {
    /// Requests cancellation; the run stops before the next layer.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Waits for the run to finish. A panicked run yields a failed report.
    pub async fn wait(self) -> PublishReport {
        match self.handle.await {
            Ok(report) => report,
            Err(e) => PublishReport::failed(format!("publish task aborted: {e}")),
        }
    }
}

pub struct PublishOrchestrator {
    data: Option<Arc<dyn DataCatalog>>,
    meta: Option<Arc<dyn MetaCatalog>>,
    reporter: Arc<dyn ProgressReporter>,
}

impl PublishOrchestrator {
    pub fn new(data: Option<Arc<dyn DataCatalog>>, meta: Option<Arc<dyn MetaCatalog>>) -> Self {
        Self::with_reporter(data, meta, Arc::new(TracingReporter))
    }

    pub fn with_reporter(
        data: Option<Arc<dyn DataCatalog>>,
        meta: Option<Arc<dyn MetaCatalog>>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self { data, meta, reporter }
    }

    /// Spawns the run on a background task and returns a handle to it.
    pub fn start(&self, request: PublishRequest) -> RunningPublish {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        let data = self.data.clone();
        let meta = self.meta.clone();
        let reporter = self.reporter.clone();
        let handle = tokio::spawn(async move {
            let report = run(data, meta, reporter.clone(), request, flag).await;
            reporter.report_completion(&report.outcome).await;
            report
        });
        RunningPublish { handle, cancel }
    }

    /// Prepares the consolidator for the layers of a request. Attached to
    /// the GeoServer target by the caller before starting the run.
    pub fn consolidator_for(
        request: &PublishRequest,
        collab: &crate::collab::Collaborators,
    ) -> ArtifactConsolidator {
        let layers = request.selected_layers();
        let selections: HashMap<_, _> = request.project.field_selections.clone();
        ArtifactConsolidator::new(
            collab.exporter.clone(),
            collab.work_dir.clone(),
            &layers,
            &selections,
        )
    }

    /// Wires a run against registry instances: data catalog from `data`,
    /// metadata catalog from `meta`.
    pub fn for_targets(
        data: Option<&ServerInstance>,
        meta: Option<&ServerInstance>,
    ) -> PublishResultOrError {
        let data_catalog = match data {
            Some(instance) => Some(instance.data_catalog().ok_or_else(|| {
                format!("'{}' cannot receive layer data", instance.name())
            })?),
            None => None,
        };
        let meta_catalog = match meta {
            Some(instance) => Some(instance.meta_catalog().ok_or_else(|| {
                format!("'{}' cannot receive metadata records", instance.name())
            })?),
            None => None,
        };
        Ok(PublishOrchestrator::new(data_catalog, meta_catalog))
    }
}

type PublishResultOrError = Result<PublishOrchestrator, String>;

async fn run(
    data: Option<Arc<dyn DataCatalog>>,
    meta: Option<Arc<dyn MetaCatalog>>,
    reporter: Arc<dyn ProgressReporter>,
    request: PublishRequest,
    cancel: Arc<AtomicBool>,
) -> PublishReport {
    let layers = request.selected_layers();
    let mut results: IndexMap<String, LayerResult> = IndexMap::new();
    let mut published: Vec<String> = Vec::new();

    if let Some(data) = &data {
        if let Err(e) = data.prepare_for_publishing(request.only_symbology).await {
            return PublishReport::failed(format!("failed to prepare target: {e}"));
        }
    }

    let total = layers.len();
    for (i, layer) in layers.iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            return PublishReport::new(RunOutcome::Cancelled, results);
        }
        reporter.report_progress(i, total).await;

        let mut result = LayerResult::default();
        for warning in layer.name_warnings() {
            result.warn(warning);
        }
        let validates = layer.metadata.is_valid();
        let name = layer.name.clone();
        let mut data_published = false;

        if let Some(data) = &data {
            reporter.step_started(&name, PublishStep::Symbology).await;
            if let Err(e) = data.publish_style(layer).await {
                result.error(format!("failed to publish style: {e}"));
            }
            reporter.step_finished(&name, PublishStep::Symbology).await;

            if request.only_symbology {
                reporter.step_skipped(&name, PublishStep::Data).await;
            } else if validates || request.policy != MetadataPolicy::Disallow {
                reporter.step_started(&name, PublishStep::Data).await;
                let fields =
                    layer.selected_fields(request.project.field_selections.get(&layer.id));
                match data.publish_layer(layer, &fields).await {
                    Ok(()) => data_published = true,
                    Err(e) => result.error(format!("failed to publish data: {e}")),
                }
                reporter.step_finished(&name, PublishStep::Data).await;
            } else {
                result.error(format!(
                    "layer '{name}' has invalid metadata and was not published"
                ));
                reporter.step_skipped(&name, PublishStep::Data).await;
            }
        } else {
            reporter.step_skipped(&name, PublishStep::Symbology).await;
            reporter.step_skipped(&name, PublishStep::Data).await;
        }

        if let Some(meta) = &meta {
            if validates || request.policy == MetadataPolicy::Allow {
                let (wms, wfs, full_name) = match &data {
                    Some(data) => (
                        data.wms_url(),
                        if layer.is_vector() { data.wfs_url() } else { None },
                        Some(data.full_layer_name(&layer.web_slug())),
                    ),
                    None => (None, None, None),
                };
                let mut filled = layer.clone();
                filled.autofill_metadata();
                reporter.step_started(&name, PublishStep::Metadata).await;
                if let Err(e) = meta
                    .publish_layer_metadata(
                        &filled,
                        wms.as_deref(),
                        wfs.as_deref(),
                        full_name.as_deref(),
                    )
                    .await
                {
                    result.error(format!("failed to publish metadata: {e}"));
                }
                reporter.step_finished(&name, PublishStep::Metadata).await;
            } else {
                result.error(format!(
                    "layer '{name}' has invalid metadata; the record was not published"
                ));
                reporter.step_skipped(&name, PublishStep::Metadata).await;
            }
        } else {
            reporter.step_skipped(&name, PublishStep::Metadata).await;
        }

        if data_published {
            published.push(layer.web_slug());
        }
        results.insert(name, result);
    }
    reporter.report_progress(total, total).await;

    if let Some(data) = &data {
        if !request.only_symbology && !published.is_empty() {
            reporter.step_started("", PublishStep::Groups).await;
            if let Err(e) = data.create_groups(&request.project.groups).await {
                warn!("failed to create layer groups: {}", e);
            }
            if let Err(e) = data.close_publishing(&published).await {
                warn!("failed to finalize publication: {}", e);
            }
            reporter.step_finished("", PublishStep::Groups).await;
        } else {
            reporter.step_skipped("", PublishStep::Groups).await;
        }
    }

    PublishReport::new(RunOutcome::Completed, results)
}

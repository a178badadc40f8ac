//! Export consolidation.
//!
//! Layers that originate from the same container, directory or database
//! schema can share one exported GeoPackage instead of producing one file
//! per layer. The consolidator groups the run's vector layers into
//! equivalence classes up front; the first `export` call for a class writes
//! every member in one pass and later calls return the cached path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::collab::LayerExporter;
use crate::layers::{FieldSelection, LayerRef, LayerSource};

const CONTAINER_EXT: &str = "gpkg";

/// Normalized origin of a layer source; the identity of an equivalence
/// class. Derived facts only, never iteration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceKey {
    /// Existing multi-table container (a GeoPackage file)
    Container(PathBuf),
    /// Directory holding one or more single-table sources
    Directory(PathBuf),
    /// Database connection + schema
    Database(String),
}

impl SourceKey {
    fn of(layer: &LayerRef) -> Option<SourceKey> {
        if !layer.is_vector() {
            return None;
        }
        match &layer.source {
            LayerSource::File(path) => {
                if path.extension().map(|e| e == CONTAINER_EXT).unwrap_or(false) {
                    Some(SourceKey::Container(path.clone()))
                } else {
                    path.parent().map(|dir| SourceKey::Directory(dir.to_path_buf()))
                }
            }
            LayerSource::Database(db) => Some(SourceKey::Database(db.origin_key())),
        }
    }

    /// Output container file name, a pure function of the class key so that
    /// repeated runs over unchanged project state produce identical paths.
    fn container_name(&self) -> String {
        match self {
            SourceKey::Container(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("container.{CONTAINER_EXT}")),
            SourceKey::Directory(dir) => {
                let stem = dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "layers".to_string());
                format!("{}.{}", crate::naming::file_slug(&stem), CONTAINER_EXT)
            }
            SourceKey::Database(origin) => {
                format!("{}.{}", crate::naming::file_slug(origin), CONTAINER_EXT)
            }
        }
    }
}

/// Result of an `export` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportOutcome {
    /// True when this call performed (or attempted) the actual write
    pub first_export: bool,
    /// The shared container path, or `None` when the layer is outside any
    /// equivalence class and must be exported independently by the caller
    pub container: Option<PathBuf>,
}

pub struct ArtifactConsolidator {
    exporter: Arc<dyn LayerExporter>,
    work_dir: PathBuf,
    classes: HashMap<SourceKey, Vec<LayerRef>>,
    /// layer id -> export result; `None` until the class was written
    outputs: HashMap<String, Option<PathBuf>>,
    fields: HashMap<String, Vec<String>>,
}

impl ArtifactConsolidator {
    /// Groups the given layers by normalized origin. Raster layers and
    /// layers without a usable source are excluded and will be reported as
    /// outside any class by `export`.
    pub fn new(
        exporter: Arc<dyn LayerExporter>,
        work_dir: impl Into<PathBuf>,
        layers: &[LayerRef],
        selections: &HashMap<String, FieldSelection>,
    ) -> Self {
        let mut classes: HashMap<SourceKey, Vec<LayerRef>> = HashMap::new();
        let mut outputs = HashMap::new();
        let mut fields = HashMap::new();
        for layer in layers {
            let Some(key) = SourceKey::of(layer) else {
                continue;
            };
            outputs.insert(layer.id.clone(), None);
            fields.insert(
                layer.id.clone(),
                layer.selected_fields(selections.get(&layer.id)),
            );
            classes.entry(key).or_default().push(layer.clone());
        }
        Self {
            exporter,
            work_dir: work_dir.into(),
            classes,
            outputs,
            fields,
        }
    }

    /// Exports the given layer to its class container.
    ///
    /// The first call for a class writes every member of the class in one
    /// pass and records success per member; subsequent calls for exported
    /// members return the cached path immediately. A layer the
    /// consolidator does not know about yields `(true, None)`: the caller
    /// falls back to an independent export.
    pub async fn export(&mut self, layer: &LayerRef) -> ExportOutcome {
        let Some(slot) = self.outputs.get(&layer.id) else {
            return ExportOutcome {
                first_export: true,
                container: None,
            };
        };
        if let Some(path) = slot {
            return ExportOutcome {
                first_export: false,
                container: Some(path.clone()),
            };
        }

        let Some(key) = SourceKey::of(layer) else {
            return ExportOutcome {
                first_export: true,
                container: None,
            };
        };
        let container = self.work_dir.join(key.container_name());
        let members = self.classes.get(&key).cloned().unwrap_or_default();
        info!(
            "consolidating {} layer(s) into {}",
            members.len(),
            container.display()
        );
        for member in &members {
            let fields = self.fields.get(&member.id).cloned().unwrap_or_default();
            match self
                .exporter
                .export_vector(member, &fields, &container)
                .await
            {
                Ok(()) => {
                    self.outputs.insert(member.id.clone(), Some(container.clone()));
                }
                Err(e) => {
                    warn!("failed to export layer '{}': {}", member.name, e);
                }
            }
        }

        ExportOutcome {
            first_export: true,
            container: self.outputs.get(&layer.id).cloned().flatten(),
        }
    }
}

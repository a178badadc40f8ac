//! MapServer target.
//!
//! MapServer has no management API; publishing means laying out a project
//! folder (`data/`, `maps/`, `templates/`) and writing a map document that
//! references the exported layer data. Layers are collected during the run
//! and the map document is written once in `close_publishing`.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::collab::Collaborators;
use crate::errors::{PublishError, PublishResult};
use crate::layers::{Extent, LayerRef};
use crate::project::LayerGroup;

use super::{DataCatalog, TargetServer, TargetSettings};

pub const TYPE_NAME: &str = "mapserver";

fn default_project() -> String {
    "myMap".to_string()
}

fn default_proj_folder() -> String {
    "/usr/share/proj".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MapserverSettings {
    pub name: String,
    #[serde(default)]
    pub authid: Option<String>,
    /// Public base URL of the MapServer CGI endpoint
    pub url: String,
    /// Local folder the project layout is written to
    pub folder: PathBuf,
    /// Project (and map document) name
    #[serde(default = "default_project")]
    pub project: String,
    /// PROJ library path on the serving host
    #[serde(default = "default_proj_folder", rename = "projFolder")]
    pub proj_folder: String,
}

#[derive(Default)]
struct RunState {
    layers: Vec<LayerRef>,
    metadata_links: HashMap<String, String>,
}

pub struct MapserverTarget {
    settings: MapserverSettings,
    collab: Collaborators,
    state: RwLock<RunState>,
}

impl MapserverTarget {
    pub fn new(settings: MapserverSettings, collab: &Collaborators) -> Self {
        Self {
            settings,
            collab: collab.clone(),
            state: RwLock::new(RunState::default()),
        }
    }

    pub fn from_settings(value: &Value, collab: &Collaborators) -> PublishResult<Self> {
        let settings: MapserverSettings = serde_json::from_value(value.clone())?;
        super::check_base_url(&settings.url)?;
        Ok(Self::new(settings, collab))
    }

    fn project_folder(&self) -> PathBuf {
        self.settings.folder.join(&self.settings.project)
    }

    fn data_folder(&self) -> PathBuf {
        self.project_folder().join("data")
    }

    fn maps_folder(&self) -> PathBuf {
        self.project_folder().join("maps")
    }

    fn templates_folder(&self) -> PathBuf {
        self.project_folder().join("templates")
    }

    /// Records a link shown as `ows_metadataurl_href` in the map document.
    pub fn set_metadata_link(&self, layer_name: &str, url: &str) {
        if let Ok(mut state) = self.state.write() {
            state
                .metadata_links
                .insert(layer_name.to_string(), url.to_string());
        }
    }

    fn collected(&self) -> Vec<LayerRef> {
        self.state
            .read()
            .map(|state| state.layers.clone())
            .unwrap_or_default()
    }

    fn metadata_link(&self, layer_name: &str) -> Option<String> {
        self.state
            .read()
            .ok()
            .and_then(|state| state.metadata_links.get(layer_name).cloned())
    }

    /// Renders the map document for all collected layers.
    fn render_mapfile(&self) -> String {
        let layers = self.collected();
        let mut extent = Extent::default();
        let mut first = true;
        for layer in &layers {
            if first {
                extent = layer.extent;
                first = false;
            } else {
                extent.xmin = extent.xmin.min(layer.extent.xmin);
                extent.ymin = extent.ymin.min(layer.extent.ymin);
                extent.xmax = extent.xmax.max(layer.extent.xmax);
                extent.ymax = extent.ymax.max(layer.extent.ymax);
            }
        }

        let mut doc = String::new();
        let _ = writeln!(doc, "MAP");
        let _ = writeln!(doc, "  NAME \"{}\"", self.settings.project);
        let _ = writeln!(doc, "  STATUS ON");
        let _ = writeln!(doc, "  CONFIG \"PROJ_LIB\" \"{}\"", self.settings.proj_folder);
        let _ = writeln!(
            doc,
            "  EXTENT {} {} {} {}",
            extent.xmin, extent.ymin, extent.xmax, extent.ymax
        );
        let _ = writeln!(doc, "  SHAPEPATH \"../data\"");
        let _ = writeln!(doc, "  SIZE 700 700");
        let _ = writeln!(doc, "  UNITS METERS");
        let _ = writeln!(doc, "  WEB");
        let _ = writeln!(doc, "    METADATA");
        let _ = writeln!(doc, "      \"wms_title\" \"{}\"", self.settings.project);
        let _ = writeln!(doc, "      \"wms_onlineresource\" \"{}\"", self.wms_endpoint());
        let _ = writeln!(doc, "      \"ows_enable_request\" \"*\"");
        let _ = writeln!(doc, "      \"ows_srs\" \"EPSG:4326\"");
        let _ = writeln!(doc, "    END");
        let _ = writeln!(doc, "  END");

        for layer in &layers {
            let kind = if layer.is_raster() { "RASTER" } else { "LINE" };
            let _ = writeln!(doc, "  LAYER");
            let _ = writeln!(doc, "    NAME \"{}\"", layer.web_slug());
            let _ = writeln!(doc, "    DATA \"{}\"", self.data_file_name(layer));
            let _ = writeln!(doc, "    TYPE {kind}");
            let _ = writeln!(doc, "    STATUS ON");
            let _ = writeln!(doc, "    METADATA");
            let _ = writeln!(
                doc,
                "      \"wms_title\" \"{}\"",
                layer.metadata.title.clone().unwrap_or_else(|| layer.name.clone())
            );
            let _ = writeln!(
                doc,
                "      \"wms_abstract\" \"{}\"",
                layer.metadata.abstract_text.clone().unwrap_or_default()
            );
            let _ = writeln!(
                doc,
                "      \"ows_srs\" \"EPSG:4326 EPSG:3857 {}\"",
                layer.crs
            );
            let _ = writeln!(
                doc,
                "      \"wms_extent\" \"{} {} {} {}\"",
                layer.extent.xmin, layer.extent.ymin, layer.extent.xmax, layer.extent.ymax
            );
            if let Some(link) = self.metadata_link(&layer.name) {
                let _ = writeln!(doc, "      \"ows_metadataurl_href\" \"{link}\"");
                let _ = writeln!(doc, "      \"ows_metadataurl_type\" \"TC211\"");
                let _ = writeln!(doc, "      \"ows_metadataurl_format\" \"XML\"");
            }
            let _ = writeln!(doc, "    END");
            let _ = writeln!(doc, "  END");
        }
        let _ = writeln!(doc, "END");
        doc
    }

    fn data_file_name(&self, layer: &LayerRef) -> String {
        if layer.is_raster() {
            format!("{}.tif", layer.file_slug())
        } else {
            format!("{}.gpkg", layer.file_slug())
        }
    }

    fn wms_endpoint(&self) -> String {
        format!(
            "{}?map={}/maps/{}.map",
            self.settings.url.trim_end_matches('/'),
            self.settings.project,
            self.settings.project
        )
    }
}

#[async_trait]
impl TargetServer for MapserverTarget {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn type_label(&self) -> &'static str {
        "MapServer"
    }

    fn settings(&self) -> TargetSettings {
        TargetSettings {
            type_name: TYPE_NAME.to_string(),
            settings: serde_json::to_value(&self.settings).unwrap_or(Value::Null),
        }
    }

    async fn test_connection(&self, _errors: &mut BTreeSet<String>) -> bool {
        // There is no endpoint to test; the folder layout is validated when
        // publishing starts.
        true
    }
}

#[async_trait]
impl DataCatalog for MapserverTarget {
    async fn prepare_for_publishing(&self, _only_symbology: bool) -> PublishResult<()> {
        if let Ok(mut state) = self.state.write() {
            *state = RunState::default();
        }
        for folder in [self.data_folder(), self.maps_folder(), self.templates_folder()] {
            tokio::fs::create_dir_all(&folder).await?;
        }
        Ok(())
    }

    async fn publish_style(&self, layer: &LayerRef) -> PublishResult<()> {
        let (path, warnings) = self
            .collab
            .styles
            .serialize(layer, &self.maps_folder())
            .await?;
        for warning in warnings {
            warn!("{}", warning);
        }
        let target = self.maps_folder().join(format!(
            "{}.style",
            layer.file_slug()
        ));
        if path != target {
            tokio::fs::copy(&path, &target).await?;
        }
        Ok(())
    }

    async fn publish_layer(&self, layer: &LayerRef, fields: &[String]) -> PublishResult<()> {
        let target = self.data_folder().join(self.data_file_name(layer));
        if layer.is_raster() {
            let artifact = self
                .collab
                .exporter
                .export_raster(layer, &self.data_folder())
                .await?;
            if artifact != target {
                tokio::fs::copy(&artifact, &target).await?;
            }
        } else {
            self.collab
                .exporter
                .export_vector(layer, fields, &target)
                .await?;
        }
        if let Ok(mut state) = self.state.write() {
            state.layers.push(layer.clone());
        }
        Ok(())
    }

    async fn layer_exists(&self, _name: &str) -> PublishResult<bool> {
        // A fresh folder layout is written on every run
        Ok(false)
    }

    async fn style_exists(&self, _name: &str) -> PublishResult<bool> {
        Ok(false)
    }

    async fn delete_layer(&self, _name: &str) -> PublishResult<bool> {
        Ok(false)
    }

    async fn delete_style(&self, _name: &str) -> PublishResult<bool> {
        Ok(false)
    }

    async fn create_groups(&self, _groups: &[LayerGroup]) -> PublishResult<()> {
        // The map document itself is the only grouping MapServer knows
        Ok(())
    }

    async fn close_publishing(&self, _published: &[String]) -> PublishResult<()> {
        let layers = self.collected();
        if layers.is_empty() {
            return Err(PublishError::Validation(
                "no layers were published, not writing a map document".to_string(),
            ));
        }
        let mapfile = self.render_mapfile();
        let path = self
            .maps_folder()
            .join(format!("{}.map", self.settings.project));
        tokio::fs::write(&path, mapfile).await?;
        info!(
            "wrote map document for {} layer(s) to {}",
            layers.len(),
            path.display()
        );
        Ok(())
    }

    fn full_layer_name(&self, layer_name: &str) -> String {
        layer_name.to_string()
    }

    fn wms_url(&self) -> Option<String> {
        Some(format!(
            "{}&service=WMS&version=1.1.0&request=GetCapabilities",
            self.wms_endpoint()
        ))
    }

    fn wfs_url(&self) -> Option<String> {
        Some(format!(
            "{}&service=WFS&version=2.0.0&request=GetCapabilities",
            self.wms_endpoint()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{LayerKind, LayerMetadata, LayerSource};

    fn settings(folder: PathBuf) -> MapserverSettings {
        MapserverSettings {
            name: "ms".into(),
            authid: None,
            url: "http://maps.example.com/cgi-bin/mapserv".into(),
            folder,
            project: "atlas".into(),
            proj_folder: default_proj_folder(),
        }
    }

    fn layer(name: &str) -> LayerRef {
        LayerRef {
            id: format!("{name}-id"),
            name: name.to_string(),
            kind: LayerKind::Vector,
            source: LayerSource::File("/data/src.gpkg".into()),
            fields: vec!["id".into()],
            crs: "EPSG:28992".into(),
            extent: Extent { xmin: 0.0, ymin: 0.0, xmax: 5.0, ymax: 5.0 },
            metadata: LayerMetadata::default(),
        }
    }

    #[tokio::test]
    async fn close_publishing_writes_map_document() {
        let tmp = tempfile::tempdir().unwrap();
        let target = MapserverTarget::new(
            settings(tmp.path().to_path_buf()),
            &Collaborators::with_defaults(tmp.path().join("work")),
        );
        target.prepare_for_publishing(false).await.unwrap();
        target.publish_layer(&layer("rivers"), &["id".into()]).await.unwrap();
        target.close_publishing(&["rivers".into()]).await.unwrap();

        let mapfile = tmp.path().join("atlas/maps/atlas.map");
        let text = std::fs::read_to_string(mapfile).unwrap();
        assert!(text.contains("NAME \"atlas\""));
        assert!(text.contains("DATA \"rivers.gpkg\""));
        assert!(text.contains("EPSG:28992"));
    }

    #[tokio::test]
    async fn close_publishing_without_layers_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let target = MapserverTarget::new(
            settings(tmp.path().to_path_buf()),
            &Collaborators::with_defaults(tmp.path().join("work")),
        );
        target.prepare_for_publishing(false).await.unwrap();
        let err = target.close_publishing(&[]).await.unwrap_err();
        assert!(matches!(err, PublishError::Validation(_)));
    }

    #[tokio::test]
    async fn metadata_links_appear_in_map_document() {
        let tmp = tempfile::tempdir().unwrap();
        let target = MapserverTarget::new(
            settings(tmp.path().to_path_buf()),
            &Collaborators::with_defaults(tmp.path().join("work")),
        );
        target.prepare_for_publishing(false).await.unwrap();
        target.publish_layer(&layer("rivers"), &[]).await.unwrap();
        target.set_metadata_link("rivers", "http://gn/records/abc");
        let text = target.render_mapfile();
        assert!(text.contains("ows_metadataurl_href\" \"http://gn/records/abc"));
    }
}

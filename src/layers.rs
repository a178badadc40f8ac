//! Publish-time snapshot of the host project's layers.
//!
//! A [`LayerRef`] is created once at the start of a run from the live layer
//! model and stays immutable for the run's duration, so every target sees
//! the same facts regardless of what happens in the host application.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::naming;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Vector,
    Raster,
}

/// Database connection descriptor for a table-backed layer source.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseSource {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub auth_ref: Option<String>,
}

impl DatabaseSource {
    /// Identity of the connection+schema, used to group layers that can
    /// share one exported container.
    pub fn origin_key(&self) -> String {
        format!("{}:{}/{}.{}", self.host, self.port, self.database, self.schema)
    }

    pub fn qualified_table(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.table)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LayerSource {
    File(std::path::PathBuf),
    Database(DatabaseSource),
}

/// Geographic bounding box in the layer's native CRS.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct Extent {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl Extent {
    pub fn is_empty(&self) -> bool {
        self.xmax <= self.xmin || self.ymax <= self.ymin
    }
}

/// Descriptive metadata carried by a layer, filled in by the user in the
/// host application. Completeness is checked before publication.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct LayerMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "abstract")]
    pub abstract_text: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub crs: Option<String>,
    #[serde(default)]
    pub extent: Option<Extent>,
}

impl LayerMetadata {
    /// A metadata record validates when it has a title and a usable
    /// spatial extent with a CRS.
    pub fn is_valid(&self) -> bool {
        let has_title = self.title.as_deref().map(|t| !t.is_empty()).unwrap_or(false);
        let has_extent = matches!((&self.crs, &self.extent), (Some(c), Some(e)) if !c.is_empty() && !e.is_empty());
        has_title && has_extent
    }
}

/// Immutable snapshot of one publishable dataset.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LayerRef {
    /// Stable id, unique within a run
    pub id: String,
    /// Display name as shown in the host application
    pub name: String,
    pub kind: LayerKind,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub source: LayerSource,
    /// Field names in order of appearance (vector layers)
    #[serde(default)]
    pub fields: Vec<String>,
    /// Native CRS authority id, e.g. "EPSG:28992"
    pub crs: String,
    pub extent: Extent,
    #[serde(default)]
    pub metadata: LayerMetadata,
}

/// Per-layer mapping of field name to include flag.
pub type FieldSelection = BTreeMap<String, bool>;

impl LayerRef {
    pub fn is_vector(&self) -> bool {
        self.kind == LayerKind::Vector
    }

    pub fn is_raster(&self) -> bool {
        self.kind == LayerKind::Raster
    }

    /// Name used for every remote interaction with this layer.
    pub fn web_slug(&self) -> String {
        naming::web_slug(&self.name)
    }

    /// Name stem used for files derived from this layer.
    pub fn file_slug(&self) -> String {
        naming::file_slug(&self.name)
    }

    /// Stem of the originating file, when the source is file-based.
    pub fn source_stem(&self) -> Option<String> {
        match &self.source {
            LayerSource::File(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned()),
            LayerSource::Database(_) => None,
        }
    }

    /// Resolves the effective field list for this layer given a selection.
    /// With no selection, every field is included.
    pub fn selected_fields(&self, selection: Option<&FieldSelection>) -> Vec<String> {
        match selection {
            Some(sel) => self
                .fields
                .iter()
                .filter(|f| sel.get(f.as_str()).copied().unwrap_or(true))
                .cloned()
                .collect(),
            None => self.fields.clone(),
        }
    }

    /// Warnings for names that may cause trouble on remote servers.
    pub fn name_warnings(&self) -> Vec<String> {
        if naming::is_valid_name(&self.name) {
            vec![]
        } else {
            vec![format!(
                "Layer name '{}' contains characters that may cause issues; publishing as '{}'",
                self.name,
                self.web_slug()
            )]
        }
    }

    /// Fills in missing metadata so a record can always be published:
    /// the title defaults to the layer name and a missing or empty spatial
    /// extent is replaced with the layer's native extent under its native
    /// CRS. Reprojection to a geographic CRS is left to the host, which
    /// owns the coordinate transform machinery.
    pub fn autofill_metadata(&mut self) {
        if self.metadata.title.as_deref().map(str::is_empty).unwrap_or(true) {
            self.metadata.title = Some(self.name.clone());
        }
        let extent_ok = matches!((&self.metadata.crs, &self.metadata.extent),
            (Some(c), Some(e)) if !c.is_empty() && !e.is_empty());
        if !extent_ok {
            self.metadata.crs = Some(self.crs.clone());
            self.metadata.extent = Some(self.extent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn vector_layer(name: &str) -> LayerRef {
        LayerRef {
            id: format!("{name}-id"),
            name: name.to_string(),
            kind: LayerKind::Vector,
            source: LayerSource::File(PathBuf::from("/data/rivers.gpkg")),
            fields: vec!["id".into(), "name".into(), "length".into()],
            crs: "EPSG:4326".into(),
            extent: Extent { xmin: 0.0, ymin: 0.0, xmax: 10.0, ymax: 10.0 },
            metadata: LayerMetadata::default(),
        }
    }

    #[test]
    fn selected_fields_defaults_to_all() {
        let layer = vector_layer("rivers");
        assert_eq!(layer.selected_fields(None).len(), 3);
    }

    #[test]
    fn selected_fields_honors_selection() {
        let layer = vector_layer("rivers");
        let mut sel = FieldSelection::new();
        sel.insert("length".into(), false);
        let fields = layer.selected_fields(Some(&sel));
        assert_eq!(fields, vec!["id".to_string(), "name".to_string()]);
    }

    #[test]
    fn autofill_sets_title_and_extent() {
        let mut layer = vector_layer("rivers");
        assert!(!layer.metadata.is_valid());
        layer.autofill_metadata();
        assert_eq!(layer.metadata.title.as_deref(), Some("rivers"));
        assert_eq!(layer.metadata.crs.as_deref(), Some("EPSG:4326"));
        assert!(layer.metadata.is_valid());
    }

    #[test]
    fn autofill_keeps_projected_extent_in_native_crs() {
        let mut layer = vector_layer("parcels");
        layer.crs = "EPSG:28992".into();
        layer.extent = Extent { xmin: 0.0, ymin: 300000.0, xmax: 280000.0, ymax: 620000.0 };
        layer.autofill_metadata();
        assert_eq!(layer.metadata.crs.as_deref(), Some("EPSG:28992"));
        assert_eq!(layer.metadata.extent, Some(layer.extent));
        assert!(layer.metadata.is_valid());
    }

    #[test]
    fn autofill_keeps_existing_valid_metadata() {
        let mut layer = vector_layer("rivers");
        layer.metadata.title = Some("River network".into());
        layer.metadata.crs = Some("EPSG:28992".into());
        layer.metadata.extent = Some(Extent { xmin: 1.0, ymin: 1.0, xmax: 2.0, ymax: 2.0 });
        layer.autofill_metadata();
        assert_eq!(layer.metadata.title.as_deref(), Some("River network"));
        assert_eq!(layer.metadata.crs.as_deref(), Some("EPSG:28992"));
    }

    #[test]
    fn name_warnings_for_non_ascii() {
        let layer = vector_layer("rivière 1");
        assert_eq!(layer.name_warnings().len(), 1);
        assert!(vector_layer("rivers").name_warnings().is_empty());
    }
}

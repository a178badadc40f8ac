//! Project snapshot documents.
//!
//! The CLI feeds the orchestrator a YAML document describing what to
//! publish: the layers, per-layer field selections and the layer group
//! tree. The document is read once and never written back.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{PublishError, PublishResult};
use crate::layers::{FieldSelection, LayerRef};

/// A named group of published layers; groups may nest.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LayerGroup {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "abstract")]
    pub abstract_text: String,
    #[serde(default)]
    pub layers: Vec<GroupMember>,
}

/// Either a layer name or a nested group.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum GroupMember {
    Layer(String),
    Group(LayerGroup),
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ProjectSnapshot {
    /// Project name; data catalogs that need a workspace derive it here
    pub name: String,
    #[serde(default)]
    pub layers: Vec<LayerRef>,
    /// Per-layer field selections keyed by layer id
    #[serde(default)]
    pub field_selections: HashMap<String, FieldSelection>,
    #[serde(default)]
    pub groups: Vec<LayerGroup>,
}

impl ProjectSnapshot {
    pub fn from_yaml(text: &str) -> PublishResult<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| PublishError::Config(format!("invalid project document: {e}")))
    }

    pub fn load(path: &Path) -> PublishResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn layer(&self, id: &str) -> Option<&LayerRef> {
        self.layers.iter().find(|l| l.id == id)
    }

    /// Flat list of layer names referenced by the group tree.
    pub fn grouped_layer_names(&self) -> Vec<String> {
        fn walk(group: &LayerGroup, out: &mut Vec<String>) {
            for member in &group.layers {
                match member {
                    GroupMember::Layer(name) => out.push(name.clone()),
                    GroupMember::Group(nested) => walk(nested, out),
                }
            }
        }
        let mut out = Vec::new();
        for group in &self.groups {
            walk(group, &mut out);
        }
        out
    }
}

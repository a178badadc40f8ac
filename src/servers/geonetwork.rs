//! GeoNetwork metadata catalog target.
//!
//! Records are packaged by the [`MetadataTransformer`] collaborator and
//! POSTed to the records API. Record identity is the layer id, so
//! republishing replaces the record for the same dataset.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::collab::Collaborators;
use crate::errors::PublishResult;
use crate::layers::LayerRef;
use crate::rest::RestClient;

use super::{MetaCatalog, TargetServer, TargetSettings};

pub const TYPE_NAME: &str = "geonetwork";

fn default_node() -> String {
    "srv".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GeonetworkSettings {
    pub name: String,
    #[serde(default)]
    pub authid: Option<String>,
    pub url: String,
    /// GeoNetwork node name, almost always "srv"
    #[serde(default = "default_node")]
    pub node: String,
}

pub struct GeonetworkTarget {
    settings: GeonetworkSettings,
    base_url: String,
    client: RestClient,
    collab: Collaborators,
}

impl GeonetworkTarget {
    pub fn new(settings: GeonetworkSettings, collab: &Collaborators) -> Self {
        let base_url = settings.url.trim_end_matches('/').to_string();
        let transport = collab.transport_for(settings.authid.as_deref());
        Self {
            settings,
            base_url,
            client: RestClient::new(transport),
            collab: collab.clone(),
        }
    }

    pub fn from_settings(value: &Value, collab: &Collaborators) -> PublishResult<Self> {
        let settings: GeonetworkSettings = serde_json::from_value(value.clone())?;
        super::check_base_url(&settings.url)?;
        Ok(Self::new(settings, collab))
    }

    fn api_url(&self) -> String {
        format!("{}/{}/api", self.base_url, self.settings.node)
    }
}

#[async_trait]
impl TargetServer for GeonetworkTarget {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn type_label(&self) -> &'static str {
        "GeoNetwork"
    }

    fn settings(&self) -> TargetSettings {
        TargetSettings {
            type_name: TYPE_NAME.to_string(),
            settings: serde_json::to_value(&self.settings).unwrap_or(Value::Null),
        }
    }

    async fn test_connection(&self, errors: &mut BTreeSet<String>) -> bool {
        let url = format!("{}/info?type=me", self.api_url());
        match self.client.get_text(&url).await {
            Ok(_) => true,
            Err(e) if e.is_unauthorized() => {
                errors.insert(format!(
                    "could not connect to '{}': please check credentials",
                    self.settings.name
                ));
                false
            }
            Err(e) => {
                errors.insert(format!(
                    "could not connect to '{}': {}",
                    self.settings.name, e
                ));
                false
            }
        }
    }
}

#[async_trait]
impl MetaCatalog for GeonetworkTarget {
    async fn publish_layer_metadata(
        &self,
        layer: &LayerRef,
        wms_url: Option<&str>,
        wfs_url: Option<&str>,
        linked_name: Option<&str>,
    ) -> PublishResult<()> {
        let package = self
            .collab
            .metadata
            .package(layer, wms_url, wfs_url, linked_name, &self.collab.work_dir)
            .await?;
        // Replace any previous record for this dataset
        if self.metadata_exists(&layer.id).await? {
            self.delete_metadata(&layer.id).await?;
        }
        let bytes = tokio::fs::read(&package).await?;
        let url = format!("{}/records", self.api_url());
        self.client
            .post_bytes(&url, bytes, "application/octet-stream")
            .await?;
        info!(
            "published metadata record for layer '{}' from '{}'",
            layer.name,
            package.display()
        );
        Ok(())
    }

    async fn metadata_exists(&self, id: &str) -> PublishResult<bool> {
        match self.client.get_text(&self.metadata_url(id)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_missing() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_metadata(&self, id: &str) -> PublishResult<()> {
        self.client.delete_absent_ok(&self.metadata_url(id)).await?;
        Ok(())
    }

    fn metadata_url(&self, id: &str) -> String {
        format!("{}/records/{}", self.api_url(), id)
    }
}

//! Target capability model.
//!
//! A target type declares what it can do by implementing one or more role
//! traits rather than inheriting from a concrete base. Every target also
//! implements [`TargetServer`], whose `settings()` must be sufficient to
//! reconstruct an equivalent instance; the registry verifies that at save
//! time.

pub mod composite;
pub mod geonetwork;
pub mod geoserver;
pub mod mapserver;
pub mod postgis;
pub mod registry;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{PublishError, PublishResult};
use crate::layers::{DatabaseSource, LayerRef};
use crate::project::LayerGroup;

pub use composite::CompositeTarget;
pub use geonetwork::{GeonetworkSettings, GeonetworkTarget};
pub use geoserver::{GeoserverSettings, GeoserverStorage, GeoserverTarget};
pub use mapserver::{MapserverSettings, MapserverTarget};
pub use postgis::{PostgisSettings, PostgisTarget};
pub use registry::ServerRegistry;

/// Rejects settings whose base URL does not parse, so a target with a
/// broken URL never lands in the registry.
pub(crate) fn check_base_url(url: &str) -> PublishResult<()> {
    url::Url::parse(url)
        .map(|_| ())
        .map_err(|e| PublishError::Config(format!("invalid server URL '{url}': {e}")))
}

/// Persistable `(type name, settings)` pair. The settings object always
/// includes `name`, plus `authid`/`url` when applicable.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TargetSettings {
    pub type_name: String,
    pub settings: serde_json::Value,
}

/// Contract shared by every target type.
#[async_trait]
pub trait TargetServer: Send + Sync {
    /// User-given instance name; unique within the registry.
    fn name(&self) -> &str;

    /// Human-readable type label, e.g. "GeoServer".
    fn type_label(&self) -> &'static str;

    /// Settings sufficient to reconstruct an equivalent instance.
    fn settings(&self) -> TargetSettings;

    /// Tests connectivity. Never fails; problems are added to `errors`.
    async fn test_connection(&self, errors: &mut BTreeSet<String>) -> bool;
}

/// A target that can receive layer data and styles.
#[async_trait]
pub trait DataCatalog: TargetServer {
    /// Called once before a run starts publishing layers.
    async fn prepare_for_publishing(&self, only_symbology: bool) -> PublishResult<()>;

    async fn publish_style(&self, layer: &LayerRef) -> PublishResult<()>;

    async fn publish_layer(&self, layer: &LayerRef, fields: &[String]) -> PublishResult<()>;

    async fn layer_exists(&self, name: &str) -> PublishResult<bool>;

    async fn style_exists(&self, name: &str) -> PublishResult<bool>;

    /// Deletes a layer; returns true when the layer is gone afterwards.
    async fn delete_layer(&self, name: &str) -> PublishResult<bool>;

    /// Deletes a style; returns true when the style is gone afterwards.
    async fn delete_style(&self, name: &str) -> PublishResult<bool>;

    /// Publishes layer groups referencing already-published layers.
    async fn create_groups(&self, groups: &[LayerGroup]) -> PublishResult<()>;

    /// Called once after all layers were handled; finalizes anything that
    /// spans layers (tile formats, consolidated styles, map documents).
    async fn close_publishing(&self, published: &[String]) -> PublishResult<()>;

    /// Fully qualified remote name for a published layer.
    fn full_layer_name(&self, layer_name: &str) -> String;

    fn wms_url(&self) -> Option<String> {
        None
    }

    fn wfs_url(&self) -> Option<String> {
        None
    }

    /// Browser preview for a set of published layers, when supported.
    fn preview_url(&self, _layer_names: &[String], _bbox: &str, _srs: &str) -> Option<String> {
        None
    }
}

/// A target that can receive layer metadata records.
#[async_trait]
pub trait MetaCatalog: TargetServer {
    async fn publish_layer_metadata(
        &self,
        layer: &LayerRef,
        wms_url: Option<&str>,
        wfs_url: Option<&str>,
        linked_name: Option<&str>,
    ) -> PublishResult<()>;

    async fn metadata_exists(&self, id: &str) -> PublishResult<bool>;

    async fn delete_metadata(&self, id: &str) -> PublishResult<()>;

    fn metadata_url(&self, id: &str) -> String;
}

/// A target that can ingest layer data into a database.
#[async_trait]
pub trait DbTarget: TargetServer {
    async fn import_layer(&self, layer: &LayerRef, fields: &[String]) -> PublishResult<()>;

    /// Connection descriptor pointing at the imported table for the layer.
    fn source_for(&self, layer: &LayerRef) -> DatabaseSource;
}

/// A configured target instance with typed role access.
///
/// Explicit variants (rather than downcasting) keep the
/// settings-to-instance mapping in one place: the registry factory.
#[derive(Clone)]
pub enum ServerInstance {
    Geoserver(Arc<GeoserverTarget>),
    Geonetwork(Arc<GeonetworkTarget>),
    Mapserver(Arc<MapserverTarget>),
    Postgis(Arc<PostgisTarget>),
    Composite(Arc<CompositeTarget>),
}

impl ServerInstance {
    pub fn server(&self) -> &dyn TargetServer {
        match self {
            ServerInstance::Geoserver(t) => t.as_ref(),
            ServerInstance::Geonetwork(t) => t.as_ref(),
            ServerInstance::Mapserver(t) => t.as_ref(),
            ServerInstance::Postgis(t) => t.as_ref(),
            ServerInstance::Composite(t) => t.as_ref(),
        }
    }

    pub fn name(&self) -> &str {
        self.server().name()
    }

    pub fn data_catalog(&self) -> Option<Arc<dyn DataCatalog>> {
        match self {
            ServerInstance::Geoserver(t) => Some(t.clone()),
            ServerInstance::Mapserver(t) => Some(t.clone()),
            ServerInstance::Composite(t) if t.has_data_catalog() => Some(t.clone()),
            _ => None,
        }
    }

    pub fn meta_catalog(&self) -> Option<Arc<dyn MetaCatalog>> {
        match self {
            ServerInstance::Geonetwork(t) => Some(t.clone()),
            ServerInstance::Composite(t) if t.has_meta_catalog() => Some(t.clone()),
            _ => None,
        }
    }

    pub fn db_target(&self) -> Option<Arc<dyn DbTarget>> {
        match self {
            ServerInstance::Postgis(t) => Some(t.clone()),
            ServerInstance::Composite(t) if t.has_db_target() => Some(t.clone()),
            _ => None,
        }
    }

    pub fn is_data_catalog(&self) -> bool {
        self.data_catalog().is_some()
    }

    pub fn is_meta_catalog(&self) -> bool {
        self.meta_catalog().is_some()
    }

    pub fn is_db_target(&self) -> bool {
        self.db_target().is_some()
    }
}

//! Composite target pairing a data catalog with a metadata catalog (and
//! optionally a database) behind one instance, so a hosted stack with a
//! GeoServer and a GeoNetwork under one account is configured once and
//! addressed by one name. Every role method delegates to the sub-target
//! holding that role.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::errors::{PublishError, PublishResult};
use crate::layers::{DatabaseSource, LayerRef};
use crate::project::LayerGroup;

use super::{DataCatalog, DbTarget, MetaCatalog, TargetServer, TargetSettings};

pub const TYPE_NAME: &str = "composite";

pub struct CompositeTarget {
    name: String,
    data: Option<Arc<dyn DataCatalog>>,
    meta: Option<Arc<dyn MetaCatalog>>,
    db: Option<Arc<dyn DbTarget>>,
}

impl CompositeTarget {
    pub fn new(
        name: impl Into<String>,
        data: Option<Arc<dyn DataCatalog>>,
        meta: Option<Arc<dyn MetaCatalog>>,
        db: Option<Arc<dyn DbTarget>>,
    ) -> Self {
        Self {
            name: name.into(),
            data,
            meta,
            db,
        }
    }

    pub fn has_data_catalog(&self) -> bool {
        self.data.is_some()
    }

    pub fn has_meta_catalog(&self) -> bool {
        self.meta.is_some()
    }

    pub fn has_db_target(&self) -> bool {
        self.db.is_some()
    }

    fn data(&self) -> PublishResult<&Arc<dyn DataCatalog>> {
        self.data.as_ref().ok_or_else(|| {
            PublishError::Unsupported(format!("'{}' has no data catalog", self.name))
        })
    }

    fn meta(&self) -> PublishResult<&Arc<dyn MetaCatalog>> {
        self.meta.as_ref().ok_or_else(|| {
            PublishError::Unsupported(format!("'{}' has no metadata catalog", self.name))
        })
    }

    fn db(&self) -> PublishResult<&Arc<dyn DbTarget>> {
        self.db.as_ref().ok_or_else(|| {
            PublishError::Unsupported(format!("'{}' has no database target", self.name))
        })
    }
}

#[async_trait]
impl TargetServer for CompositeTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_label(&self) -> &'static str {
        "Composite"
    }

    fn settings(&self) -> TargetSettings {
        let part = |t: Option<&TargetSettings>| match t {
            Some(s) => json!({ "type_name": s.type_name, "settings": s.settings }),
            None => Value::Null,
        };
        let data = self.data.as_ref().map(|t| t.settings());
        let meta = self.meta.as_ref().map(|t| t.settings());
        let db = self.db.as_ref().map(|t| t.settings());
        TargetSettings {
            type_name: TYPE_NAME.to_string(),
            settings: json!({
                "name": self.name,
                "data": part(data.as_ref()),
                "meta": part(meta.as_ref()),
                "db": part(db.as_ref()),
            }),
        }
    }

    async fn test_connection(&self, errors: &mut BTreeSet<String>) -> bool {
        let mut ok = true;
        if let Some(data) = &self.data {
            ok &= data.test_connection(errors).await;
        }
        if let Some(meta) = &self.meta {
            ok &= meta.test_connection(errors).await;
        }
        if let Some(db) = &self.db {
            ok &= db.test_connection(errors).await;
        }
        ok
    }
}

#[async_trait]
impl DataCatalog for CompositeTarget {
    async fn prepare_for_publishing(&self, only_symbology: bool) -> PublishResult<()> {
        self.data()?.prepare_for_publishing(only_symbology).await
    }

    async fn publish_style(&self, layer: &LayerRef) -> PublishResult<()> {
        self.data()?.publish_style(layer).await
    }

    async fn publish_layer(&self, layer: &LayerRef, fields: &[String]) -> PublishResult<()> {
        self.data()?.publish_layer(layer, fields).await
    }

    async fn layer_exists(&self, name: &str) -> PublishResult<bool> {
        self.data()?.layer_exists(name).await
    }

    async fn style_exists(&self, name: &str) -> PublishResult<bool> {
        self.data()?.style_exists(name).await
    }

    async fn delete_layer(&self, name: &str) -> PublishResult<bool> {
        self.data()?.delete_layer(name).await
    }

    async fn delete_style(&self, name: &str) -> PublishResult<bool> {
        self.data()?.delete_style(name).await
    }

    async fn create_groups(&self, groups: &[LayerGroup]) -> PublishResult<()> {
        self.data()?.create_groups(groups).await
    }

    async fn close_publishing(&self, published: &[String]) -> PublishResult<()> {
        self.data()?.close_publishing(published).await
    }

    fn full_layer_name(&self, layer_name: &str) -> String {
        match self.data.as_ref() {
            Some(data) => data.full_layer_name(layer_name),
            None => layer_name.to_string(),
        }
    }

    fn wms_url(&self) -> Option<String> {
        self.data.as_ref().and_then(|d| d.wms_url())
    }

    fn wfs_url(&self) -> Option<String> {
        self.data.as_ref().and_then(|d| d.wfs_url())
    }

    fn preview_url(&self, layer_names: &[String], bbox: &str, srs: &str) -> Option<String> {
        self.data
            .as_ref()
            .and_then(|d| d.preview_url(layer_names, bbox, srs))
    }
}

#[async_trait]
impl MetaCatalog for CompositeTarget {
    async fn publish_layer_metadata(
        &self,
        layer: &LayerRef,
        wms_url: Option<&str>,
        wfs_url: Option<&str>,
        linked_name: Option<&str>,
    ) -> PublishResult<()> {
        self.meta()?
            .publish_layer_metadata(layer, wms_url, wfs_url, linked_name)
            .await
    }

    async fn metadata_exists(&self, id: &str) -> PublishResult<bool> {
        self.meta()?.metadata_exists(id).await
    }

    async fn delete_metadata(&self, id: &str) -> PublishResult<()> {
        self.meta()?.delete_metadata(id).await
    }

    fn metadata_url(&self, id: &str) -> String {
        match self.meta.as_ref() {
            Some(meta) => meta.metadata_url(id),
            None => String::new(),
        }
    }
}

#[async_trait]
impl DbTarget for CompositeTarget {
    async fn import_layer(&self, layer: &LayerRef, fields: &[String]) -> PublishResult<()> {
        self.db()?.import_layer(layer, fields).await
    }

    fn source_for(&self, layer: &LayerRef) -> DatabaseSource {
        match self.db.as_ref() {
            Some(db) => db.source_for(layer),
            None => DatabaseSource {
                host: String::new(),
                port: 0,
                database: String::new(),
                schema: String::new(),
                table: layer.web_slug(),
                auth_ref: None,
            },
        }
    }
}

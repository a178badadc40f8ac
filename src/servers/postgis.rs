//! PostGIS database target.
//!
//! Holds connection settings and delegates the actual table write to the
//! [`LayerExporter`] collaborator, which owns the database driver. The
//! target's job is naming: deciding which schema-qualified table a layer
//! lands in and describing that table to data catalogs that want to
//! reference it.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::collab::Collaborators;
use crate::errors::PublishResult;
use crate::layers::{DatabaseSource, LayerRef};

use super::{DbTarget, TargetServer, TargetSettings};

pub const TYPE_NAME: &str = "postgis";

fn default_port() -> u16 {
    5432
}

fn default_schema() -> String {
    "public".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PostgisSettings {
    pub name: String,
    #[serde(default)]
    pub authid: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    #[serde(default = "default_schema")]
    pub schema: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

pub struct PostgisTarget {
    settings: PostgisSettings,
    collab: Collaborators,
}

impl PostgisTarget {
    pub fn new(settings: PostgisSettings, collab: &Collaborators) -> Self {
        Self {
            settings,
            collab: collab.clone(),
        }
    }

    pub fn from_settings(value: &Value, collab: &Collaborators) -> PublishResult<Self> {
        let settings: PostgisSettings = serde_json::from_value(value.clone())?;
        Ok(Self::new(settings, collab))
    }

    /// Schema-qualified table name the given layer maps to.
    pub fn qualified_table_name(&self, layer: &LayerRef) -> String {
        self.source_for(layer).qualified_table()
    }
}

#[async_trait]
impl TargetServer for PostgisTarget {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn type_label(&self) -> &'static str {
        "PostGIS"
    }

    fn settings(&self) -> TargetSettings {
        TargetSettings {
            type_name: TYPE_NAME.to_string(),
            settings: serde_json::to_value(&self.settings).unwrap_or(Value::Null),
        }
    }

    async fn test_connection(&self, errors: &mut BTreeSet<String>) -> bool {
        // The database driver lives in the exporter collaborator, so only
        // the settings themselves can be checked here.
        let mut ok = true;
        if self.settings.host.is_empty() {
            errors.insert(format!("server '{}' has no host configured", self.settings.name));
            ok = false;
        }
        if self.settings.database.is_empty() {
            errors.insert(format!(
                "server '{}' has no database configured",
                self.settings.name
            ));
            ok = false;
        }
        ok
    }
}

#[async_trait]
impl DbTarget for PostgisTarget {
    /// Imports a vector layer, replacing any existing table of the same
    /// name.
    async fn import_layer(&self, layer: &LayerRef, fields: &[String]) -> PublishResult<()> {
        let target = self.source_for(layer);
        self.collab
            .exporter
            .write_database_table(layer, fields, &target)
            .await?;
        info!(
            "imported layer '{}' into {}",
            layer.name,
            target.qualified_table()
        );
        Ok(())
    }

    fn source_for(&self, layer: &LayerRef) -> DatabaseSource {
        DatabaseSource {
            host: self.settings.host.clone(),
            port: self.settings.port,
            database: self.settings.database.clone(),
            schema: self.settings.schema.clone(),
            table: layer.web_slug(),
            auth_ref: self.settings.authid.clone(),
        }
    }
}

//! Registry of configured target instances.
//!
//! Instances are keyed by their user-given name and persisted as a JSON
//! array of `[type_name, settings]` pairs, preserving insertion order.
//! Before anything is written, every instance's settings are round-tripped
//! through the reconstruction factory; instances whose settings cannot
//! rebuild an equivalent target are dropped from the registry and reported
//! rather than persisted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{error, warn};

use crate::collab::Collaborators;
use crate::errors::{RegistryError, RegistryResult};

use super::{
    composite, geonetwork, geoserver, mapserver, postgis, CompositeTarget, DataCatalog, DbTarget,
    GeonetworkTarget, GeoserverStorage, GeoserverTarget, MapserverTarget, MetaCatalog,
    PostgisTarget, ServerInstance, TargetServer, TargetSettings,
};

pub struct ServerRegistry {
    path: PathBuf,
    collab: Collaborators,
    instances: IndexMap<String, ServerInstance>,
}

impl ServerRegistry {
    pub fn new(path: impl Into<PathBuf>, collab: Collaborators) -> Self {
        Self {
            path: path.into(),
            collab,
            instances: IndexMap::new(),
        }
    }

    /// Loads the registry file, skipping entries that cannot be
    /// reconstructed. A missing file yields an empty registry.
    pub fn load(path: impl Into<PathBuf>, collab: Collaborators) -> RegistryResult<Self> {
        let mut registry = Self::new(path, collab);
        if !registry.path.exists() {
            return Ok(registry);
        }
        let text = std::fs::read_to_string(&registry.path)?;
        let entries: Vec<(String, Value)> = serde_json::from_str(&text)?;
        for (type_name, settings) in entries {
            let parsed = TargetSettings {
                type_name: type_name.clone(),
                settings,
            };
            match registry.reconstruct(&parsed) {
                Ok(instance) => {
                    registry
                        .instances
                        .insert(instance.name().to_string(), instance);
                }
                Err(e) => {
                    error!("failed to load a '{}' entry: {}", type_name, e);
                }
            }
        }
        registry.resolve_links();
        Ok(registry)
    }

    /// Builds a target instance from persisted settings.
    pub fn reconstruct(&self, settings: &TargetSettings) -> RegistryResult<ServerInstance> {
        let build = |e: crate::errors::PublishError| RegistryError::Reconstruction {
            type_name: settings.type_name.clone(),
            reason: e.to_string(),
        };
        match settings.type_name.as_str() {
            geoserver::TYPE_NAME => Ok(ServerInstance::Geoserver(Arc::new(
                GeoserverTarget::from_settings(&settings.settings, &self.collab).map_err(build)?,
            ))),
            geonetwork::TYPE_NAME => Ok(ServerInstance::Geonetwork(Arc::new(
                GeonetworkTarget::from_settings(&settings.settings, &self.collab).map_err(build)?,
            ))),
            mapserver::TYPE_NAME => Ok(ServerInstance::Mapserver(Arc::new(
                MapserverTarget::from_settings(&settings.settings, &self.collab).map_err(build)?,
            ))),
            postgis::TYPE_NAME => Ok(ServerInstance::Postgis(Arc::new(
                PostgisTarget::from_settings(&settings.settings, &self.collab).map_err(build)?,
            ))),
            composite::TYPE_NAME => self.reconstruct_composite(&settings.settings),
            other => Err(RegistryError::UnknownType(other.to_string())),
        }
    }

    fn reconstruct_composite(&self, settings: &Value) -> RegistryResult<ServerInstance> {
        let name = settings
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RegistryError::Reconstruction {
                type_name: composite::TYPE_NAME.to_string(),
                reason: "composite settings carry no name".to_string(),
            })?
            .to_string();
        let part = |key: &str| -> RegistryResult<Option<ServerInstance>> {
            let Some(sub) = settings.get(key).filter(|v| !v.is_null()) else {
                return Ok(None);
            };
            let parsed: TargetSettings = serde_json::from_value(sub.clone())?;
            Ok(Some(self.reconstruct(&parsed)?))
        };
        let data = part("data")?.and_then(|i| i.data_catalog());
        let meta = part("meta")?.and_then(|i| i.meta_catalog());
        let db = part("db")?.and_then(|i| i.db_target());
        Ok(ServerInstance::Composite(Arc::new(CompositeTarget::new(
            name, data, meta, db,
        ))))
    }

    /// Attaches referenced database targets to data catalogs that use
    /// managed database storage.
    fn resolve_links(&mut self) {
        let mut links = Vec::new();
        for (name, instance) in &self.instances {
            if let ServerInstance::Geoserver(gs) = instance {
                if gs.storage() == GeoserverStorage::ManagedDb {
                    if let Some(db_name) = gs.settings().settings.get("postgisdb").and_then(Value::as_str) {
                        links.push((name.clone(), db_name.to_string()));
                    }
                }
            }
        }
        for (gs_name, db_name) in links {
            let db = self
                .instances
                .get(&db_name)
                .and_then(|i| i.db_target());
            match (self.instances.get(&gs_name), db) {
                (Some(ServerInstance::Geoserver(gs)), Some(db)) => gs.attach_db_target(db),
                _ => warn!(
                    "server '{}' references database target '{}', which is not configured",
                    gs_name, db_name
                ),
            }
        }
    }

    /// Serializes the current instances after verifying that each one can
    /// be rebuilt from its own settings. Entries failing the round trip are
    /// removed and their names returned alongside the serialized form.
    fn serializable_entries(&mut self) -> (Vec<(String, Value)>, Vec<String>) {
        let mut entries = Vec::new();
        let mut dropped = Vec::new();
        for (name, instance) in &self.instances {
            let settings = instance.server().settings();
            match self.reconstruct(&settings) {
                Ok(_) => entries.push((settings.type_name, settings.settings)),
                Err(e) => {
                    error!("settings of '{}' do not reconstruct, dropping it: {}", name, e);
                    dropped.push(name.clone());
                }
            }
        }
        for name in &dropped {
            self.instances.shift_remove(name);
        }
        (entries, dropped)
    }

    /// Writes the registry file. Instances whose settings fail the
    /// self-consistency check are dropped before writing.
    pub fn persist(&mut self) -> RegistryResult<Vec<String>> {
        let (entries, dropped) = self.serializable_entries();
        let text = serde_json::to_string_pretty(&entries)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, text)?;
        Ok(dropped)
    }

    /// Adds or replaces an instance and persists the registry.
    ///
    /// `previous_key` names the entry being edited: saving under a new name
    /// replaces that entry instead of colliding with it. When persistence
    /// fails the in-memory registry is rolled back.
    pub fn save(
        &mut self,
        instance: ServerInstance,
        previous_key: Option<&str>,
    ) -> RegistryResult<()> {
        let name = instance.name().to_string();
        if self.instances.contains_key(&name) && previous_key != Some(name.as_str()) {
            return Err(RegistryError::NameCollision(name));
        }

        // Instances are cheap to clone (shared handles), so rolling back is
        // restoring the snapshot, keeping the original entry order intact
        let snapshot = self.instances.clone();
        if let Some(key) = previous_key {
            self.instances.shift_remove(key);
        }
        self.instances.insert(name, instance);

        if let Err(e) = self.persist() {
            self.instances = snapshot;
            return Err(e);
        }
        self.resolve_links();
        Ok(())
    }

    /// Removes the named instance and persists the registry.
    pub fn remove(&mut self, name: &str) -> RegistryResult<()> {
        if self.instances.shift_remove(name).is_none() {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        self.persist()?;
        Ok(())
    }

    /// A name not yet taken by any instance: `base`, `base2`, `base3`...
    pub fn unique_name(&self, base: &str) -> String {
        if !self.instances.contains_key(base) {
            return base.to_string();
        }
        let mut i = 2;
        loop {
            let candidate = format!("{base}{i}");
            if !self.instances.contains_key(&candidate) {
                return candidate;
            }
            i += 1;
        }
    }

    pub fn get(&self, name: &str) -> Option<&ServerInstance> {
        self.instances.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.instances.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ServerInstance)> {
        self.instances.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn geodata_target(&self, name: &str) -> Option<Arc<dyn DataCatalog>> {
        self.get(name).and_then(|i| i.data_catalog())
    }

    pub fn metadata_target(&self, name: &str) -> Option<Arc<dyn MetaCatalog>> {
        self.get(name).and_then(|i| i.meta_catalog())
    }

    pub fn db_target(&self, name: &str) -> Option<Arc<dyn DbTarget>> {
        self.get(name).and_then(|i| i.db_target())
    }

    #[cfg(test)]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

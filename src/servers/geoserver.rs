//! GeoServer data catalog target.
//!
//! Talks to the GeoServer REST API. Three vector storage modes are
//! supported: uploading a GeoPackage into a file-based datastore, writing
//! the table to a managed database target and referencing it, and handing a
//! zipped export to the GeoServer Importer extension which ingests it into
//! a PostGIS datastore on the server side. Rasters become GeoTIFF coverage
//! stores. All publication happens inside one workspace per project.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::collab::Collaborators;
use crate::errors::{PublishError, PublishResult};
use crate::export::ArtifactConsolidator;
use crate::layers::{DatabaseSource, LayerRef};
use crate::naming;
use crate::project::{GroupMember, LayerGroup};
use crate::rest::RestClient;

use super::{DataCatalog, DbTarget, TargetServer, TargetSettings};

pub const TYPE_NAME: &str = "geoserver";

const VT_MIME: &str = "application/vnd.mapbox-vector-tile";

/// Where layer data ends up on the server.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GeoserverStorage {
    /// Uploaded GeoPackage, one file-based datastore per container
    #[default]
    FileBased,
    /// Table written by a configured database target, then referenced
    ManagedDb,
    /// Zipped upload ingested into PostGIS by the Importer extension
    ImportedDb,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GeoserverSettings {
    pub name: String,
    #[serde(default)]
    pub authid: Option<String>,
    pub url: String,
    #[serde(default)]
    pub storage: GeoserverStorage,
    /// Database target name (managed_db) or `workspace:datastore` template
    /// reference (imported_db)
    #[serde(default)]
    pub postgisdb: Option<String>,
    /// Reference the layer's own database source instead of uploading data
    #[serde(default, rename = "useOriginalDataSource")]
    pub use_original_data_source: bool,
    #[serde(default, rename = "useVectorTiles")]
    pub use_vector_tiles: bool,
    #[serde(default)]
    pub workspace: Option<String>,
}

/// Splits a base URL into `(base, api)` where `api` always ends in `/rest`.
/// Accepts both plain base URLs and URLs that already point at the API.
fn fix_rest_url(url: &str) -> (String, String) {
    let trimmed = url.trim_end_matches('/');
    if let Some(base) = trimmed.strip_suffix("/rest") {
        (base.to_string(), trimmed.to_string())
    } else {
        (trimmed.to_string(), format!("{trimmed}/rest"))
    }
}

fn round5(v: f64) -> f64 {
    (v * 100_000.0).round() / 100_000.0
}

/// Connection parameter entry in GeoServer's datastore JSON dialect.
fn connection_param(key: &str, value: &str) -> Value {
    json!({ "@key": key, "$": value })
}

/// Per-run mutable state: lazily fetched remote name lists and the mapping
/// from requested layer slugs to the names the server actually assigned.
#[derive(Default)]
struct WorkspaceState {
    layers: Option<Vec<String>>,
    styles: Option<Vec<String>>,
    slug_map: HashMap<String, String>,
}

pub struct GeoserverTarget {
    settings: GeoserverSettings,
    base_url: String,
    api_url: String,
    client: RestClient,
    collab: Collaborators,
    /// Effective workspace; starts as the configured one, a run may
    /// override it with the project name.
    workspace: RwLock<Option<String>>,
    state: RwLock<WorkspaceState>,
    db: RwLock<Option<Arc<dyn DbTarget>>>,
    consolidator: Mutex<Option<ArtifactConsolidator>>,
}

impl GeoserverTarget {
    pub fn new(settings: GeoserverSettings, collab: &Collaborators) -> Self {
        let (base_url, api_url) = fix_rest_url(&settings.url);
        let transport = collab.transport_for(settings.authid.as_deref());
        let workspace = RwLock::new(settings.workspace.clone());
        Self {
            settings,
            base_url,
            api_url,
            client: RestClient::new(transport),
            collab: collab.clone(),
            workspace,
            state: RwLock::new(WorkspaceState::default()),
            db: RwLock::new(None),
            consolidator: Mutex::new(None),
        }
    }

    pub fn from_settings(value: &Value, collab: &Collaborators) -> PublishResult<Self> {
        let settings: GeoserverSettings = serde_json::from_value(value.clone())?;
        super::check_base_url(&settings.url)?;
        Ok(Self::new(settings, collab))
    }

    pub fn storage(&self) -> GeoserverStorage {
        self.settings.storage
    }

    /// Wires the database target used by managed database storage. Called
    /// by the registry when the referenced target is available.
    pub fn attach_db_target(&self, db: Arc<dyn DbTarget>) {
        if let Ok(mut slot) = self.db.write() {
            *slot = Some(db);
        }
    }

    #[cfg(test)]
    pub(crate) fn has_attached_db(&self) -> bool {
        self.db.read().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Attaches the run-scoped consolidator so layers sharing a source can
    /// share one uploaded container.
    pub async fn attach_consolidator(&self, consolidator: ArtifactConsolidator) {
        *self.consolidator.lock().await = Some(consolidator);
    }

    /// Overrides the workspace for the current run, typically with the
    /// project file stem.
    pub fn force_workspace(&self, workspace: &str) -> PublishResult<()> {
        if !naming::is_valid_name(workspace) {
            return Err(PublishError::Config(format!(
                "'{workspace}' is not a valid workspace name"
            )));
        }
        if let Ok(mut slot) = self.workspace.write() {
            *slot = Some(workspace.to_string());
        }
        if let Ok(mut state) = self.state.write() {
            *state = WorkspaceState::default();
        }
        Ok(())
    }

    pub fn has_workspace(&self) -> bool {
        self.workspace
            .read()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    fn workspace(&self) -> PublishResult<String> {
        self.workspace
            .read()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or_else(|| PublishError::Config("no workspace configured".to_string()))
    }

    fn db_target(&self) -> PublishResult<Arc<dyn DbTarget>> {
        self.db
            .read()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or_else(|| {
                PublishError::Config(format!(
                    "no database target attached to '{}'",
                    self.settings.name
                ))
            })
    }

    fn invalidate(&self) {
        if let Ok(mut state) = self.state.write() {
            state.layers = None;
            state.styles = None;
        }
    }

    fn remember_slug(&self, requested: String, assigned: String) {
        if let Ok(mut state) = self.state.write() {
            state.slug_map.insert(requested, assigned);
        }
    }

    fn assigned_name(&self, requested: &str) -> Option<String> {
        self.state
            .read()
            .ok()
            .and_then(|state| state.slug_map.get(requested).cloned())
    }

    /// Fetches `{category}s -> {category} -> [{name}]` lists, the shape all
    /// GeoServer collection endpoints share.
    async fn fetch_names(&self, url: &str, category: &str) -> PublishResult<Vec<String>> {
        let body = self.client.get_value(url).await?;
        let items = body
            .get(format!("{category}s"))
            .and_then(|v| v.get(category))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(items
            .iter()
            .filter_map(|item| item.get("name").and_then(Value::as_str).map(String::from))
            .collect())
    }

    async fn remote_layer_names(&self) -> PublishResult<Vec<String>> {
        if let Ok(state) = self.state.read() {
            if let Some(names) = &state.layers {
                return Ok(names.clone());
            }
        }
        let workspace = self.workspace()?;
        let url = format!("{}/workspaces/{}/layers.json", self.api_url, workspace);
        let names = self.fetch_names(&url, "layer").await?;
        if let Ok(mut state) = self.state.write() {
            state.layers = Some(names.clone());
        }
        Ok(names)
    }

    async fn remote_style_names(&self) -> PublishResult<Vec<String>> {
        if let Ok(state) = self.state.read() {
            if let Some(names) = &state.styles {
                return Ok(names.clone());
            }
        }
        let workspace = self.workspace()?;
        let url = format!("{}/workspaces/{}/styles.json", self.api_url, workspace);
        let names = self.fetch_names(&url, "style").await?;
        if let Ok(mut state) = self.state.write() {
            state.styles = Some(names.clone());
        }
        Ok(names)
    }

    /// Maps a requested layer name to the name present on the server, if
    /// any. Handles names the server suffixed with a number during import.
    async fn resolve_remote_name(&self, name: &str) -> PublishResult<Option<String>> {
        if let Some(assigned) = self.assigned_name(name) {
            return Ok(Some(assigned));
        }
        let remote = self.remote_layer_names().await?;
        if remote.iter().any(|r| r == name) {
            return Ok(Some(name.to_string()));
        }
        Ok(remote.into_iter().find(|r| {
            r.strip_prefix(name)
                .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false)
        }))
    }

    async fn workspace_exists(&self) -> PublishResult<bool> {
        let workspace = self.workspace()?;
        let url = format!("{}/workspaces.json", self.api_url);
        let names = self.fetch_names(&url, "workspace").await?;
        Ok(names.contains(&workspace))
    }

    async fn create_workspace(&self) -> PublishResult<()> {
        let workspace = self.workspace()?;
        let url = format!("{}/workspaces", self.api_url);
        self.client
            .post_json(&url, &json!({ "workspace": { "name": workspace } }))
            .await?;
        Ok(())
    }

    async fn ensure_workspace_exists(&self) -> PublishResult<()> {
        if !self.workspace_exists().await? {
            self.create_workspace().await?;
        }
        Ok(())
    }

    async fn datastore_exists(&self, name: &str) -> PublishResult<bool> {
        let workspace = self.workspace()?;
        let url = format!("{}/workspaces/{}/datastores.json", self.api_url, workspace);
        let names = self.fetch_names(&url, "dataStore").await?;
        Ok(names.iter().any(|n| n == name))
    }

    async fn delete_datastore(&self, name: &str) -> PublishResult<()> {
        let workspace = self.workspace()?;
        let url = format!(
            "{}/workspaces/{}/datastores/{}?recurse=true",
            self.api_url, workspace, name
        );
        self.client.delete_absent_ok(&url).await?;
        Ok(())
    }

    /// Feature type (or coverage) property body for PUT requests. Bounding
    /// boxes are rounded to 5 decimals, which is what the server stores.
    fn feature_type_props(
        &self,
        layer: &LayerRef,
        bounding_box: bool,
        extra: &[(&str, Value)],
    ) -> Value {
        let mut props = json!({
            "name": layer.web_slug(),
            "title": layer.metadata.title.clone().unwrap_or_else(|| layer.name.clone()),
            "abstract": layer.metadata.abstract_text.clone().unwrap_or_default(),
            "keywords": { "string": layer.metadata.keywords.clone() }
        });
        if bounding_box {
            props["nativeBoundingBox"] = json!({
                "minx": round5(layer.extent.xmin),
                "maxx": round5(layer.extent.xmax),
                "miny": round5(layer.extent.ymin),
                "maxy": round5(layer.extent.ymax),
                "crs": layer.crs
            });
        }
        if let Some(obj) = props.as_object_mut() {
            for (key, value) in extra {
                obj.insert((*key).to_string(), value.clone());
            }
        }
        json!({ "featureType": props })
    }

    /// Produces the vector artifact for a layer: the shared container when
    /// the consolidator covers it, an independent export otherwise.
    async fn vector_artifact(
        &self,
        layer: &LayerRef,
        fields: &[String],
        extension: &str,
    ) -> PublishResult<(PathBuf, bool)> {
        let mut guard = self.consolidator.lock().await;
        if let Some(consolidator) = guard.as_mut() {
            let outcome = consolidator.export(layer).await;
            if let Some(container) = outcome.container {
                return Ok((container, outcome.first_export));
            }
        }
        drop(guard);
        let target = self
            .collab
            .work_dir
            .join(format!("{}.{}", layer.file_slug(), extension));
        self.collab
            .exporter
            .export_vector(layer, fields, &target)
            .await?;
        Ok((target, true))
    }

    async fn publish_vector_from_geopackage(
        &self,
        layer: &LayerRef,
        fields: &[String],
    ) -> PublishResult<()> {
        let workspace = self.workspace()?;
        let (artifact, first_export) = self.vector_artifact(layer, fields, "gpkg").await?;
        let ds_name = artifact
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| layer.web_slug());

        if first_export || !self.datastore_exists(&ds_name).await? {
            self.delete_datastore(&ds_name).await?;
            let bytes = tokio::fs::read(&artifact).await?;
            let url = format!(
                "{}/workspaces/{}/datastores/{}/file.gpkg?update=overwrite",
                self.api_url, workspace, ds_name
            );
            self.client
                .put_bytes(&url, bytes, "application/octet-stream")
                .await?;
            info!(
                "created datastore '{}' from '{}'",
                ds_name,
                artifact.display()
            );
            self.mark_datastore_read_only(&ds_name).await;
        }

        // The upload registers one feature type per table; update its
        // descriptive properties, creating it if registration was skipped.
        let ft = self.feature_type_props(layer, true, &[]);
        let ft_url = format!(
            "{}/workspaces/{}/datastores/{}/featuretypes/{}.json",
            self.api_url,
            workspace,
            ds_name,
            layer.web_slug()
        );
        match self.client.get_value(&ft_url).await {
            Ok(_) => {
                self.client.put_json(&ft_url, &ft).await?;
            }
            Err(e) if e.is_missing() => {
                let create_url = format!(
                    "{}/workspaces/{}/datastores/{}/featuretypes.json",
                    self.api_url, workspace, ds_name
                );
                self.client.post_json(&create_url, &ft).await?;
            }
            Err(e) => return Err(e.into()),
        }
        self.invalidate();
        self.set_layer_style(&layer.web_slug(), None).await?;
        Ok(())
    }

    /// Marks an uploaded GeoPackage datastore read-only. Best-effort: the
    /// layer is already published when this runs.
    async fn mark_datastore_read_only(&self, ds_name: &str) {
        let result: PublishResult<()> = async {
            let workspace = self.workspace()?;
            let url = format!(
                "{}/workspaces/{}/datastores/{}.json",
                self.api_url, workspace, ds_name
            );
            let body = self.client.get_value(&url).await?;
            let entries = body
                .pointer("/dataStore/connectionParameters/entry")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let already = entries
                .iter()
                .any(|e| e.get("@key").and_then(Value::as_str) == Some("read_only"));
            if !already {
                let mut entries = entries;
                entries.push(connection_param("read_only", "true"));
                let patch = json!({
                    "dataStore": { "connectionParameters": { "entry": entries } }
                });
                self.client.put_json(&url, &patch).await?;
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!("failed to set read_only on datastore '{}': {}", ds_name, e);
        }
    }

    /// Publishes a vector layer by referencing a database table directly:
    /// creates a PostGIS datastore pointing at the table's connection and a
    /// feature type on top of it.
    async fn publish_vector_from_database(
        &self,
        layer: &LayerRef,
        source: &DatabaseSource,
    ) -> PublishResult<()> {
        let workspace = self.workspace()?;
        let (user, pass) = source
            .auth_ref
            .as_deref()
            .and_then(|r| self.collab.credentials.resolve(r))
            .unwrap_or_default();

        let datastore = json!({
            "dataStore": {
                "name": layer.web_slug(),
                "type": "PostGIS",
                "enabled": true,
                "connectionParameters": {
                    "entry": [
                        connection_param("schema", &source.schema),
                        connection_param("port", &source.port.to_string()),
                        connection_param("database", &source.database),
                        connection_param("passwd", &pass),
                        connection_param("user", &user),
                        connection_param("host", &source.host),
                        connection_param("dbtype", "postgis"),
                    ]
                }
            }
        });
        let ds_url = format!("{}/workspaces/{}/datastores", self.api_url, workspace);
        self.client.post_json(&ds_url, &datastore).await?;

        let ft = self.feature_type_props(layer, false, &[("srs", json!(layer.crs))]);
        let ft_url = format!(
            "{}/workspaces/{}/datastores/{}/featuretypes",
            self.api_url,
            workspace,
            layer.web_slug()
        );
        self.client.post_json(&ft_url, &ft).await?;
        self.invalidate();
        self.set_layer_style(&layer.web_slug(), None).await?;
        Ok(())
    }

    /// Finds enabled PostGIS datastores in the current workspace.
    async fn postgis_datastores(&self) -> PublishResult<Vec<String>> {
        let workspace = self.workspace()?;
        let list_url = format!("{}/workspaces/{}/datastores.json", self.api_url, workspace);
        let mut found = Vec::new();
        for name in self.fetch_names(&list_url, "dataStore").await? {
            let url = format!(
                "{}/workspaces/{}/datastores/{}.json",
                self.api_url, workspace, name
            );
            let ds = self.client.get_value(&url).await?;
            let enabled = ds
                .pointer("/dataStore/enabled")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let dbtype = ds
                .pointer("/dataStore/connectionParameters/entry")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .find(|e| e.get("@key").and_then(Value::as_str) == Some("dbtype"))
                .and_then(|e| e.get("$").and_then(Value::as_str))
                .unwrap_or("")
                .to_string();
            if enabled && dbtype.starts_with("postgis") {
                found.push(name);
            }
        }
        Ok(found)
    }

    /// Returns the PostGIS datastore for the workspace, copying it from the
    /// configured `workspace:datastore` template when the workspace has
    /// none yet. The created datastore is named after the workspace.
    async fn ensure_postgis_datastore(&self) -> PublishResult<String> {
        if let Some(existing) = self.postgis_datastores().await?.into_iter().next() {
            return Ok(existing);
        }
        let workspace = self.workspace()?;
        let reference = self.settings.postgisdb.as_deref().ok_or_else(|| {
            PublishError::Config("no datastore template configured".to_string())
        })?;
        let (template_ws, template_ds) = reference.split_once(':').ok_or_else(|| {
            PublishError::Config(format!(
                "datastore reference '{reference}' is not of the form workspace:datastore"
            ))
        })?;

        let url = format!(
            "{}/workspaces/{}/datastores/{}.json",
            self.api_url, template_ws, template_ds
        );
        let mut datastore = self.client.get_value(&url).await?;
        datastore["dataStore"]["name"] = json!(workspace);
        datastore["dataStore"]["workspace"] = json!({
            "name": workspace,
            "href": format!("{}/workspaces/{}.json", self.api_url, workspace)
        });
        datastore["dataStore"]["featureTypes"] = json!(format!(
            "{}/workspaces/{}/datastores/{}/featuretypes.json",
            self.api_url, workspace, workspace
        ));
        if let Some(params) = datastore.pointer_mut("/dataStore/connectionParameters") {
            self.fix_namespace_param(params).await?;
        }
        let post_url = format!("{}/workspaces/{}/datastores.json", self.api_url, workspace);
        self.client.post_json(&post_url, &datastore).await?;
        Ok(workspace)
    }

    /// Publishes a vector layer through the Importer extension: upload a
    /// zipped export, reassign the PostGIS datastore as target, execute,
    /// then poll the task result. Import failures are soft errors scoped to
    /// the layer.
    async fn publish_vector_via_importer(
        &self,
        layer: &LayerRef,
        fields: &[String],
    ) -> PublishResult<()> {
        let workspace = self.workspace()?;
        let target = self
            .collab
            .work_dir
            .join(format!("{}.zip", layer.file_slug()));
        self.collab
            .exporter
            .export_vector(layer, fields, &target)
            .await?;
        let datastore = self.ensure_postgis_datastore().await?;

        let body = json!({
            "import": {
                "targetStore": { "dataStore": { "name": datastore } },
                "targetWorkspace": { "workspace": { "name": workspace } }
            }
        });
        let url = format!("{}/imports.json", self.api_url);
        let response = self.client.post_json(&url, &body).await?.value()?;
        let import_id = response
            .pointer("/import/id")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                PublishError::ImportWorkflow("import job response carries no id".to_string())
            })?;

        info!(
            "uploading layer '{}' as '{}' to import job {}",
            layer.name,
            target.display(),
            import_id
        );
        let bytes = tokio::fs::read(&target).await?;
        let url = format!("{}/imports/{}/tasks", self.api_url, import_id);
        let response = self
            .client
            .post_bytes(&url, bytes, "application/octet-stream")
            .await?
            .value()?;
        let task_id = response
            .pointer("/task/id")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                PublishError::ImportWorkflow("import task response carries no id".to_string())
            })?;

        // The upload resets the task target to a file store; point it back
        // at the PostGIS datastore before executing.
        let url = format!(
            "{}/imports/{}/tasks/{}/target.json",
            self.api_url, import_id, task_id
        );
        self.client
            .put_json(&url, &json!({ "dataStore": { "name": datastore } }))
            .await?;

        let url = format!("{}/imports/{}", self.api_url, import_id);
        self.client.post_bytes(&url, Vec::new(), "application/json").await?;

        let (error, given_name) = self.import_result(import_id, task_id).await?;
        if let Some(message) = error {
            return Err(PublishError::ImportWorkflow(message));
        }
        let given_name = given_name.ok_or_else(|| {
            PublishError::ImportWorkflow("import task result carries no layer name".to_string())
        })?;

        // Confirm the feature type exists; absence means the import failed
        // without a task-level error message.
        let ft_url = format!(
            "{}/workspaces/{}/datastores/{}/featuretypes/{}.json",
            self.api_url, workspace, datastore, given_name
        );
        match self.client.get_value(&ft_url).await {
            Ok(_) => {}
            Err(e) if e.is_missing() => {
                return Err(PublishError::ImportWorkflow(format!(
                    "layer '{}' was not created as '{}'; check the server logs",
                    layer.name, given_name
                )));
            }
            Err(e) => return Err(e.into()),
        }

        // Update descriptions but leave the assigned name intact, so the
        // feature type keeps matching the database schema.
        let ft = self.feature_type_props(layer, false, &[("nativeName", json!(layer.web_slug()))]);
        self.client.put_json(&ft_url, &ft).await?;

        self.remember_slug(layer.web_slug(), given_name.clone());
        self.invalidate();

        if let Err(e) = self.fix_layer_style(&given_name, &layer.web_slug()).await {
            warn!("failed to clean up styles for '{}': {}", given_name, e);
        }
        info!("published layer '{}' as '{}'", layer.name, given_name);
        Ok(())
    }

    /// Error message (if any) and assigned layer name of an import task.
    async fn import_result(
        &self,
        import_id: u64,
        task_id: u64,
    ) -> PublishResult<(Option<String>, Option<String>)> {
        let url = format!("{}/imports/{}/tasks/{}", self.api_url, import_id, task_id);
        let body = self.client.get_value(&url).await?;
        let error = body
            .pointer("/task/errorMessage")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .map(|m| format!("importer error: {m}"));
        let name = body
            .pointer("/task/layer/name")
            .and_then(Value::as_str)
            .map(String::from);
        Ok((error, name))
    }

    async fn publish_raster(&self, layer: &LayerRef) -> PublishResult<()> {
        let workspace = self.workspace()?;
        self.ensure_workspace_exists().await?;
        let artifact = self
            .collab
            .exporter
            .export_raster(layer, &self.collab.work_dir)
            .await?;
        let bytes = tokio::fs::read(&artifact).await?;
        let url = format!(
            "{}/workspaces/{}/coveragestores/{}/file.geotiff?coverageName={}",
            self.api_url,
            workspace,
            layer.web_slug(),
            layer.web_slug()
        );
        self.client.put_bytes(&url, bytes, "image/tiff").await?;
        info!("created coverage from '{}'", artifact.display());
        self.invalidate();
        self.set_layer_style(&layer.web_slug(), None).await?;
        Ok(())
    }

    /// Uploads a style document, overwriting when the style already exists.
    async fn publish_style_file(&self, name: &str, path: &Path) -> PublishResult<()> {
        self.ensure_workspace_exists().await?;
        let workspace = self.workspace()?;
        let content_type = match path.extension().and_then(|e| e.to_str()) {
            Some("zip") => "application/zip",
            Some("mapbox") => "application/vnd.geoserver.mbstyle+json",
            _ => "application/vnd.ogc.sld+xml",
        };
        let bytes = tokio::fs::read(path).await?;

        let update = self.style_exists_inner(name).await?;
        let endpoint = format!("{}/workspaces/{}/styles", self.api_url, workspace);
        if update {
            self.client
                .put_bytes(&format!("{endpoint}/{name}"), bytes, content_type)
                .await?;
        } else {
            self.client
                .post_bytes(&format!("{endpoint}?name={name}"), bytes, content_type)
                .await?;
        }
        self.invalidate();
        info!(
            "{} style '{}' in workspace '{}'",
            if update { "updated" } else { "created" },
            name,
            workspace
        );
        Ok(())
    }

    async fn style_exists_inner(&self, name: &str) -> PublishResult<bool> {
        Ok(self.remote_style_names().await?.iter().any(|n| n == name))
    }

    /// Sets the default style of a layer to the workspace style of the same
    /// name (or `style_name` when given). Returns the previous default
    /// style object, or `None` when nothing was changed.
    async fn set_layer_style(
        &self,
        name: &str,
        style_name: Option<&str>,
    ) -> PublishResult<Option<Value>> {
        let workspace = self.workspace()?;
        let style_name = style_name.unwrap_or(name);
        let url = format!("{}/workspaces/{}/layers/{}.json", self.api_url, workspace, name);
        let mut layer_def = match self.client.get_value(&url).await {
            Ok(def) => def,
            Err(e) if e.is_missing() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !self.style_exists_inner(style_name).await? {
            warn!("style '{}' does not exist in workspace '{}'", style_name, workspace);
            return Ok(None);
        }

        let old_style = layer_def.pointer("/layer/defaultStyle").cloned();
        layer_def["layer"]["defaultStyle"] = json!({
            "name": format!("{workspace}:{style_name}"),
            "workspace": workspace,
            "href": format!("{}/workspaces/{}/styles/{}.json", self.api_url, workspace, style_name)
        });
        self.client.put_json(&url, &layer_def).await?;
        Ok(old_style)
    }

    /// Rebinds an imported layer to its intended style and removes the
    /// throwaway global style the Importer extension creates, leaving
    /// built-in styles alone.
    async fn fix_layer_style(&self, actual_name: &str, proper_name: &str) -> PublishResult<()> {
        let Some(old_style) = self.set_layer_style(actual_name, Some(proper_name)).await? else {
            return Ok(());
        };
        if old_style.get("workspace").map(|w| !w.is_null()).unwrap_or(false) {
            // Workspace-scoped style: keep it
            return Ok(());
        }
        let name = old_style
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_ascii_lowercase();
        if name.is_empty() || ["raster", "point", "polygon", "line", "generic"].contains(&name.as_str()) {
            return Ok(());
        }
        if let Some(href) = old_style.get("href").and_then(Value::as_str) {
            // May fail when the style is still referenced elsewhere
            if let Err(e) = self.client.delete(&format!("{href}?purge=true")).await {
                debug!("left style '{}' in place: {}", name, e);
            }
        }
        Ok(())
    }

    /// Fixes the `namespace` connection parameter to the URI of the current
    /// workspace. Returns true when a fix was applied.
    async fn fix_namespace_param(&self, params: &mut Value) -> PublishResult<bool> {
        let workspace = self.workspace()?;
        let Some(entries) = params.get_mut("entry").and_then(Value::as_array_mut) else {
            return Ok(false);
        };
        let Some(entry) = entries
            .iter_mut()
            .find(|e| e.get("@key").and_then(Value::as_str) == Some("namespace"))
        else {
            return Ok(false);
        };
        let url = format!("{}/namespaces/{}.json", self.api_url, workspace);
        let ns = match self.client.get_value(&url).await {
            Ok(ns) => ns,
            Err(e) if e.is_missing() => {
                warn!("namespace '{}' does not exist", workspace);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(uri) = ns.pointer("/namespace/uri").and_then(Value::as_str) {
            entry["$"] = json!(uri);
            return Ok(true);
        }
        Ok(false)
    }

    /// Clears the workspace for a fresh publication: database datastores
    /// are preserved (with their namespace parameter fixed), styles are
    /// purged, then the workspace is deleted recursively and recreated.
    pub async fn clear_workspace(&self) -> PublishResult<()> {
        let workspace = self.workspace()?;
        if !self.workspace_exists().await? {
            self.create_workspace().await?;
            return Ok(());
        }

        let mut db_stores = Vec::new();
        let list_url = format!("{}/workspaces/{}/datastores.json", self.api_url, workspace);
        for name in self.fetch_names(&list_url, "dataStore").await? {
            let url = format!(
                "{}/workspaces/{}/datastores/{}.json",
                self.api_url, workspace, name
            );
            let mut ds = self.client.get_value(&url).await?;
            let params_text = ds
                .pointer("/dataStore/connectionParameters")
                .map(|p| p.to_string())
                .unwrap_or_default();
            if params_text.contains("dbtype") && params_text.contains("postgis") {
                if let Some(params) = ds.pointer_mut("/dataStore/connectionParameters") {
                    if self.fix_namespace_param(params).await? {
                        self.client.put_json(&url, &ds).await?;
                    }
                }
                db_stores.push(ds);
            }
        }

        for name in self.remote_style_names().await? {
            let url = format!(
                "{}/workspaces/{}/styles/{}.json?recurse=true&purge=true",
                self.api_url, workspace, name
            );
            self.client.delete_absent_ok(&url).await?;
        }

        let url = format!("{}/workspaces/{}.json?recurse=true", self.api_url, workspace);
        self.client.delete_absent_ok(&url).await?;

        self.create_workspace().await?;
        for body in &db_stores {
            let url = format!("{}/workspaces/{}/datastores.json", self.api_url, workspace);
            self.client.post_json(&url, body).await?;
        }

        if let Ok(mut state) = self.state.write() {
            *state = WorkspaceState::default();
        }
        Ok(())
    }

    fn publish_group<'a>(
        &'a self,
        group: &'a LayerGroup,
        workspace: &'a str,
    ) -> Pin<Box<dyn Future<Output = PublishResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut members = Vec::new();
            for child in &group.layers {
                match child {
                    GroupMember::Group(nested) => {
                        members.push(json!({
                            "@type": "layerGroup",
                            "name": format!("{}:{}", workspace, nested.name)
                        }));
                        self.publish_group(nested, workspace).await?;
                    }
                    GroupMember::Layer(name) => {
                        let remote = self.assigned_name(name).unwrap_or_else(|| name.clone());
                        members.push(json!({
                            "@type": "layer",
                            "name": format!("{workspace}:{remote}")
                        }));
                    }
                }
            }
            let groupdef = json!({
                "layerGroup": {
                    "name": group.name,
                    "title": group.title,
                    "abstractTxt": group.abstract_text,
                    "mode": "NAMED",
                    "publishables": { "published": members }
                }
            });
            let url = format!("{}/workspaces/{}/layergroups.json", self.api_url, workspace);
            let item_url = format!(
                "{}/workspaces/{}/layergroups/{}.json",
                self.api_url, workspace, group.name
            );
            self.client.delete_absent_ok(&item_url).await?;
            if let Err(e) = self.client.post_json(&url, &groupdef).await {
                // Group may have reappeared concurrently; fall back to update
                debug!("group create failed, retrying as update: {}", e);
                self.client.put_json(&item_url, &groupdef).await?;
            }
            if self.settings.use_vector_tiles {
                self.ensure_vt_format(&format!("{}:{}", workspace, group.name))
                    .await?;
            }
            info!("created layer group '{}'", group.name);
            Ok(())
        })
    }

    /// Adds the Mapbox vector tile mime format to a cached tile layer,
    /// reading the current configuration first so other formats survive.
    async fn ensure_vt_format(&self, qualified_name: &str) -> PublishResult<()> {
        let url = format!("{}/gwc/rest/layers/{}.xml", self.base_url, qualified_name);
        let xml = self.client.get_text(&url).await?;
        if !xml.contains(VT_MIME) {
            let patched = xml.replace(
                "<mimeFormats>",
                &format!("<mimeFormats><string>{VT_MIME}</string>"),
            );
            self.client.put_text(&url, &patched, "text/xml").await?;
        }
        Ok(())
    }

    /// Checks the reported server version; anything older than 2.14 cannot
    /// run the publication flows. A missing or unparsable version only
    /// produces a warning.
    async fn check_min_version(&self, errors: &mut BTreeSet<String>) {
        let url = format!("{}/about/version.json", self.api_url);
        let body = match self.client.get_value(&url).await {
            Ok(body) => body,
            Err(e) => {
                errors.insert(format!(
                    "could not connect to '{}': {}",
                    self.settings.name, e
                ));
                return;
            }
        };
        let version = body
            .pointer("/about/resource")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|r| r.get("@name").and_then(Value::as_str) == Some("GeoServer"))
            .and_then(|r| r.get("Version").and_then(Value::as_str))
            .map(String::from);
        let Some(version) = version else {
            warn!("server at {} did not report a version", self.api_url);
            return;
        };
        let mut parts = version.split('.').map(|p| p.parse::<u32>().ok());
        match (parts.next().flatten(), parts.next().flatten()) {
            (Some(major), Some(minor)) if major < 2 || (major == 2 && minor <= 13) => {
                errors.insert(format!(
                    "GeoServer 2.14.0 or later is required, detected version is {version}"
                ));
            }
            (Some(_), Some(_)) => {}
            _ => warn!("could not parse server version '{}'", version),
        }
    }
}

#[async_trait]
impl TargetServer for GeoserverTarget {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn type_label(&self) -> &'static str {
        "GeoServer"
    }

    fn settings(&self) -> TargetSettings {
        TargetSettings {
            type_name: TYPE_NAME.to_string(),
            settings: serde_json::to_value(&self.settings).unwrap_or(Value::Null),
        }
    }

    async fn test_connection(&self, errors: &mut BTreeSet<String>) -> bool {
        if self.settings.postgisdb.is_none() {
            match self.settings.storage {
                GeoserverStorage::ManagedDb => {
                    errors.insert(format!(
                        "server '{}' uses database storage but names no database target",
                        self.settings.name
                    ));
                    return false;
                }
                GeoserverStorage::ImportedDb => {
                    errors.insert(format!(
                        "server '{}' uses database storage but names no datastore template",
                        self.settings.name
                    ));
                    return false;
                }
                GeoserverStorage::FileBased => {}
            }
        }
        let before = errors.len();
        self.check_min_version(errors).await;
        errors.len() == before
    }
}

#[async_trait]
impl DataCatalog for GeoserverTarget {
    async fn prepare_for_publishing(&self, only_symbology: bool) -> PublishResult<()> {
        if !only_symbology {
            self.clear_workspace().await?;
        }
        self.ensure_workspace_exists().await?;
        if let Ok(mut state) = self.state.write() {
            *state = WorkspaceState::default();
        }
        Ok(())
    }

    async fn publish_style(&self, layer: &LayerRef) -> PublishResult<()> {
        let (path, warnings) = self
            .collab
            .styles
            .serialize(layer, &self.collab.work_dir)
            .await?;
        for warning in warnings {
            warn!("{}", warning);
        }
        self.publish_style_file(&layer.web_slug(), &path).await
    }

    async fn publish_layer(&self, layer: &LayerRef, fields: &[String]) -> PublishResult<()> {
        if layer.is_raster() {
            return self.publish_raster(layer).await;
        }
        if self.settings.use_original_data_source {
            if let crate::layers::LayerSource::Database(source) = &layer.source {
                return self.publish_vector_from_database(layer, source).await;
            }
        }
        match self.settings.storage {
            GeoserverStorage::FileBased => {
                self.publish_vector_from_geopackage(layer, fields).await
            }
            GeoserverStorage::ManagedDb => {
                let db = self.db_target()?;
                db.import_layer(layer, fields).await?;
                let source = db.source_for(layer);
                self.publish_vector_from_database(layer, &source).await
            }
            GeoserverStorage::ImportedDb => {
                self.publish_vector_via_importer(layer, fields).await
            }
        }
    }

    async fn layer_exists(&self, name: &str) -> PublishResult<bool> {
        Ok(self.resolve_remote_name(name).await?.is_some())
    }

    async fn style_exists(&self, name: &str) -> PublishResult<bool> {
        self.style_exists_inner(name).await
    }

    async fn delete_layer(&self, name: &str) -> PublishResult<bool> {
        let Some(remote) = self.resolve_remote_name(name).await? else {
            return Ok(true);
        };
        let workspace = self.workspace()?;
        let url = format!(
            "{}/workspaces/{}/layers/{}.json?recurse=true",
            self.api_url, workspace, remote
        );
        self.client.delete_absent_ok(&url).await?;
        self.invalidate();
        Ok(true)
    }

    async fn delete_style(&self, name: &str) -> PublishResult<bool> {
        if !self.style_exists_inner(name).await? {
            return Ok(true);
        }
        let workspace = self.workspace()?;
        let url = format!(
            "{}/workspaces/{}/styles/{}?purge=true&recurse=true",
            self.api_url, workspace, name
        );
        self.client.delete_absent_ok(&url).await?;
        self.invalidate();
        Ok(true)
    }

    async fn create_groups(&self, groups: &[LayerGroup]) -> PublishResult<()> {
        let workspace = self.workspace()?;
        for group in groups {
            self.publish_group(group, &workspace).await?;
        }
        Ok(())
    }

    async fn close_publishing(&self, published: &[String]) -> PublishResult<()> {
        if !self.settings.use_vector_tiles {
            return Ok(());
        }
        let workspace = self.workspace()?;
        for name in published {
            let remote = self.assigned_name(name).unwrap_or_else(|| name.clone());
            if let Err(e) = self
                .ensure_vt_format(&format!("{workspace}:{remote}"))
                .await
            {
                warn!("failed to enable vector tiles for '{}': {}", remote, e);
            }
        }
        Ok(())
    }

    fn full_layer_name(&self, layer_name: &str) -> String {
        match self.workspace() {
            Ok(workspace) => format!("{workspace}:{layer_name}"),
            Err(_) => layer_name.to_string(),
        }
    }

    fn wms_url(&self) -> Option<String> {
        Some(format!(
            "{}/wms?service=WMS&version=1.1.0&request=GetCapabilities",
            self.base_url
        ))
    }

    fn wfs_url(&self) -> Option<String> {
        Some(format!("{}/wfs", self.base_url))
    }

    fn preview_url(&self, layer_names: &[String], bbox: &str, srs: &str) -> Option<String> {
        let workspace = self.workspace().ok()?;
        let names = layer_names
            .iter()
            .map(|name| {
                let remote = self.assigned_name(name).unwrap_or_else(|| name.clone());
                format!("{workspace}:{remote}")
            })
            .collect::<Vec<_>>()
            .join(",");
        Some(format!(
            "{}/{}/wms?service=WMS&version=1.1.0&request=GetMap&layers={}\
             &format=application/openlayers&bbox={}&srs={}&width=800&height=600",
            self.base_url, workspace, names, bbox, srs
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Extent, LayerKind, LayerMetadata, LayerSource};

    #[test]
    fn rest_url_is_appended_when_missing() {
        let (base, api) = fix_rest_url("http://localhost:8080/geoserver");
        assert_eq!(base, "http://localhost:8080/geoserver");
        assert_eq!(api, "http://localhost:8080/geoserver/rest");
    }

    #[test]
    fn rest_url_is_stripped_from_base() {
        let (base, api) = fix_rest_url("http://localhost:8080/geoserver/rest/");
        assert_eq!(base, "http://localhost:8080/geoserver");
        assert_eq!(api, "http://localhost:8080/geoserver/rest");
    }

    #[test]
    fn settings_round_trip() {
        let settings = GeoserverSettings {
            name: "staging".into(),
            authid: Some("gs-auth".into()),
            url: "http://gs.example.com/geoserver".into(),
            storage: GeoserverStorage::ImportedDb,
            postgisdb: Some("shared:postgis".into()),
            use_original_data_source: false,
            use_vector_tiles: true,
            workspace: Some("project".into()),
        };
        let value = serde_json::to_value(&settings).unwrap();
        assert_eq!(value["useVectorTiles"], true);
        assert_eq!(value["storage"], "imported_db");
        let back: GeoserverSettings = serde_json::from_value(value).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn feature_type_body_rounds_bounding_box() {
        let layer = LayerRef {
            id: "l1".into(),
            name: "rivers".into(),
            kind: LayerKind::Vector,
            source: LayerSource::File("/data/rivers.gpkg".into()),
            fields: vec![],
            crs: "EPSG:28992".into(),
            extent: Extent {
                xmin: 1.123456789,
                ymin: 2.0,
                xmax: 3.987654321,
                ymax: 4.0,
            },
            metadata: LayerMetadata {
                title: Some("River network".into()),
                ..Default::default()
            },
        };
        let settings = GeoserverSettings {
            name: "gs".into(),
            authid: None,
            url: "http://gs/geoserver".into(),
            storage: GeoserverStorage::FileBased,
            postgisdb: None,
            use_original_data_source: false,
            use_vector_tiles: false,
            workspace: Some("ws".into()),
        };
        let tmp = tempfile::tempdir().unwrap();
        let target = GeoserverTarget::new(
            settings,
            &Collaborators::with_defaults(tmp.path().to_path_buf()),
        );
        let body = target.feature_type_props(&layer, true, &[]);
        assert_eq!(body["featureType"]["title"], "River network");
        assert_eq!(body["featureType"]["nativeBoundingBox"]["minx"], 1.12346);
        assert_eq!(body["featureType"]["nativeBoundingBox"]["maxx"], 3.98765);
        assert_eq!(body["featureType"]["nativeBoundingBox"]["crs"], "EPSG:28992");
    }

    #[test]
    fn full_layer_name_is_workspace_qualified() {
        let settings = GeoserverSettings {
            name: "gs".into(),
            authid: None,
            url: "http://gs/geoserver".into(),
            storage: GeoserverStorage::FileBased,
            postgisdb: None,
            use_original_data_source: false,
            use_vector_tiles: false,
            workspace: Some("ws".into()),
        };
        let tmp = tempfile::tempdir().unwrap();
        let target = GeoserverTarget::new(
            settings,
            &Collaborators::with_defaults(tmp.path().to_path_buf()),
        );
        assert_eq!(target.full_layer_name("rivers"), "ws:rivers");
    }
}

//! End-to-end publish flows against a scripted GeoServer transport.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use url::Url;

use geopublish::collab::Collaborators;
use geopublish::errors::{PublishError, PublishResult, TransportError, TransportResult};
use geopublish::layers::{Extent, LayerKind, LayerMetadata, LayerRef, LayerSource};
use geopublish::project::{GroupMember, LayerGroup, ProjectSnapshot};
use geopublish::publish::{
    MetadataPolicy, PublishOrchestrator, PublishRequest, RunOutcome,
};
use geopublish::rest::{Method, RestRequest, RestResponse, RestTransport};
use geopublish::servers::{
    DataCatalog, GeoserverSettings, GeoserverStorage, GeoserverTarget, TargetServer,
    TargetSettings,
};

/// In-memory stand-in for the GeoServer REST API, tracking just enough
/// state to answer the requests the publish flows make.
#[derive(Default)]
struct FakeGeoserver {
    workspaces: Mutex<HashSet<String>>,
    styles: Mutex<HashSet<String>>,
    datastores: Mutex<HashSet<String>>,
    featuretypes: Mutex<HashSet<String>>,
    layers: Mutex<HashSet<String>>,
    groups: Mutex<HashSet<String>>,
    import_error: Option<String>,
    reject_group_create: bool,
    log: Mutex<Vec<(Method, String)>>,
}

impl FakeGeoserver {
    fn with_workspace(workspace: &str) -> Self {
        let fake = Self::default();
        fake.workspaces.lock().unwrap().insert(workspace.to_string());
        fake
    }

    fn requests(&self, method: Method, fragment: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, u)| *m == method && u.contains(fragment))
            .count()
    }

    fn name_list(names: &Mutex<HashSet<String>>, category: &str) -> Value {
        let items: Vec<Value> = names
            .lock()
            .unwrap()
            .iter()
            .map(|n| json!({ "name": n }))
            .collect();
        let mut inner = serde_json::Map::new();
        inner.insert(category.to_string(), Value::Array(items));
        let mut outer = serde_json::Map::new();
        outer.insert(format!("{category}s"), Value::Object(inner));
        Value::Object(outer)
    }

    fn ok(url: &str, body: Value) -> TransportResult<RestResponse> {
        Ok(RestResponse::new(200, body.to_string().into_bytes(), url))
    }

    fn missing(method: Method, url: &str) -> TransportResult<RestResponse> {
        Err(TransportError::Status {
            method: method.to_string(),
            url: url.to_string(),
            status: 404,
        })
    }

    fn last_segment(path: &str) -> String {
        path.trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("")
            .trim_end_matches(".json")
            .to_string()
    }

    fn body_name(request: &RestRequest, pointer: &str) -> String {
        request
            .body
            .as_deref()
            .and_then(|b| serde_json::from_slice::<Value>(b).ok())
            .and_then(|v| v.pointer(pointer).and_then(|n| n.as_str().map(String::from)))
            .unwrap_or_default()
    }
}

#[async_trait]
impl RestTransport for FakeGeoserver {
    async fn send(&self, request: RestRequest) -> TransportResult<RestResponse> {
        let parsed = Url::parse(&request.url).map_err(|e| TransportError::Connection {
            method: request.method.to_string(),
            url: request.url.clone(),
            reason: e.to_string(),
        })?;
        let path = parsed.path().to_string();
        let query = parsed.query().unwrap_or("").to_string();
        self.log
            .lock()
            .unwrap()
            .push((request.method, format!("{path}?{query}")));
        let url = request.url.as_str();
        let method = request.method;

        if path.ends_with("/rest/about/version.json") {
            return Self::ok(
                url,
                json!({ "about": { "resource": [
                    { "@name": "GeoServer", "Version": "2.23.1" }
                ] } }),
            );
        }
        if path.ends_with("/rest/workspaces.json") {
            return Self::ok(url, Self::name_list(&self.workspaces, "workspace"));
        }
        if path.ends_with("/rest/workspaces") && method == Method::Post {
            let name = Self::body_name(&request, "/workspace/name");
            self.workspaces.lock().unwrap().insert(name);
            return Self::ok(url, json!({}));
        }
        if path.contains("/namespaces/") {
            return Self::ok(url, json!({ "namespace": { "uri": "http://example.com/ns" } }));
        }

        if path.contains("/imports") {
            return match (method, path.as_str()) {
                (Method::Post, p) if p.ends_with("/imports.json") => {
                    Self::ok(url, json!({ "import": { "id": 1 } }))
                }
                (Method::Post, p) if p.ends_with("/tasks") => {
                    Self::ok(url, json!({ "task": { "id": 2 } }))
                }
                (Method::Put, _) | (Method::Post, _) => Self::ok(url, json!({})),
                (Method::Get, _) => {
                    let mut task = json!({ "task": { "layer": { "name": "rivers2" } } });
                    if let Some(message) = &self.import_error {
                        task["task"]["errorMessage"] = json!(message);
                    }
                    Self::ok(url, task)
                }
                _ => Self::missing(method, url),
            };
        }

        if path.contains("/styles") {
            let name = if query.starts_with("name=") {
                query.trim_start_matches("name=").to_string()
            } else {
                Self::last_segment(&path)
            };
            return match method {
                Method::Get => Self::ok(url, Self::name_list(&self.styles, "style")),
                Method::Post => {
                    self.styles.lock().unwrap().insert(name);
                    Self::ok(url, json!({}))
                }
                Method::Put => {
                    if self.styles.lock().unwrap().contains(&name) {
                        Self::ok(url, json!({}))
                    } else {
                        Self::missing(method, url)
                    }
                }
                Method::Delete => {
                    if self.styles.lock().unwrap().remove(&name) {
                        Self::ok(url, json!({}))
                    } else {
                        Self::missing(method, url)
                    }
                }
            };
        }

        if path.contains("/featuretypes") {
            return match method {
                Method::Post => {
                    let name = Self::body_name(&request, "/featureType/name");
                    self.featuretypes.lock().unwrap().insert(name.clone());
                    self.layers.lock().unwrap().insert(name);
                    Self::ok(url, json!({}))
                }
                Method::Get => {
                    let name = Self::last_segment(&path);
                    if self.featuretypes.lock().unwrap().contains(&name) {
                        Self::ok(url, json!({ "featureType": { "name": name } }))
                    } else {
                        Self::missing(method, url)
                    }
                }
                Method::Put => Self::ok(url, json!({})),
                Method::Delete => Self::missing(method, url),
            };
        }

        if path.contains("/datastores") {
            if path.ends_with("/datastores.json") && method == Method::Get {
                return Self::ok(url, Self::name_list(&self.datastores, "dataStore"));
            }
            if path.ends_with("/datastores.json") && method == Method::Post {
                let name = Self::body_name(&request, "/dataStore/name");
                self.datastores.lock().unwrap().insert(name);
                return Self::ok(url, json!({}));
            }
            if path.contains("/file.gpkg") && method == Method::Put {
                let segments: Vec<&str> = path.split('/').collect();
                if let Some(i) = segments.iter().position(|s| *s == "datastores") {
                    self.datastores
                        .lock()
                        .unwrap()
                        .insert(segments[i + 1].to_string());
                }
                return Self::ok(url, json!({}));
            }
            let name = Self::last_segment(&path);
            return match method {
                Method::Get => {
                    if self.datastores.lock().unwrap().contains(&name) {
                        Self::ok(
                            url,
                            json!({ "dataStore": {
                                "name": name,
                                "enabled": true,
                                "connectionParameters": { "entry": [
                                    { "@key": "dbtype", "$": "postgis" }
                                ] }
                            } }),
                        )
                    } else {
                        Self::missing(method, url)
                    }
                }
                Method::Put => Self::ok(url, json!({})),
                Method::Delete => {
                    if self.datastores.lock().unwrap().remove(&name) {
                        Self::ok(url, json!({}))
                    } else {
                        Self::missing(method, url)
                    }
                }
                Method::Post => Self::ok(url, json!({})),
            };
        }

        if path.contains("/coveragestores") {
            if method == Method::Put && path.contains("/file.geotiff") {
                let name = query
                    .split('&')
                    .find_map(|kv| kv.strip_prefix("coverageName="))
                    .unwrap_or("coverage")
                    .to_string();
                self.layers.lock().unwrap().insert(name);
                return Self::ok(url, json!({}));
            }
            return Self::missing(method, url);
        }

        if path.contains("/layergroups") {
            return match method {
                Method::Post => {
                    if self.reject_group_create {
                        return Err(TransportError::Status {
                            method: method.to_string(),
                            url: url.to_string(),
                            status: 409,
                        });
                    }
                    let name = Self::body_name(&request, "/layerGroup/name");
                    self.groups.lock().unwrap().insert(name);
                    Self::ok(url, json!({}))
                }
                Method::Put => {
                    let name = Self::last_segment(&path);
                    self.groups.lock().unwrap().insert(name);
                    Self::ok(url, json!({}))
                }
                Method::Delete => {
                    let name = Self::last_segment(&path);
                    if self.groups.lock().unwrap().remove(&name) {
                        Self::ok(url, json!({}))
                    } else {
                        Self::missing(method, url)
                    }
                }
                _ => Self::missing(method, url),
            };
        }

        if path.contains("/layers") {
            if path.ends_with("/layers.json") && method == Method::Get {
                return Self::ok(url, Self::name_list(&self.layers, "layer"));
            }
            let name = Self::last_segment(&path);
            return match method {
                Method::Get => {
                    if self.layers.lock().unwrap().contains(&name) {
                        Self::ok(
                            url,
                            json!({ "layer": { "defaultStyle": {
                                "name": "line",
                                "href": "http://gs/geoserver/rest/styles/line.json"
                            } } }),
                        )
                    } else {
                        Self::missing(method, url)
                    }
                }
                Method::Put => Self::ok(url, json!({})),
                Method::Delete => {
                    if self.layers.lock().unwrap().remove(&name) {
                        Self::ok(url, json!({}))
                    } else {
                        Self::missing(method, url)
                    }
                }
                Method::Post => Self::missing(method, url),
            };
        }

        Err(TransportError::Status {
            method: method.to_string(),
            url: url.to_string(),
            status: 599,
        })
    }
}

fn collaborators(fake: Arc<FakeGeoserver>, work_dir: PathBuf) -> Collaborators {
    let mut collab = Collaborators::with_defaults(work_dir);
    collab.transport = Some(fake);
    collab
}

fn geoserver(fake: Arc<FakeGeoserver>, work_dir: PathBuf, storage: GeoserverStorage) -> GeoserverTarget {
    GeoserverTarget::new(
        GeoserverSettings {
            name: "gs".into(),
            authid: None,
            url: "http://gs/geoserver".into(),
            storage,
            postgisdb: match storage {
                GeoserverStorage::ImportedDb => Some("shared:postgis".into()),
                _ => None,
            },
            use_original_data_source: false,
            use_vector_tiles: false,
            workspace: Some("ws".into()),
        },
        &collaborators(fake, work_dir),
    )
}

fn vector_layer(id: &str, name: &str, path: PathBuf) -> LayerRef {
    LayerRef {
        id: id.to_string(),
        name: name.to_string(),
        kind: LayerKind::Vector,
        source: LayerSource::File(path),
        fields: vec!["id".into(), "label".into()],
        crs: "EPSG:4326".into(),
        extent: Extent { xmin: 0.0, ymin: 0.0, xmax: 10.0, ymax: 10.0 },
        metadata: LayerMetadata {
            title: Some(name.to_string()),
            crs: Some("EPSG:4326".into()),
            extent: Some(Extent { xmin: 0.0, ymin: 0.0, xmax: 10.0, ymax: 10.0 }),
            ..Default::default()
        },
    }
}

#[tokio::test]
async fn style_is_created_then_updated() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeGeoserver::with_workspace("ws"));
    let target = geoserver(fake.clone(), tmp.path().to_path_buf(), GeoserverStorage::FileBased);
    let layer = vector_layer("l1", "rivers", tmp.path().join("rivers.shp"));

    target.publish_style(&layer).await.unwrap();
    assert_eq!(fake.requests(Method::Post, "/styles?name=rivers"), 1);
    assert_eq!(fake.requests(Method::Put, "/styles/rivers"), 0);

    target.publish_style(&layer).await.unwrap();
    assert_eq!(fake.requests(Method::Post, "/styles?name=rivers"), 1);
    assert_eq!(fake.requests(Method::Put, "/styles/rivers"), 1);
}

#[tokio::test]
async fn deleting_absent_resources_is_success() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeGeoserver::with_workspace("ws"));
    let target = geoserver(fake.clone(), tmp.path().to_path_buf(), GeoserverStorage::FileBased);

    assert!(target.delete_layer("ghost").await.unwrap());
    assert!(target.delete_style("ghost").await.unwrap());
    // Nothing was deleted; absence is not an error
    assert_eq!(fake.requests(Method::Delete, "/layers/"), 0);
    assert_eq!(fake.requests(Method::Delete, "/styles/"), 0);
}

#[tokio::test]
async fn import_workflow_errors_are_soft_and_scoped() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("rivers.shp");
    std::fs::write(&source, b"shp bytes").unwrap();

    let mut fake = FakeGeoserver::with_workspace("ws");
    fake.import_error = Some("Invalid geometry in row 7".into());
    fake.datastores.lock().unwrap().insert("ws".into());
    let fake = Arc::new(fake);
    let target = geoserver(fake.clone(), tmp.path().to_path_buf(), GeoserverStorage::ImportedDb);
    let layer = vector_layer("l1", "rivers", source);

    let err = target
        .publish_layer(&layer, &["id".into()])
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::ImportWorkflow(_)));
    assert!(err.is_soft());
    assert!(err.to_string().contains("Invalid geometry in row 7"));
    // The task was created and executed before the failure surfaced
    assert_eq!(fake.requests(Method::Post, "/imports.json"), 1);
    assert_eq!(fake.requests(Method::Post, "/imports/1/tasks"), 1);
}

#[tokio::test]
async fn importer_assigned_name_is_used_for_lookups() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("rivers.shp");
    std::fs::write(&source, b"shp bytes").unwrap();

    let fake = FakeGeoserver::with_workspace("ws");
    fake.datastores.lock().unwrap().insert("ws".into());
    // The server assigned "rivers2"; the feature type exists under that name
    fake.featuretypes.lock().unwrap().insert("rivers2".into());
    fake.layers.lock().unwrap().insert("rivers2".into());
    let fake = Arc::new(fake);
    let target = geoserver(fake.clone(), tmp.path().to_path_buf(), GeoserverStorage::ImportedDb);
    let layer = vector_layer("l1", "rivers", source);

    target.publish_layer(&layer, &["id".into()]).await.unwrap();
    // Existence lookups under the requested name resolve to the assigned one
    assert!(target.layer_exists("rivers").await.unwrap());
    assert_eq!(fake.requests(Method::Put, "/featuretypes/rivers2.json"), 1);
}

#[tokio::test]
async fn rejected_group_create_falls_back_to_update() {
    let tmp = tempfile::tempdir().unwrap();
    let mut fake = FakeGeoserver::with_workspace("ws");
    fake.reject_group_create = true;
    let fake = Arc::new(fake);
    let target = geoserver(fake.clone(), tmp.path().to_path_buf(), GeoserverStorage::FileBased);

    let group = LayerGroup {
        name: "base".into(),
        title: "Base layers".into(),
        abstract_text: String::new(),
        layers: vec![GroupMember::Layer("rivers".into())],
    };
    target.create_groups(&[group]).await.unwrap();

    // The update goes to the group's own resource, not the collection
    assert_eq!(fake.requests(Method::Put, "/layergroups/base.json"), 1);
    assert!(fake.groups.lock().unwrap().contains("base"));
}

struct GatedCatalog {
    started: tokio::sync::mpsc::UnboundedSender<String>,
    gate: Arc<tokio::sync::Semaphore>,
}

#[async_trait]
impl TargetServer for GatedCatalog {
    fn name(&self) -> &str {
        "gated"
    }

    fn type_label(&self) -> &'static str {
        "Gated"
    }

    fn settings(&self) -> TargetSettings {
        TargetSettings {
            type_name: "gated".into(),
            settings: json!({}),
        }
    }

    async fn test_connection(&self, _errors: &mut BTreeSet<String>) -> bool {
        true
    }
}

#[async_trait]
impl DataCatalog for GatedCatalog {
    async fn prepare_for_publishing(&self, _only_symbology: bool) -> PublishResult<()> {
        Ok(())
    }

    async fn publish_style(&self, _layer: &LayerRef) -> PublishResult<()> {
        Ok(())
    }

    async fn publish_layer(&self, layer: &LayerRef, _fields: &[String]) -> PublishResult<()> {
        let _ = self.started.send(layer.name.clone());
        let permit = self.gate.acquire().await;
        drop(permit);
        Ok(())
    }

    async fn layer_exists(&self, _name: &str) -> PublishResult<bool> {
        Ok(false)
    }

    async fn style_exists(&self, _name: &str) -> PublishResult<bool> {
        Ok(false)
    }

    async fn delete_layer(&self, _name: &str) -> PublishResult<bool> {
        Ok(true)
    }

    async fn delete_style(&self, _name: &str) -> PublishResult<bool> {
        Ok(true)
    }

    async fn create_groups(&self, _groups: &[LayerGroup]) -> PublishResult<()> {
        Ok(())
    }

    async fn close_publishing(&self, _published: &[String]) -> PublishResult<()> {
        Ok(())
    }

    fn full_layer_name(&self, layer_name: &str) -> String {
        layer_name.to_string()
    }
}

#[tokio::test]
async fn cancellation_stops_at_the_next_layer_boundary() {
    let tmp = tempfile::tempdir().unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let catalog = Arc::new(GatedCatalog {
        started: tx,
        gate: gate.clone(),
    });

    let project = ProjectSnapshot {
        name: "atlas".into(),
        layers: vec![
            vector_layer("l1", "rivers", tmp.path().join("rivers.shp")),
            vector_layer("l2", "roads", tmp.path().join("roads.shp")),
            vector_layer("l3", "lakes", tmp.path().join("lakes.shp")),
        ],
        field_selections: Default::default(),
        groups: vec![],
    };
    let orchestrator = PublishOrchestrator::new(Some(catalog as Arc<dyn DataCatalog>), None);
    let running = orchestrator.start(PublishRequest {
        project,
        layer_ids: vec![],
        only_symbology: false,
        policy: MetadataPolicy::Allow,
    });

    // Wait for the first layer to be mid-publish, then cancel and let the
    // layer finish.
    let first = rx.recv().await.unwrap();
    assert_eq!(first, "rivers");
    running.cancel();
    gate.add_permits(3);

    let report = running.wait().await;
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.results.len(), 1);
    assert!(report.results.get("rivers").unwrap().is_clean());
}

#[tokio::test]
async fn full_run_publishes_shared_container_raster_and_groups() {
    let tmp = tempfile::tempdir().unwrap();
    let sources = tmp.path().join("atlas_data");
    std::fs::create_dir_all(&sources).unwrap();
    std::fs::write(sources.join("rivers.shp"), b"rivers").unwrap();
    std::fs::write(sources.join("roads.shp"), b"roads").unwrap();
    std::fs::write(sources.join("dem.tif"), b"tif bytes").unwrap();

    let fake = Arc::new(FakeGeoserver::default());
    let work_dir = tmp.path().join("work");
    std::fs::create_dir_all(&work_dir).unwrap();
    let collab = collaborators(fake.clone(), work_dir);
    let target = Arc::new(GeoserverTarget::new(
        GeoserverSettings {
            name: "gs".into(),
            authid: None,
            url: "http://gs/geoserver".into(),
            storage: GeoserverStorage::FileBased,
            postgisdb: None,
            use_original_data_source: false,
            use_vector_tiles: false,
            workspace: Some("ws".into()),
        },
        &collab,
    ));

    let project = ProjectSnapshot {
        name: "atlas".into(),
        layers: vec![
            vector_layer("l1", "rivers", sources.join("rivers.shp")),
            vector_layer("l2", "roads", sources.join("roads.shp")),
            LayerRef {
                id: "l3".into(),
                name: "dem".into(),
                kind: LayerKind::Raster,
                source: LayerSource::File(sources.join("dem.tif")),
                fields: vec![],
                crs: "EPSG:4326".into(),
                extent: Extent { xmin: 0.0, ymin: 0.0, xmax: 10.0, ymax: 10.0 },
                metadata: LayerMetadata::default(),
            },
        ],
        field_selections: Default::default(),
        groups: vec![LayerGroup {
            name: "base".into(),
            title: "Base layers".into(),
            abstract_text: String::new(),
            layers: vec![
                GroupMember::Layer("rivers".into()),
                GroupMember::Layer("roads".into()),
            ],
        }],
    };
    let request = PublishRequest {
        project,
        layer_ids: vec![],
        only_symbology: false,
        policy: MetadataPolicy::Allow,
    };
    target
        .attach_consolidator(PublishOrchestrator::consolidator_for(&request, &collab))
        .await;

    let orchestrator = PublishOrchestrator::new(Some(target as Arc<dyn DataCatalog>), None);
    let report = orchestrator.start(request).wait().await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.results.len(), 3);
    for (name, result) in &report.results {
        assert!(result.is_clean(), "layer '{name}' had errors: {:?}", result.errors);
    }

    // One workspace, one shared GeoPackage upload, a feature type per
    // vector, one coverage upload, one group
    assert_eq!(fake.requests(Method::Post, "/rest/workspaces?"), 1);
    assert_eq!(fake.requests(Method::Put, "file.gpkg"), 1);
    assert_eq!(fake.requests(Method::Post, "/featuretypes.json"), 2);
    assert_eq!(fake.requests(Method::Put, "file.geotiff"), 1);
    assert_eq!(fake.requests(Method::Post, "/layergroups.json"), 1);
}

//! Collaborator seams.
//!
//! Format conversion, style serialization, metadata packaging and
//! credential storage are supplied by the host application. The publish
//! engine only depends on these traits; the implementations shipped here
//! are deliberately minimal and exist so the CLI and the test suite have
//! something to wire in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::errors::{PublishError, PublishResult};
use crate::layers::{DatabaseSource, LayerRef, LayerSource};

/// Produces data artifacts for layers.
///
/// `export_vector` writes (or appends) the layer's table into the container
/// at `target`; calling it repeatedly with the same container must add
/// tables rather than truncate. Output locations are deterministic for
/// unchanged inputs.
#[async_trait]
pub trait LayerExporter: Send + Sync {
    async fn export_vector(
        &self,
        layer: &LayerRef,
        fields: &[String],
        target: &Path,
    ) -> PublishResult<()>;

    /// Exports a raster layer to a georeferenced image and returns its path.
    async fn export_raster(&self, layer: &LayerRef, work_dir: &Path) -> PublishResult<PathBuf>;

    /// Writes the layer as a table into the given database, replacing any
    /// existing table of the same name.
    async fn write_database_table(
        &self,
        layer: &LayerRef,
        fields: &[String],
        target: &DatabaseSource,
    ) -> PublishResult<()>;
}

/// Produces a style document (or zipped bundle) for a layer, returning the
/// document path and any conversion warnings.
#[async_trait]
pub trait StyleSerializer: Send + Sync {
    async fn serialize(&self, layer: &LayerRef, work_dir: &Path)
        -> PublishResult<(PathBuf, Vec<String>)>;
}

/// Produces a packaged metadata file for a layer, wired with the service
/// endpoints the published layer is reachable at.
#[async_trait]
pub trait MetadataTransformer: Send + Sync {
    async fn package(
        &self,
        layer: &LayerRef,
        wms_url: Option<&str>,
        wfs_url: Option<&str>,
        linked_name: Option<&str>,
        work_dir: &Path,
    ) -> PublishResult<PathBuf>;
}

/// Resolves an auth reference to basic credentials. Returns `None` when the
/// reference is unknown; callers then proceed unauthenticated.
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, auth_ref: &str) -> Option<(String, String)>;
}

/// In-memory credential store, loaded from CLI configuration.
#[derive(Default)]
pub struct StaticCredentials {
    entries: HashMap<String, (String, String)>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, auth_ref: impl Into<String>, user: impl Into<String>, pass: impl Into<String>) {
        self.entries.insert(auth_ref.into(), (user.into(), pass.into()));
    }
}

impl CredentialResolver for StaticCredentials {
    fn resolve(&self, auth_ref: &str) -> Option<(String, String)> {
        self.entries.get(auth_ref).cloned()
    }
}

/// Exporter for sources that are already in a publishable format: file
/// sources are copied verbatim, everything else is written as an empty
/// placeholder container. Real format conversion belongs to the host
/// application.
pub struct PassthroughExporter;

#[async_trait]
impl LayerExporter for PassthroughExporter {
    async fn export_vector(
        &self,
        layer: &LayerRef,
        _fields: &[String],
        target: &Path,
    ) -> PublishResult<()> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match &layer.source {
            LayerSource::File(path) if path.exists() && !target.exists() => {
                tokio::fs::copy(path, target).await?;
            }
            _ => {
                // Append marker so repeated exports into a shared container
                // are observable
                let mut existing = if target.exists() {
                    tokio::fs::read(target).await?
                } else {
                    Vec::new()
                };
                existing.extend_from_slice(layer.web_slug().as_bytes());
                existing.push(b'\n');
                tokio::fs::write(target, existing).await?;
            }
        }
        info!("exported layer '{}' to {}", layer.name, target.display());
        Ok(())
    }

    async fn export_raster(&self, layer: &LayerRef, work_dir: &Path) -> PublishResult<PathBuf> {
        tokio::fs::create_dir_all(work_dir).await?;
        match &layer.source {
            LayerSource::File(path) if path.extension().map(|e| e == "tif").unwrap_or(false) => {
                // Already a GeoTIFF: publish directly from the source
                Ok(path.clone())
            }
            LayerSource::File(path) => {
                let target = work_dir.join(format!("{}.tif", layer.file_slug()));
                if path.exists() {
                    tokio::fs::copy(path, &target).await?;
                } else {
                    tokio::fs::write(&target, b"").await?;
                }
                Ok(target)
            }
            LayerSource::Database(_) => Err(PublishError::Artifact(format!(
                "raster layer '{}' has a database source and cannot be exported",
                layer.name
            ))),
        }
    }

    async fn write_database_table(
        &self,
        layer: &LayerRef,
        _fields: &[String],
        target: &DatabaseSource,
    ) -> PublishResult<()> {
        Err(PublishError::Unsupported(format!(
            "no database writer available to import '{}' into {}",
            layer.name,
            target.origin_key()
        )))
    }
}

/// Style serializer that picks up a pre-built style document next to the
/// layer source (`<stem>.zip` bundle or `<stem>.sld`), falling back to a
/// generated minimal SLD.
pub struct PrebuiltStyleSerializer;

#[async_trait]
impl StyleSerializer for PrebuiltStyleSerializer {
    async fn serialize(
        &self,
        layer: &LayerRef,
        work_dir: &Path,
    ) -> PublishResult<(PathBuf, Vec<String>)> {
        if let LayerSource::File(path) = &layer.source {
            for ext in ["zip", "sld"] {
                let candidate = path.with_extension(ext);
                if candidate.exists() {
                    return Ok((candidate, vec![]));
                }
            }
        }
        tokio::fs::create_dir_all(work_dir).await?;
        let target = work_dir.join(format!("{}.sld", layer.file_slug()));
        let sld = format!(
            "<StyledLayerDescriptor version=\"1.0.0\"><NamedLayer><Name>{}</Name></NamedLayer></StyledLayerDescriptor>",
            layer.web_slug()
        );
        tokio::fs::write(&target, sld).await?;
        Ok((
            target,
            vec![format!(
                "No style document found for layer '{}'; a default style was generated",
                layer.name
            )],
        ))
    }
}

/// Metadata transformer writing a minimal XML record. The real ISO/Dublin
/// Core transformation is supplied by the host application.
pub struct XmlMetadataTransformer;

#[async_trait]
impl MetadataTransformer for XmlMetadataTransformer {
    async fn package(
        &self,
        layer: &LayerRef,
        wms_url: Option<&str>,
        wfs_url: Option<&str>,
        linked_name: Option<&str>,
        work_dir: &Path,
    ) -> PublishResult<PathBuf> {
        tokio::fs::create_dir_all(work_dir).await?;
        let target = work_dir.join(format!("{}_metadata.xml", layer.file_slug()));
        let title = layer.metadata.title.clone().unwrap_or_else(|| layer.name.clone());
        let mut doc = format!(
            "<metadata><identifier>{}</identifier><title>{}</title>",
            layer.id, title
        );
        if let Some(name) = linked_name {
            doc.push_str(&format!("<linkedResource>{name}</linkedResource>"));
        }
        if let Some(wms) = wms_url {
            doc.push_str(&format!("<onlineResource protocol=\"OGC:WMS\">{wms}</onlineResource>"));
        }
        if let Some(wfs) = wfs_url {
            doc.push_str(&format!("<onlineResource protocol=\"OGC:WFS\">{wfs}</onlineResource>"));
        }
        doc.push_str("</metadata>");
        tokio::fs::write(&target, doc).await?;
        Ok(target)
    }
}

/// Shared bundle of collaborators handed to target constructors.
#[derive(Clone)]
pub struct Collaborators {
    pub exporter: Arc<dyn LayerExporter>,
    pub styles: Arc<dyn StyleSerializer>,
    pub metadata: Arc<dyn MetadataTransformer>,
    pub credentials: Arc<dyn CredentialResolver>,
    /// Injected transport for tests; production targets build their own
    /// reqwest transport with resolved credentials when this is `None`.
    pub transport: Option<Arc<dyn crate::rest::RestTransport>>,
    /// Scratch directory for exported artifacts; names inside it are
    /// deterministic for unchanged inputs.
    pub work_dir: PathBuf,
}

impl Collaborators {
    pub fn with_defaults(work_dir: PathBuf) -> Self {
        Self {
            exporter: Arc::new(PassthroughExporter),
            styles: Arc::new(PrebuiltStyleSerializer),
            metadata: Arc::new(XmlMetadataTransformer),
            credentials: Arc::new(StaticCredentials::new()),
            transport: None,
            work_dir,
        }
    }

    /// Builds the transport for a target: the injected one when present,
    /// otherwise reqwest with credentials resolved from `auth_ref`.
    pub fn transport_for(&self, auth_ref: Option<&str>) -> Arc<dyn crate::rest::RestTransport> {
        if let Some(transport) = &self.transport {
            return transport.clone();
        }
        let credentials = auth_ref.and_then(|r| self.credentials.resolve(r));
        Arc::new(crate::rest::ReqwestTransport::new(credentials))
    }
}

use thiserror::Error;

/// Server registry errors.
///
/// Persistence failures are scoped to a single entry where possible: a
/// target that cannot be reconstructed from its own settings is dropped and
/// reported while the remaining entries are still persisted.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// A target with this name already exists
    #[error("a server named '{0}' already exists")]
    NameCollision(String),

    /// The persisted blob references a target type that is not supported
    #[error("unsupported server type '{0}'")]
    UnknownType(String),

    /// A target instance could not be rebuilt from its declared settings
    #[error("could not initialize {type_name} from stored settings: {reason}")]
    Reconstruction { type_name: String, reason: String },

    /// No server registered under this name
    #[error("no server named '{0}' is configured")]
    NotFound(String),

    #[error("failed to serialize server configuration: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to read or write server configuration: {0}")]
    Io(#[from] std::io::Error),
}

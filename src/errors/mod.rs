//! Domain-specific error types for geopublish.
//!
//! Errors are split per domain so that callers can recover at the smallest
//! unit that makes sense: a single HTTP request, one publish step for one
//! layer, or one registry entry.

pub mod publish;
pub mod registry;
pub mod transport;

pub use publish::PublishError;
pub use registry::RegistryError;
pub use transport::TransportError;

/// Result type alias for HTTP transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type alias for publish operations against a target
pub type PublishResult<T> = Result<T, PublishError>;

/// Result type alias for server registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_result_alias() {
        let result: TransportResult<()> = Err(TransportError::Status {
            method: "GET".into(),
            url: "http://localhost/rest".into(),
            status: 500,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_publish_result_alias() {
        let result: PublishResult<()> = Err(PublishError::ImportWorkflow("boom".into()));
        assert!(result.is_err());
    }

    #[test]
    fn test_registry_result_alias() {
        let result: RegistryResult<()> = Err(RegistryError::NameCollision("gs".into()));
        assert!(result.is_err());
    }
}

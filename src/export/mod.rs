pub mod consolidator;

pub use consolidator::{ArtifactConsolidator, ExportOutcome, SourceKey};

pub mod orchestrator;
pub mod report;

pub use orchestrator::{
    MetadataPolicy, PublishOrchestrator, PublishRequest, RunningPublish,
};
pub use report::{
    LayerResult, ProgressReporter, PublishReport, PublishStep, RunOutcome, TracingReporter,
};

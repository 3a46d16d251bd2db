pub mod cleanup;
pub mod orchestrator;
pub mod source;

pub use cleanup::{cleanup_duplicates, CleanupReport};
pub use orchestrator::{IncrementalPipeline, RunReport};
pub use source::{IngestInput, IngestSource};

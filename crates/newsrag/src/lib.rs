//! News-article ingestion and hybrid retrieval engine.
//!
//! The ingest path turns XML feed documents into normalized article records,
//! rejects duplicates, embeds content, and reconciles vectors into an ANN
//! index. The query path fuses dense, lexical, and metadata signals into a
//! ranked result list and a bounded generation context.

pub mod config;
pub mod context;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod pipeline;
pub mod query;
pub mod retrieval;
pub mod store;
pub mod types;

// Re-export primary types for convenience
pub use config::PlatformConfig;
pub use context::AppContext;
pub use engine::{IncrementalReport, NewsRagEngine, QueryResponse, SystemStats};
pub use error::{
    EmbedError, IndexError, ParseError, PlatformError, Result, RetrievalError, StoreError,
};
pub use pipeline::{IncrementalPipeline, IngestSource, RunReport};
pub use retrieval::{QueryOptions, RetrievedDoc, SearchWeights};
pub use types::{
    ArticleRecord, ArticleType, DedupDecision, EmbeddingRecord, IndexState, MetadataRecord,
    SearchFilters,
};

pub use uuid::Uuid;

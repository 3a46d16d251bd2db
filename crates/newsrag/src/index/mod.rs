pub mod client;
pub mod indexer;
pub mod lance;
pub mod local_json;

pub use client::{
    AnnIndexClient, FilterClause, FilterOp, MetadataPredicate, ProviderIndexStatus, VectorKey,
    VectorUpsert,
};
pub use indexer::{ArticleVectors, ReconcileReport, UpsertReport, VectorIndexer};
pub use lance::LanceAnnIndex;
pub use local_json::JsonFileIndex;

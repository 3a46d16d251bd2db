pub mod context;
pub mod engine;

pub use context::{BuiltContext, ContextBuilder, Reference};
pub use engine::{
    HybridRetrievalEngine, QueryOptions, RetrievalOutcome, RetrievedDoc, SearchWeights,
};

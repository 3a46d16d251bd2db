pub mod analyzer;

pub use analyzer::{AnalyzedQuery, QueryAnalyzer, QueryComplexity, QueryIntent};

pub mod chunker;
pub mod dedup;
pub mod extractor;
pub mod hasher;
pub mod parser;

pub use chunker::{Chunk, ChunkStrategy, TextChunker};
pub use dedup::{DuplicateDetector, DuplicateStats};
pub use extractor::MetadataExtractor;
pub use hasher::{ContentHasher, HashStrength};
pub use parser::ArticleParser;

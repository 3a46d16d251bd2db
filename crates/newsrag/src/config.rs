use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::ingest::chunker::ChunkStrategy;
use crate::ingest::hasher::HashStrength;
use crate::types::Distance;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub data_dir: PathBuf,
    pub hashing: HashingConfig,
    pub dedup: DedupConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub indexing: IndexingConfig,
    pub pipeline: PipelineConfig,
    pub search: SearchConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashingConfig {
    /// Active hash strength; only this one is persisted.
    pub strength: HashStrength,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NearDuplicatePolicy {
    /// Persist both articles, linked via `similar_to`.
    Annotate,
    /// Strict mode: reject the newcomer.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    pub similarity_threshold: f64,
    pub policy: NearDuplicatePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub strategy: ChunkStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackendKind {
    /// Remote text-embedding service, batch cap 5.
    Managed,
    /// In-process multilingual ONNX model, batch cap 32.
    Local,
    /// Deterministic seeded vectors derived from the text hash.
    HashFallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackendKind,
    pub dimension: usize,
    pub model_dir: PathBuf,
    /// Managed backend endpoint; ignored by the other backends.
    pub endpoint: Option<String>,
    /// Environment variable holding the managed backend credential.
    pub api_key_env: String,
    pub model_id: String,
    pub cache_size: usize,
    /// Byte budget for `indexing_text`.
    pub indexing_text_budget: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnProviderKind {
    /// Column-store ANN index on local disk.
    Lance,
    /// JSON-file-backed linear scan for development.
    LocalJson,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    pub provider: AnnProviderKind,
    pub index_name: String,
    pub dimensions: usize,
    pub distance: Distance,
    /// Store-side commit unit for upserts.
    pub batch_size: usize,
    pub retry_base_ms: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub max_workers: usize,
    pub batch_size: usize,
    /// Upper bound on articles embedded per invocation.
    pub max_per_run: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub top_k: usize,
    /// Both backends fetch `top_k * candidate_multiplier` candidates.
    pub candidate_multiplier: usize,
    pub vector_weight: f64,
    pub keyword_weight: f64,
    pub rerank_weight: f64,
    pub similarity_threshold: f64,
    pub max_context_length: usize,
    pub max_query_keywords: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub endpoint: Option<String>,
    pub model: String,
    pub api_key_env: String,
    pub max_output_tokens: u32,
}

impl PlatformConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be > 0".into());
        }
        if self.indexing.dimensions != self.embedding.dimension {
            return Err("indexing.dimensions must equal embedding.dimension".into());
        }
        if self.chunking.chunk_size < 50 {
            return Err("chunking.chunk_size must be >= 50".into());
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err("chunking.chunk_overlap must be < chunk_size".into());
        }
        if !(0.0..=1.0).contains(&self.dedup.similarity_threshold) {
            return Err("dedup.similarity_threshold must be in [0.0, 1.0]".into());
        }
        if self.pipeline.max_workers == 0 {
            return Err("pipeline.max_workers must be > 0".into());
        }
        if self.pipeline.batch_size == 0 {
            return Err("pipeline.batch_size must be > 0".into());
        }
        if self.search.top_k == 0 {
            return Err("search.top_k must be > 0".into());
        }
        if self.search.candidate_multiplier == 0 {
            return Err("search.candidate_multiplier must be > 0".into());
        }
        let weight_sum =
            self.search.vector_weight + self.search.keyword_weight + self.search.rerank_weight;
        if !(0.0..=1.0 + 1e-9).contains(&weight_sum) {
            return Err("search weights must be non-negative and sum to <= 1.0".into());
        }
        if self.indexing.max_attempts == 0 {
            return Err("indexing.max_attempts must be > 0".into());
        }
        Ok(())
    }

    /// Load config from a JSON file, validating before returning.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("newsrag");

        let model_dir = if Path::new("models").exists() {
            PathBuf::from("models")
        } else if let Ok(env_path) = std::env::var("MODEL_PATH") {
            PathBuf::from(env_path)
        } else {
            data_dir.join("models")
        };

        Self {
            data_dir,
            hashing: HashingConfig {
                strength: HashStrength::Bits128,
            },
            dedup: DedupConfig {
                similarity_threshold: 0.8,
                policy: NearDuplicatePolicy::Annotate,
            },
            chunking: ChunkingConfig {
                chunk_size: 500,
                chunk_overlap: 50,
                strategy: ChunkStrategy::Fixed,
            },
            embedding: EmbeddingConfig {
                backend: EmbeddingBackendKind::HashFallback,
                dimension: 768,
                model_dir,
                endpoint: None,
                api_key_env: "EMBEDDING_API_KEY".to_string(),
                model_id: "text-multilingual-embedding".to_string(),
                cache_size: 1000,
                indexing_text_budget: 2048,
            },
            indexing: IndexingConfig {
                provider: AnnProviderKind::Lance,
                index_name: "news-article-index".to_string(),
                dimensions: 768,
                distance: Distance::DotProduct,
                batch_size: 50,
                retry_base_ms: 500,
                max_attempts: 5,
            },
            pipeline: PipelineConfig {
                max_workers: 4,
                batch_size: 50,
                max_per_run: 1000,
            },
            search: SearchConfig {
                top_k: 10,
                candidate_multiplier: 2,
                vector_weight: 0.6,
                keyword_weight: 0.3,
                rerank_weight: 0.1,
                similarity_threshold: 0.7,
                max_context_length: 4000,
                max_query_keywords: 10,
            },
            llm: LlmConfig {
                endpoint: None,
                model: "news-assistant".to_string(),
                api_key_env: "LLM_API_KEY".to_string(),
                max_output_tokens: 2048,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(PlatformConfig::default().validate().is_ok());
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let mut config = PlatformConfig::default();
        config.chunking.chunk_overlap = config.chunking.chunk_size;
        assert!(config.validate().is_err());
    }

    #[test]
    fn weights_must_sum_within_one() {
        let mut config = PlatformConfig::default();
        config.search.vector_weight = 0.9;
        config.search.keyword_weight = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn dimension_must_match_index() {
        let mut config = PlatformConfig::default();
        config.indexing.dimensions = 1024;
        assert!(config.validate().is_err());
    }
}

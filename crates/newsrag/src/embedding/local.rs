use std::path::Path;

use async_trait::async_trait;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use parking_lot::Mutex;
use tokenizers::Tokenizer;

use super::{l2_normalize, EmbeddingModel};
use crate::error::EmbedError;

/// Token window of the encoder.
const MAX_TOKENS: usize = 512;
/// In-process batches stay small enough to keep inference latency bounded.
const LOCAL_BATCH_LIMIT: usize = 32;

/// In-process multilingual sentence encoder (ONNX). Mean-pools the last
/// hidden state under the attention mask and L2-normalizes, so dot-product
/// and cosine rank identically downstream.
pub struct LocalEmbeddings {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    dimension: usize,
    model_id: String,
}

impl LocalEmbeddings {
    /// Load `model.onnx` + `tokenizer.json` from the model directory.
    pub fn load(model_dir: &Path) -> Result<Self, EmbedError> {
        let model_path = model_dir.join("model.onnx");
        if !model_path.exists() {
            return Err(EmbedError::ProviderUnavailable(format!(
                "model file not found at {}",
                model_path.display()
            )));
        }

        ort::init().with_name("newsrag_embeddings").commit();

        let model_bytes = std::fs::read(&model_path)
            .map_err(|e| EmbedError::ProviderUnavailable(format!("read model: {}", e)))?;

        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(num_threads))
            .and_then(|b| b.with_inter_threads(1))
            .and_then(|b| b.with_memory_pattern(true))
            .and_then(|b| b.commit_from_memory(&model_bytes))
            .map_err(|e| EmbedError::ProviderUnavailable(format!("load model: {:?}", e)))?;

        let tokenizer = Tokenizer::from_file(model_dir.join("tokenizer.json"))
            .map_err(|e| EmbedError::ProviderUnavailable(format!("load tokenizer: {}", e)))?;

        let dimension = 768;
        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            dimension,
            model_id: "local-multilingual-onnx".to_string(),
        })
    }

    fn run_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut token_batches: Vec<Vec<i64>> = Vec::with_capacity(texts.len());
        let mut max_len = 0usize;
        for text in texts {
            let encoding = self
                .tokenizer
                .encode(text.as_str(), true)
                .map_err(|e| EmbedError::ProviderUnavailable(format!("tokenize: {}", e)))?;
            let mut ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
            ids.truncate(MAX_TOKENS);
            max_len = max_len.max(ids.len());
            token_batches.push(ids);
        }
        let padded_len = max_len.min(MAX_TOKENS).max(1);
        let batch_size = token_batches.len();

        let mut input_ids = Vec::with_capacity(batch_size * padded_len);
        let mut attention_mask = Vec::with_capacity(batch_size * padded_len);
        for ids in &token_batches {
            for &id in ids {
                input_ids.push(id);
                attention_mask.push(1i64);
            }
            for _ in ids.len()..padded_len {
                input_ids.push(0i64);
                attention_mask.push(0i64);
            }
        }

        let shape = vec![batch_size, padded_len];
        let ids_tensor = Value::from_array((shape.clone(), input_ids))
            .map_err(|e| EmbedError::ProviderUnavailable(format!("input_ids tensor: {:?}", e)))?;
        let mask_tensor = Value::from_array((shape, attention_mask.clone())).map_err(|e| {
            EmbedError::ProviderUnavailable(format!("attention_mask tensor: {:?}", e))
        })?;

        let inputs = ort::inputs![
            "input_ids" => ids_tensor,
            "attention_mask" => mask_tensor,
        ];

        let mut session = self.session.lock();
        let outputs = session
            .run(inputs)
            .map_err(|e| EmbedError::ProviderUnavailable(format!("inference: {:?}", e)))?;

        let (out_shape, data) = outputs["last_hidden_state"]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::ProviderUnavailable(format!("extract output: {:?}", e)))?;

        let seq_len = out_shape[1] as usize;
        let hidden_dim = out_shape[2] as usize;
        if hidden_dim != self.dimension {
            return Err(EmbedError::DimensionMismatch {
                expected: self.dimension,
                got: hidden_dim,
            });
        }

        let mut embeddings = Vec::with_capacity(batch_size);
        for sample in 0..batch_size {
            let mask_offset = sample * padded_len;
            let sample_offset = sample * seq_len * hidden_dim;
            let mut pooled = vec![0.0f32; hidden_dim];
            let mut mask_sum = 0.0f32;

            for pos in 0..seq_len {
                let mask_val = attention_mask
                    .get(mask_offset + pos)
                    .copied()
                    .unwrap_or(0) as f32;
                if mask_val > 0.0 {
                    mask_sum += mask_val;
                    let offset = sample_offset + pos * hidden_dim;
                    for dim in 0..hidden_dim {
                        pooled[dim] += data[offset + dim] * mask_val;
                    }
                }
            }
            if mask_sum > 0.0 {
                for value in pooled.iter_mut() {
                    *value /= mask_sum;
                }
            }
            l2_normalize(&mut pooled);
            embeddings.push(pooled);
        }

        Ok(embeddings)
    }
}

#[async_trait]
impl EmbeddingModel for LocalEmbeddings {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let input = [text.to_string()];
        self.run_batch(&input)?
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::ProviderUnavailable("empty model output".to_string()))
    }

    async fn embed_document(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.embed_query(text).await
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(LOCAL_BATCH_LIMIT) {
            all.extend(self.run_batch(batch)?);
        }
        Ok(all)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn batch_limit(&self) -> usize {
        LOCAL_BATCH_LIMIT
    }
}

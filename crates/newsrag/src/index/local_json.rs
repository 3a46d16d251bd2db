use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::client::{
    AnnIndexClient, MetadataPredicate, ProviderIndexStatus, VectorKey, VectorUpsert,
};
use crate::error::IndexError;
use crate::types::Distance;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVector {
    vector: Vec<f32>,
    fields: HashMap<String, Value>,
    tombstoned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexFile {
    name: String,
    dimensions: usize,
    distance: Distance,
    vectors: HashMap<String, StoredVector>,
}

/// Development-mode ANN provider: one JSON file per index, exhaustive scan
/// at query time. Mirrors the production contract (tombstones, DNF filters,
/// idempotent creation) without any external service.
pub struct JsonFileIndex {
    dir: PathBuf,
    indices: RwLock<HashMap<String, IndexFile>>,
}

impl JsonFileIndex {
    pub fn new(dir: &Path) -> Result<Self, IndexError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| IndexError::ProviderPermanent(format!("create dir: {}", e)))?;

        let mut indices = HashMap::new();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    if let Ok(content) = std::fs::read_to_string(&path) {
                        if let Ok(file) = serde_json::from_str::<IndexFile>(&content) {
                            indices.insert(file.name.clone(), file);
                        }
                    }
                }
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            indices: RwLock::new(indices),
        })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    fn persist(&self, file: &IndexFile) -> Result<(), IndexError> {
        let json = serde_json::to_string(file)
            .map_err(|e| IndexError::ProviderPermanent(format!("serialize index: {}", e)))?;
        std::fs::write(self.path_for(&file.name), json)
            .map_err(|e| IndexError::ProviderTransient(format!("write index: {}", e)))?;
        Ok(())
    }

    fn score(distance: Distance, a: &[f32], b: &[f32]) -> f32 {
        match distance {
            Distance::DotProduct => dot(a, b),
            Distance::Cosine => {
                let denom = norm(a) * norm(b);
                if denom > 1e-12 {
                    dot(a, b) / denom
                } else {
                    0.0
                }
            }
            Distance::Euclidean => {
                let dist: f32 = a
                    .iter()
                    .zip(b.iter())
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f32>()
                    .sqrt();
                -dist
            }
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f32]) -> f32 {
    dot(a, a).sqrt()
}

#[async_trait]
impl AnnIndexClient for JsonFileIndex {
    async fn create_index(
        &self,
        name: &str,
        dimensions: usize,
        distance: Distance,
    ) -> Result<String, IndexError> {
        let mut indices = self.indices.write();
        if let Some(existing) = indices.get(name) {
            if existing.dimensions != dimensions {
                return Err(IndexError::DimensionConflict {
                    name: name.to_string(),
                    active: existing.dimensions,
                    requested: dimensions,
                });
            }
            return Ok(name.to_string());
        }
        let file = IndexFile {
            name: name.to_string(),
            dimensions,
            distance,
            vectors: HashMap::new(),
        };
        self.persist(&file)?;
        indices.insert(name.to_string(), file);
        Ok(name.to_string())
    }

    async fn create_endpoint(&self, endpoint_name: &str) -> Result<String, IndexError> {
        Ok(format!("json-endpoint/{}", endpoint_name))
    }

    async fn deploy(
        &self,
        index_id: &str,
        _endpoint_id: &str,
        deployed_id: &str,
    ) -> Result<String, IndexError> {
        if !self.indices.read().contains_key(index_id) {
            return Err(IndexError::NotCreated);
        }
        Ok(deployed_id.to_string())
    }

    async fn upsert(&self, index_id: &str, vectors: &[VectorUpsert]) -> Result<(), IndexError> {
        let mut indices = self.indices.write();
        let file = indices.get_mut(index_id).ok_or(IndexError::NotCreated)?;
        for upsert in vectors {
            if upsert.vector.len() != file.dimensions {
                return Err(IndexError::ProviderPermanent(format!(
                    "vector width {} does not match index width {}",
                    upsert.vector.len(),
                    file.dimensions
                )));
            }
            file.vectors.insert(
                upsert.key.encode(),
                StoredVector {
                    vector: upsert.vector.clone(),
                    fields: upsert.fields.clone(),
                    tombstoned: false,
                },
            );
        }
        let snapshot = file.clone();
        drop(indices);
        self.persist(&snapshot)
    }

    async fn tombstone(&self, index_id: &str, keys: &[VectorKey]) -> Result<(), IndexError> {
        let mut indices = self.indices.write();
        let file = indices.get_mut(index_id).ok_or(IndexError::NotCreated)?;
        for key in keys {
            if let Some(stored) = file.vectors.get_mut(&key.encode()) {
                stored.tombstoned = true;
            } else {
                file.vectors.insert(
                    key.encode(),
                    StoredVector {
                        vector: vec![0.0; file.dimensions],
                        fields: HashMap::new(),
                        tombstoned: true,
                    },
                );
            }
        }
        let snapshot = file.clone();
        drop(indices);
        self.persist(&snapshot)
    }

    async fn query(
        &self,
        index_id: &str,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataPredicate>,
    ) -> Result<Vec<(VectorKey, f32)>, IndexError> {
        let indices = self.indices.read();
        let file = indices.get(index_id).ok_or(IndexError::NotCreated)?;

        let mut hits: Vec<(VectorKey, f32)> = file
            .vectors
            .iter()
            .filter(|(_, stored)| !stored.tombstoned)
            .filter(|(_, stored)| {
                filter.map(|f| f.matches(&stored.fields)).unwrap_or(true)
            })
            .filter_map(|(key, stored)| {
                let key = VectorKey::decode(key)?;
                Some((key, Self::score(file.distance, vector, &stored.vector)))
            })
            .collect();

        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn contains(&self, index_id: &str, key: &VectorKey) -> Result<bool, IndexError> {
        let indices = self.indices.read();
        let file = indices.get(index_id).ok_or(IndexError::NotCreated)?;
        Ok(file
            .vectors
            .get(&key.encode())
            .map(|v| !v.tombstoned)
            .unwrap_or(false))
    }

    async fn get_index_status(&self, index_id: &str) -> Result<ProviderIndexStatus, IndexError> {
        let indices = self.indices.read();
        let file = indices.get(index_id).ok_or(IndexError::NotCreated)?;
        Ok(ProviderIndexStatus {
            vector_count: file.vectors.values().filter(|v| !v.tombstoned).count() as u64,
            ready: true,
        })
    }

    async fn delete_index(&self, index_id: &str) -> Result<(), IndexError> {
        self.indices.write().remove(index_id);
        std::fs::remove_file(self.path_for(index_id)).ok();
        Ok(())
    }

    async fn delete_endpoint(&self, _endpoint_id: &str) -> Result<(), IndexError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::client::{FilterClause, FilterOp};
    use serde_json::json;
    use uuid::Uuid;

    fn upsert_for(key: VectorKey, vector: Vec<f32>, publish_ts: i64) -> VectorUpsert {
        let mut fields = HashMap::new();
        fields.insert("publish_ts".to_string(), json!(publish_ts));
        fields.insert("article_type".to_string(), json!("financial"));
        VectorUpsert {
            key,
            vector,
            fields,
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_and_checks_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let index = JsonFileIndex::new(dir.path()).unwrap();
        index.create_index("news", 4, Distance::DotProduct).await.unwrap();
        index.create_index("news", 4, Distance::DotProduct).await.unwrap();
        let err = index
            .create_index("news", 8, Distance::DotProduct)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::DimensionConflict { .. }));
    }

    #[tokio::test]
    async fn upsert_query_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let index = JsonFileIndex::new(dir.path()).unwrap();
        index.create_index("news", 3, Distance::DotProduct).await.unwrap();

        let close = VectorKey::new(Uuid::new_v4(), 0);
        let far = VectorKey::new(Uuid::new_v4(), 0);
        index
            .upsert(
                "news",
                &[
                    upsert_for(close, vec![1.0, 0.0, 0.0], 100),
                    upsert_for(far, vec![0.0, 1.0, 0.0], 100),
                ],
            )
            .await
            .unwrap();

        let hits = index
            .query("news", &[1.0, 0.0, 0.0], 2, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, close);
        assert!(hits[0].1 > hits[1].1);
    }

    #[tokio::test]
    async fn tombstoned_vectors_disappear_from_queries() {
        let dir = tempfile::tempdir().unwrap();
        let index = JsonFileIndex::new(dir.path()).unwrap();
        index.create_index("news", 2, Distance::DotProduct).await.unwrap();

        let key = VectorKey::new(Uuid::new_v4(), 0);
        index
            .upsert("news", &[upsert_for(key, vec![1.0, 0.0], 1)])
            .await
            .unwrap();
        assert!(index.contains("news", &key).await.unwrap());

        index.tombstone("news", &[key]).await.unwrap();
        assert!(!index.contains("news", &key).await.unwrap());
        assert!(index.query("news", &[1.0, 0.0], 5, None).await.unwrap().is_empty());
        assert_eq!(index.get_index_status("news").await.unwrap().vector_count, 0);
    }

    #[tokio::test]
    async fn filter_restricts_results() {
        let dir = tempfile::tempdir().unwrap();
        let index = JsonFileIndex::new(dir.path()).unwrap();
        index.create_index("news", 2, Distance::DotProduct).await.unwrap();

        let old = VectorKey::new(Uuid::new_v4(), 0);
        let new = VectorKey::new(Uuid::new_v4(), 0);
        index
            .upsert(
                "news",
                &[
                    upsert_for(old, vec![1.0, 0.0], 100),
                    upsert_for(new, vec![1.0, 0.0], 900),
                ],
            )
            .await
            .unwrap();

        let predicate = MetadataPredicate::single_group(vec![FilterClause::new(
            "publish_ts",
            FilterOp::Ge,
            json!(500),
        )]);
        let hits = index
            .query("news", &[1.0, 0.0], 10, Some(&predicate))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, new);
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let key = VectorKey::new(Uuid::new_v4(), 0);
        {
            let index = JsonFileIndex::new(dir.path()).unwrap();
            index.create_index("news", 2, Distance::DotProduct).await.unwrap();
            index
                .upsert("news", &[upsert_for(key, vec![0.5, 0.5], 1)])
                .await
                .unwrap();
        }
        let reopened = JsonFileIndex::new(dir.path()).unwrap();
        assert!(reopened.contains("news", &key).await.unwrap());
    }
}

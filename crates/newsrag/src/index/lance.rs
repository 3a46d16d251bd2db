use std::sync::Arc;

use arrow_array::{
    Array, BooleanArray, FixedSizeListArray, Float32Array, Int64Array, RecordBatch,
    RecordBatchIterator, StringArray, UInt32Array,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use dashmap::DashMap;
use lancedb::query::{ExecutableQuery, QueryBase};
use serde_json::Value;

use super::client::{
    AnnIndexClient, MetadataPredicate, ProviderIndexStatus, VectorKey, VectorUpsert,
};
use crate::error::IndexError;
use crate::types::Distance;

/// Column-store ANN provider on local disk. Each index is one table keyed by
/// `article_id#chunk_index`; tombstones are rows flagged `tombstoned` that
/// every query excludes.
pub struct LanceAnnIndex {
    db: lancedb::Connection,
    /// Per-index dimension/distance registered at creation.
    registry: DashMap<String, (usize, Distance)>,
    default_distance: Distance,
}

impl LanceAnnIndex {
    pub async fn connect(path: &str, default_distance: Distance) -> Result<Self, IndexError> {
        std::fs::create_dir_all(path).ok();
        let db = lancedb::connect(path)
            .execute()
            .await
            .map_err(|e| IndexError::ProviderPermanent(format!("connect: {}", e)))?;
        Ok(Self {
            db,
            registry: DashMap::new(),
            default_distance,
        })
    }

    fn schema(dimensions: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("key", DataType::Utf8, false),
            Field::new("article_id", DataType::Utf8, false),
            Field::new("chunk_index", DataType::UInt32, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimensions as i32,
                ),
                true,
            ),
            Field::new("publish_ts", DataType::Int64, false),
            Field::new("article_type", DataType::Utf8, false),
            Field::new("tombstoned", DataType::Boolean, false),
        ]))
    }

    fn build_batch(
        dimensions: usize,
        rows: &[(VectorKey, Vec<f32>, i64, String, bool)],
    ) -> Result<RecordBatch, IndexError> {
        let schema = Self::schema(dimensions);

        let keys: Vec<String> = rows.iter().map(|(k, ..)| k.encode()).collect();
        let article_ids: Vec<String> = rows.iter().map(|(k, ..)| k.article_id.to_string()).collect();
        let chunk_indices: Vec<u32> = rows.iter().map(|(k, ..)| k.chunk_index).collect();
        let publish_ts: Vec<i64> = rows.iter().map(|(_, _, ts, _, _)| *ts).collect();
        let article_types: Vec<&str> = rows.iter().map(|(_, _, _, ty, _)| ty.as_str()).collect();
        let tombstones: Vec<bool> = rows.iter().map(|(_, _, _, _, t)| *t).collect();

        let flat_vectors: Vec<f32> = rows
            .iter()
            .flat_map(|(_, v, ..)| v.iter().copied())
            .collect();
        let values = Float32Array::from(flat_vectors);
        let vector_array = FixedSizeListArray::new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            dimensions as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        );

        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(keys)) as Arc<dyn Array>,
                Arc::new(StringArray::from(article_ids)),
                Arc::new(UInt32Array::from(chunk_indices)),
                Arc::new(vector_array) as Arc<dyn Array>,
                Arc::new(Int64Array::from(publish_ts)),
                Arc::new(StringArray::from(article_types)),
                Arc::new(BooleanArray::from(tombstones)),
            ],
        )
        .map_err(|e| IndexError::ProviderPermanent(format!("record batch: {}", e)))
    }

    async fn open_table(&self, index_id: &str) -> Result<lancedb::Table, IndexError> {
        self.db
            .open_table(index_id)
            .execute()
            .await
            .map_err(|e| IndexError::ProviderTransient(format!("open table: {}", e)))
    }

    async fn delete_keys(&self, table: &lancedb::Table, keys: &[VectorKey]) -> Result<(), IndexError> {
        for chunk in keys.chunks(50) {
            let list: Vec<String> = chunk
                .iter()
                .map(|k| format!("'{}'", k.encode()))
                .collect();
            table
                .delete(&format!("key IN ({})", list.join(", ")))
                .await
                .map_err(|e| IndexError::ProviderTransient(format!("delete: {}", e)))?;
        }
        Ok(())
    }

    fn dims_and_distance(&self, index_id: &str) -> (Option<usize>, Distance) {
        match self.registry.get(index_id) {
            Some(entry) => (Some(entry.0), entry.1),
            None => (None, self.default_distance),
        }
    }

    fn rows_from_upserts(vectors: &[VectorUpsert]) -> Vec<(VectorKey, Vec<f32>, i64, String, bool)> {
        vectors
            .iter()
            .map(|v| {
                let publish_ts = v
                    .fields
                    .get("publish_ts")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let article_type = v
                    .fields
                    .get("article_type")
                    .and_then(Value::as_str)
                    .unwrap_or("general")
                    .to_string();
                (v.key, v.vector.clone(), publish_ts, article_type, false)
            })
            .collect()
    }
}

#[async_trait]
impl AnnIndexClient for LanceAnnIndex {
    async fn create_index(
        &self,
        name: &str,
        dimensions: usize,
        distance: Distance,
    ) -> Result<String, IndexError> {
        let names = self
            .db
            .table_names()
            .execute()
            .await
            .map_err(|e| IndexError::ProviderTransient(format!("table names: {}", e)))?;

        if names.contains(&name.to_string()) {
            // Verify the existing table's vector width instead of recreating.
            let table = self.open_table(name).await?;
            let schema = table
                .schema()
                .await
                .map_err(|e| IndexError::ProviderPermanent(format!("schema: {}", e)))?;
            let existing = schema
                .field_with_name("vector")
                .ok()
                .and_then(|f| match f.data_type() {
                    DataType::FixedSizeList(_, size) => Some(*size as usize),
                    _ => None,
                });
            if let Some(existing) = existing {
                if existing != dimensions {
                    return Err(IndexError::DimensionConflict {
                        name: name.to_string(),
                        active: existing,
                        requested: dimensions,
                    });
                }
            }
        } else {
            // Create with a seed row, then remove it (empty-table creation
            // needs a concrete batch to pin the schema).
            let seed_key = VectorKey::new(uuid::Uuid::nil(), u32::MAX);
            let rows = vec![(
                seed_key,
                vec![0.0f32; dimensions],
                0i64,
                "general".to_string(),
                true,
            )];
            let batch = Self::build_batch(dimensions, &rows)?;
            let schema = batch.schema();
            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
            self.db
                .create_table(name, Box::new(batches))
                .execute()
                .await
                .map_err(|e| IndexError::ProviderPermanent(format!("create table: {}", e)))?;

            let table = self.open_table(name).await?;
            table
                .delete(&format!("key = '{}'", seed_key.encode()))
                .await
                .ok();
        }

        self.registry
            .insert(name.to_string(), (dimensions, distance));
        Ok(name.to_string())
    }

    async fn create_endpoint(&self, endpoint_name: &str) -> Result<String, IndexError> {
        // Local provider serves queries directly; the endpoint is bookkeeping.
        Ok(format!("local-endpoint/{}", endpoint_name))
    }

    async fn deploy(
        &self,
        index_id: &str,
        _endpoint_id: &str,
        deployed_id: &str,
    ) -> Result<String, IndexError> {
        let names = self
            .db
            .table_names()
            .execute()
            .await
            .map_err(|e| IndexError::ProviderTransient(format!("table names: {}", e)))?;
        if !names.contains(&index_id.to_string()) {
            return Err(IndexError::NotCreated);
        }
        Ok(deployed_id.to_string())
    }

    async fn upsert(&self, index_id: &str, vectors: &[VectorUpsert]) -> Result<(), IndexError> {
        if vectors.is_empty() {
            return Ok(());
        }
        let (dims, _) = self.dims_and_distance(index_id);
        let dimensions = dims.unwrap_or_else(|| vectors[0].vector.len());

        let table = self.open_table(index_id).await?;
        let keys: Vec<VectorKey> = vectors.iter().map(|v| v.key).collect();
        self.delete_keys(&table, &keys).await?;

        let rows = Self::rows_from_upserts(vectors);
        let batch = Self::build_batch(dimensions, &rows)?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(Box::new(reader))
            .execute()
            .await
            .map_err(|e| IndexError::ProviderTransient(format!("add: {}", e)))?;

        tracing::debug!(index = index_id, count = vectors.len(), "upserted vectors");
        Ok(())
    }

    async fn tombstone(&self, index_id: &str, keys: &[VectorKey]) -> Result<(), IndexError> {
        if keys.is_empty() {
            return Ok(());
        }
        let (dims, _) = self.dims_and_distance(index_id);
        let dimensions = dims.unwrap_or(1);

        let table = self.open_table(index_id).await?;
        self.delete_keys(&table, keys).await?;

        let rows: Vec<_> = keys
            .iter()
            .map(|k| (*k, vec![0.0f32; dimensions], 0i64, "general".to_string(), true))
            .collect();
        let batch = Self::build_batch(dimensions, &rows)?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(Box::new(reader))
            .execute()
            .await
            .map_err(|e| IndexError::ProviderTransient(format!("tombstone add: {}", e)))?;
        Ok(())
    }

    async fn query(
        &self,
        index_id: &str,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataPredicate>,
    ) -> Result<Vec<(VectorKey, f32)>, IndexError> {
        let (_, distance) = self.dims_and_distance(index_id);
        let table = self.open_table(index_id).await?;

        let distance_type = match distance {
            Distance::DotProduct => lancedb::DistanceType::Dot,
            Distance::Cosine => lancedb::DistanceType::Cosine,
            Distance::Euclidean => lancedb::DistanceType::L2,
        };

        let mut predicate = "tombstoned = false".to_string();
        if let Some(sql) = filter.and_then(|f| f.to_sql()) {
            predicate = format!("{} AND ({})", predicate, sql);
        }

        let query = table
            .query()
            .nearest_to(vector)
            .map_err(|e| IndexError::ProviderPermanent(format!("nearest_to: {}", e)))?
            .distance_type(distance_type)
            .only_if(predicate)
            .limit(top_k);

        let results = query
            .execute()
            .await
            .map_err(|e| IndexError::ProviderTransient(format!("query: {}", e)))?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results)
            .await
            .map_err(|e| IndexError::ProviderTransient(format!("collect: {}", e)))?;

        let mut hits = Vec::new();
        for batch in &batches {
            let keys = batch
                .column_by_name("key")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>());
            let (Some(keys), Some(distances)) = (keys, distances) else {
                continue;
            };
            for i in 0..batch.num_rows() {
                let Some(key) = VectorKey::decode(keys.value(i)) else {
                    continue;
                };
                let similarity = match distance {
                    Distance::DotProduct => -distances.value(i),
                    Distance::Cosine => 1.0 - distances.value(i),
                    Distance::Euclidean => -distances.value(i),
                };
                hits.push((key, similarity));
            }
        }
        Ok(hits)
    }

    async fn contains(&self, index_id: &str, key: &VectorKey) -> Result<bool, IndexError> {
        let table = self.open_table(index_id).await?;
        let count = table
            .count_rows(Some(format!(
                "key = '{}' AND tombstoned = false",
                key.encode()
            )))
            .await
            .map_err(|e| IndexError::ProviderTransient(format!("count: {}", e)))?;
        Ok(count > 0)
    }

    async fn get_index_status(&self, index_id: &str) -> Result<ProviderIndexStatus, IndexError> {
        let table = self.open_table(index_id).await?;
        let count = table
            .count_rows(Some("tombstoned = false".to_string()))
            .await
            .map_err(|e| IndexError::ProviderTransient(format!("count: {}", e)))?;
        Ok(ProviderIndexStatus {
            vector_count: count as u64,
            ready: true,
        })
    }

    async fn delete_index(&self, index_id: &str) -> Result<(), IndexError> {
        self.db
            .drop_table(index_id, &[])
            .await
            .map_err(|e| IndexError::ProviderPermanent(format!("drop table: {}", e)))?;
        self.registry.remove(index_id);
        Ok(())
    }

    async fn delete_endpoint(&self, _endpoint_id: &str) -> Result<(), IndexError> {
        Ok(())
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::IndexError;
use crate::types::Distance;

/// Identity of one vector in the ANN index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorKey {
    pub article_id: Uuid,
    pub chunk_index: u32,
}

impl VectorKey {
    pub fn new(article_id: Uuid, chunk_index: u32) -> Self {
        Self {
            article_id,
            chunk_index,
        }
    }

    /// Provider-side string form.
    pub fn encode(&self) -> String {
        format!("{}#{}", self.article_id, self.chunk_index)
    }

    pub fn decode(s: &str) -> Option<Self> {
        let (id, chunk) = s.split_once('#')?;
        Some(Self {
            article_id: Uuid::parse_str(id).ok()?,
            chunk_index: chunk.parse().ok()?,
        })
    }
}

/// One vector plus the filterable metadata persisted beside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorUpsert {
    pub key: VectorKey,
    pub vector: Vec<f32>,
    pub fields: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterClause {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl FilterClause {
    pub fn new(field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    fn matches(&self, fields: &HashMap<String, Value>) -> bool {
        let Some(actual) = fields.get(&self.field) else {
            return false;
        };
        match (&self.op, compare(actual, &self.value)) {
            (FilterOp::Eq, Some(ord)) => ord == std::cmp::Ordering::Equal,
            (FilterOp::Ne, Some(ord)) => ord != std::cmp::Ordering::Equal,
            (FilterOp::Lt, Some(ord)) => ord == std::cmp::Ordering::Less,
            (FilterOp::Le, Some(ord)) => ord != std::cmp::Ordering::Greater,
            (FilterOp::Gt, Some(ord)) => ord == std::cmp::Ordering::Greater,
            (FilterOp::Ge, Some(ord)) => ord != std::cmp::Ordering::Less,
            (_, None) => false,
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Disjunctive-normal-form filter: OR over groups, AND within a group.
/// An empty predicate matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataPredicate {
    pub groups: Vec<Vec<FilterClause>>,
}

impl MetadataPredicate {
    pub fn single_group(clauses: Vec<FilterClause>) -> Self {
        Self {
            groups: vec![clauses],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.is_empty())
    }

    pub fn matches(&self, fields: &HashMap<String, Value>) -> bool {
        if self.is_empty() {
            return true;
        }
        self.groups
            .iter()
            .any(|group| group.iter().all(|clause| clause.matches(fields)))
    }

    /// SQL-ish rendering for providers with predicate pushdown.
    pub fn to_sql(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let groups: Vec<String> = self
            .groups
            .iter()
            .filter(|g| !g.is_empty())
            .map(|group| {
                let clauses: Vec<String> = group
                    .iter()
                    .map(|clause| {
                        let op = match clause.op {
                            FilterOp::Eq => "=",
                            FilterOp::Ne => "!=",
                            FilterOp::Lt => "<",
                            FilterOp::Le => "<=",
                            FilterOp::Gt => ">",
                            FilterOp::Ge => ">=",
                        };
                        let value = match &clause.value {
                            Value::String(s) => format!("'{}'", s.replace('\'', "''")),
                            other => other.to_string(),
                        };
                        format!("{} {} {}", clause.field, op, value)
                    })
                    .collect();
                format!("({})", clauses.join(" AND "))
            })
            .collect();
        Some(groups.join(" OR "))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderIndexStatus {
    pub vector_count: u64,
    pub ready: bool,
}

/// Contract the vector indexer depends on. The production provider is a
/// column-store ANN index; development substitutes a JSON-file linear scan.
/// Scores returned by `query` are similarities: higher is closer, whatever
/// the configured distance.
#[async_trait]
pub trait AnnIndexClient: Send + Sync {
    /// Idempotent: creating an index that exists verifies and returns it.
    async fn create_index(
        &self,
        name: &str,
        dimensions: usize,
        distance: Distance,
    ) -> Result<String, IndexError>;

    async fn create_endpoint(&self, endpoint_name: &str) -> Result<String, IndexError>;

    async fn deploy(
        &self,
        index_id: &str,
        endpoint_id: &str,
        deployed_id: &str,
    ) -> Result<String, IndexError>;

    /// At-least-once batch upsert keyed by `(article_id, chunk_index)`.
    async fn upsert(&self, index_id: &str, vectors: &[VectorUpsert]) -> Result<(), IndexError>;

    /// Logical delete: a tombstone marker that excludes keys from queries.
    async fn tombstone(&self, index_id: &str, keys: &[VectorKey]) -> Result<(), IndexError>;

    async fn query(
        &self,
        index_id: &str,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataPredicate>,
    ) -> Result<Vec<(VectorKey, f32)>, IndexError>;

    /// Membership probe used by reconciliation.
    async fn contains(&self, index_id: &str, key: &VectorKey) -> Result<bool, IndexError>;

    async fn get_index_status(&self, index_id: &str) -> Result<ProviderIndexStatus, IndexError>;

    async fn delete_index(&self, index_id: &str) -> Result<(), IndexError>;

    async fn delete_endpoint(&self, endpoint_id: &str) -> Result<(), IndexError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_encoding_round_trips() {
        let key = VectorKey::new(Uuid::new_v4(), 3);
        assert_eq!(VectorKey::decode(&key.encode()), Some(key));
        assert_eq!(VectorKey::decode("not-a-key"), None);
    }

    #[test]
    fn dnf_predicate_matches() {
        let predicate = MetadataPredicate {
            groups: vec![
                vec![
                    FilterClause::new("publish_ts", FilterOp::Ge, json!(100)),
                    FilterClause::new("publish_ts", FilterOp::Le, json!(200)),
                ],
                vec![FilterClause::new("article_type", FilterOp::Eq, json!("financial"))],
            ],
        };

        let mut fields = HashMap::new();
        fields.insert("publish_ts".to_string(), json!(150));
        fields.insert("article_type".to_string(), json!("general"));
        assert!(predicate.matches(&fields));

        fields.insert("publish_ts".to_string(), json!(50));
        assert!(!predicate.matches(&fields));

        fields.insert("article_type".to_string(), json!("financial"));
        assert!(predicate.matches(&fields));
    }

    #[test]
    fn empty_predicate_matches_everything() {
        let predicate = MetadataPredicate::default();
        assert!(predicate.matches(&HashMap::new()));
        assert_eq!(predicate.to_sql(), None);
    }

    #[test]
    fn sql_rendering_quotes_strings() {
        let predicate = MetadataPredicate::single_group(vec![FilterClause::new(
            "article_type",
            FilterOp::Eq,
            json!("financial"),
        )]);
        assert_eq!(
            predicate.to_sql().unwrap(),
            "(article_type = 'financial')"
        );
    }
}

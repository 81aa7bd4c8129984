//! In-memory [`VectorIndex`] implementation.
//!
//! Brute-force cosine similarity over a `HashMap`. Suitable for tests and
//! small single-process deployments; production installs plug a real vector
//! store in through the same trait.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use ordo_kernel::capabilities::{VectorIndex, VectorIndexStats, VectorMatch, VectorRecord};
use ordo_kernel::error::{OrdoError, OrdoResult};

#[derive(Default)]
pub struct InMemoryVectorIndex {
    records: RwLock<HashMap<String, VectorRecord>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a * norm_b)
    }

    fn filter_matches(record: &VectorRecord, filter: Option<&HashMap<String, String>>) -> bool {
        let Some(filter) = filter else { return true };
        filter.iter().all(|(key, expected)| {
            if key == "user_id" {
                return record.user_id == *expected;
            }
            record
                .payload
                .get(key)
                .and_then(|v| v.as_str())
                .map(|v| v == expected)
                .unwrap_or(false)
        })
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn add(&self, record: VectorRecord) -> OrdoResult<()> {
        if record.vector.is_empty() {
            return Err(OrdoError::SchemaValidationFailed(
                "vector must not be empty".into(),
            ));
        }
        let mut records = self.records.write().await;
        if let Some(existing) = records.values().next() {
            if existing.vector.len() != record.vector.len() {
                return Err(OrdoError::SchemaValidationFailed(format!(
                    "vector dimension {} does not match index dimension {}",
                    record.vector.len(),
                    existing.vector.len()
                )));
            }
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        filter: Option<&HashMap<String, String>>,
        top_k: usize,
        min_score: f32,
    ) -> OrdoResult<Vec<VectorMatch>> {
        let records = self.records.read().await;
        let mut matches: Vec<VectorMatch> = records
            .values()
            .filter(|r| Self::filter_matches(r, filter))
            .map(|r| VectorMatch {
                score: Self::cosine(query, &r.vector),
                record: r.clone(),
            })
            .filter(|m| m.score >= min_score)
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn delete(&self, id: &str) -> OrdoResult<bool> {
        Ok(self.records.write().await.remove(id).is_some())
    }

    async fn delete_by_user(&self, user_id: &str) -> OrdoResult<usize> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| r.user_id != user_id);
        Ok(before - records.len())
    }

    async fn stats(&self) -> OrdoResult<VectorIndexStats> {
        let records = self.records.read().await;
        Ok(VectorIndexStats {
            total_records: records.len(),
            dimensions: records.values().next().map(|r| r.vector.len()).unwrap_or(0),
        })
    }
}

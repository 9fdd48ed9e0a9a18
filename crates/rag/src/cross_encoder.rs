//! ONNX cross-encoder relevance model
//!
//! Scores (query, passage) pairs with a sequence-classification model. A
//! two-logit head is read as softmax P(relevant), a single logit through a
//! sigmoid. Inference runs on the blocking pool.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use ndarray::Array2;
use ort::{session::builder::GraphOptimizationLevel, session::Session, value::Tensor};
use parking_lot::Mutex;
use tokenizers::Tokenizer;

use grounding_config::RerankerSettings;
use grounding_core::RelevanceModel;

use crate::telemetry::{record_degraded, DegradedStage};
use crate::RagError;

struct Inner {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    max_seq_len: usize,
}

/// Cross-encoder backed by ONNX Runtime
#[derive(Clone)]
pub struct CrossEncoderModel {
    inner: Arc<Inner>,
    name: String,
}

impl CrossEncoderModel {
    pub fn load(
        model_path: impl AsRef<Path>,
        tokenizer_path: impl AsRef<Path>,
        max_seq_len: usize,
    ) -> Result<Self, RagError> {
        let model_path = model_path.as_ref();
        let session = Session::builder()
            .map_err(|e| RagError::Model(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| RagError::Model(e.to_string()))?
            .with_intra_threads(2)
            .map_err(|e| RagError::Model(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| RagError::Model(e.to_string()))?;

        let tokenizer =
            Tokenizer::from_file(tokenizer_path).map_err(|e| RagError::Model(e.to_string()))?;

        let name = model_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("cross-encoder")
            .to_string();

        tracing::info!(model = %name, max_seq_len, "Loaded cross-encoder");
        Ok(Self {
            inner: Arc::new(Inner {
                session: Mutex::new(session),
                tokenizer,
                max_seq_len: max_seq_len.max(1),
            }),
            name,
        })
    }

    /// Load from settings; `None` (with a degraded mark) when paths are
    /// missing or loading fails
    pub fn from_settings(settings: &RerankerSettings) -> Option<Self> {
        let (Some(model), Some(tokenizer)) = (&settings.model_path, &settings.tokenizer_path) else {
            return None;
        };
        match Self::load(model, tokenizer, settings.max_seq_len) {
            Ok(model) => Some(model),
            Err(e) => {
                tracing::warn!(error = %e, "Cross-encoder unavailable, using fallback scorer");
                record_degraded(DegradedStage::ModelLoad);
                None
            },
        }
    }
}

impl Inner {
    fn score_pairs(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, RagError> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let rows = passages.len();
        let seq = self.max_seq_len;
        let mut ids = vec![0i64; rows * seq];
        let mut mask = vec![0i64; rows * seq];

        for (row, passage) in passages.iter().enumerate() {
            let encoding = self
                .tokenizer
                .encode((query, passage.as_str()), true)
                .map_err(|e| RagError::Model(e.to_string()))?;
            for (col, &id) in encoding.get_ids().iter().take(seq).enumerate() {
                ids[row * seq + col] = id as i64;
                mask[row * seq + col] = 1;
            }
        }

        let input_ids =
            Array2::from_shape_vec((rows, seq), ids).map_err(|e| RagError::Model(e.to_string()))?;
        let attention_mask =
            Array2::from_shape_vec((rows, seq), mask).map_err(|e| RagError::Model(e.to_string()))?;

        let input_ids = Tensor::from_array(input_ids).map_err(|e| RagError::Model(e.to_string()))?;
        let attention_mask =
            Tensor::from_array(attention_mask).map_err(|e| RagError::Model(e.to_string()))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
            ])
            .map_err(|e| RagError::Model(e.to_string()))?;

        let (shape, logits) = outputs
            .get("logits")
            .ok_or_else(|| RagError::Model("Missing logits output".to_string()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| RagError::Model(e.to_string()))?;

        let width = shape.last().map(|&d| d.max(1) as usize).unwrap_or(1);
        if logits.len() != rows * width {
            return Err(RagError::Model(format!(
                "Unexpected logits length {} for {} rows",
                logits.len(),
                rows
            )));
        }

        Ok(logits.chunks(width).map(relevance_from_logits).collect())
    }
}

/// P(relevant) from one row of logits
fn relevance_from_logits(row: &[f32]) -> f32 {
    match row {
        [] => 0.0,
        [logit] => 1.0 / (1.0 + (-logit).exp()),
        _ => {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let exp_sum: f32 = row.iter().map(|&x| (x - max).exp()).sum();
            (row[1] - max).exp() / exp_sum
        },
    }
}

#[async_trait]
impl RelevanceModel for CrossEncoderModel {
    async fn score_batch(
        &self,
        query: &str,
        passages: &[String],
    ) -> grounding_core::Result<Vec<f32>> {
        let inner = Arc::clone(&self.inner);
        let query = query.to_string();
        let passages = passages.to_vec();

        let scores = tokio::task::spawn_blocking(move || inner.score_pairs(&query, &passages))
            .await
            .map_err(RagError::from)??;
        Ok(scores)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relevance_from_logits() {
        assert_eq!(relevance_from_logits(&[]), 0.0);
        assert!((relevance_from_logits(&[0.0]) - 0.5).abs() < 1e-6);
        assert!(relevance_from_logits(&[-2.0, 2.0]) > 0.9);
        assert!(relevance_from_logits(&[2.0, -2.0]) < 0.1);
    }

    #[test]
    fn test_missing_paths_yield_none() {
        let settings = RerankerSettings {
            model_path: None,
            ..Default::default()
        };
        assert!(CrossEncoderModel::from_settings(&settings).is_none());
    }

    #[test]
    fn test_bad_model_path_degrades() {
        let settings = RerankerSettings {
            model_path: Some("/nonexistent/model.onnx".into()),
            tokenizer_path: Some("/nonexistent/tokenizer.json".into()),
            ..Default::default()
        };
        assert!(CrossEncoderModel::from_settings(&settings).is_none());
    }
}

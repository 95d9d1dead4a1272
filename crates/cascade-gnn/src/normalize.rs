//! Persisted z-score normalization of operational attributes.
//!
//! Statistics are fitted once on the pretraining set and travel with the
//! model parameters, so inference sees exactly the scaling used in training.
//! The category one-hot is passed through untouched.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{CascadeError, Result};
use crate::graph::{InfraGraph, FEATURE_DIM, NUM_ATTRIBUTES, NUM_NODE_TYPES};

/// Normalized values are clipped to this many standard deviations.
pub const CLIP_STD: f32 = 3.0;

const MIN_STD: f32 = 1e-6;

/// Per-attribute mean and standard deviation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureNormalizer {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl Default for FeatureNormalizer {
    fn default() -> Self {
        Self::identity()
    }
}

impl FeatureNormalizer {
    /// Zero mean, unit deviation.
    pub fn identity() -> Self {
        Self {
            mean: vec![0.0; NUM_ATTRIBUTES],
            std: vec![1.0; NUM_ATTRIBUTES],
        }
    }

    /// Build from explicit statistics.
    pub fn from_stats(mean: Vec<f32>, std: Vec<f32>) -> Result<Self> {
        if mean.len() != NUM_ATTRIBUTES || std.len() != NUM_ATTRIBUTES {
            return Err(CascadeError::dimension_mismatch(
                NUM_ATTRIBUTES.to_string(),
                format!("mean {} / std {}", mean.len(), std.len()),
            ));
        }
        if mean.iter().chain(std.iter()).any(|v| !v.is_finite()) {
            return Err(CascadeError::input("normalizer statistics must be finite"));
        }
        let std = std.into_iter().map(|s| s.abs().max(MIN_STD)).collect();
        Ok(Self { mean, std })
    }

    /// Fit statistics over every node of every graph.
    pub fn fit<'a, I>(graphs: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a InfraGraph>,
    {
        let mut count = 0usize;
        let mut sum = [0.0f64; NUM_ATTRIBUTES];
        let mut sum_sq = [0.0f64; NUM_ATTRIBUTES];
        for graph in graphs {
            for node in graph.nodes() {
                for (a, &v) in node.features()[NUM_NODE_TYPES..].iter().enumerate() {
                    let v = v as f64;
                    sum[a] += v;
                    sum_sq[a] += v * v;
                }
                count += 1;
            }
        }
        if count == 0 {
            return Err(CascadeError::input("cannot fit normalizer on an empty dataset"));
        }

        let n = count as f64;
        let mut mean = Vec::with_capacity(NUM_ATTRIBUTES);
        let mut std = Vec::with_capacity(NUM_ATTRIBUTES);
        for a in 0..NUM_ATTRIBUTES {
            let m = sum[a] / n;
            let var = (sum_sq[a] / n - m * m).max(0.0);
            mean.push(m as f32);
            std.push((var.sqrt() as f32).max(MIN_STD));
        }
        Ok(Self { mean, std })
    }

    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    pub fn std(&self) -> &[f32] {
        &self.std
    }

    /// Normalize a raw `N x 24` feature matrix.
    pub fn transform(&self, raw: &Array2<f32>) -> Result<Array2<f32>> {
        if raw.ncols() != FEATURE_DIM {
            return Err(CascadeError::dimension_mismatch(
                FEATURE_DIM.to_string(),
                raw.ncols().to_string(),
            ));
        }
        let mut out = raw.clone();
        for mut row in out.rows_mut() {
            for a in 0..NUM_ATTRIBUTES {
                let v = &mut row[NUM_NODE_TYPES + a];
                *v = ((*v - self.mean[a]) / self.std[a]).clamp(-CLIP_STD, CLIP_STD);
            }
        }
        Ok(out)
    }
}

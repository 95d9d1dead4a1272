//! Shared training machinery: Adam, masked parameter updates, gradient
//! clipping and the per-batch step used by all three training stages.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::encoder::{EncoderWeights, PreparedGraph};
use crate::error::{CascadeError, Result};
use crate::graph::{InfraGraph, OUTPUT_DIM};
use crate::loss::{Loss, LossSpec};
use crate::normalize::FeatureNormalizer;
use crate::params::ParameterMask;

/// Adam hyper-parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub learning_rate: f32,
    /// Exponential decay rate for the first moment.
    pub beta1: f32,
    /// Exponential decay rate for the second moment.
    pub beta2: f32,
    pub epsilon: f32,
}

impl AdamConfig {
    pub fn with_learning_rate(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Adam state for a single tensor.
#[derive(Debug, Clone)]
pub struct Optimizer {
    m: Option<Array2<f32>>,
    v: Option<Array2<f32>>,
    t: usize,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Optimizer {
    pub fn new() -> Self {
        Self {
            m: None,
            v: None,
            t: 0,
        }
    }

    /// Steps taken so far.
    pub fn timestep(&self) -> usize {
        self.t
    }

    /// Adam update of `params` in place.
    ///
    /// 1. m_t = beta1 * m_{t-1} + (1 - beta1) * g_t
    /// 2. v_t = beta2 * v_{t-1} + (1 - beta2) * g_t^2
    /// 3. params -= lr * m_hat / (sqrt(v_hat) + epsilon), with bias-corrected moments
    pub fn step(
        &mut self,
        config: &AdamConfig,
        params: &mut Array2<f32>,
        grads: &Array2<f32>,
    ) -> Result<()> {
        if params.shape() != grads.shape() {
            return Err(CascadeError::dimension_mismatch(
                format!("{:?}", params.shape()),
                format!("{:?}", grads.shape()),
            ));
        }

        let m = self.m.get_or_insert_with(|| Array2::zeros(params.dim()));
        let v = self.v.get_or_insert_with(|| Array2::zeros(params.dim()));
        self.t += 1;

        let (b1, b2) = (config.beta1, config.beta2);
        m.zip_mut_with(grads, |m, &g| *m = b1 * *m + (1.0 - b1) * g);
        v.zip_mut_with(grads, |v, &g| *v = b2 * *v + (1.0 - b2) * g * g);

        let bias_correction1 = 1.0 - b1.powi(self.t as i32);
        let bias_correction2 = 1.0 - b2.powi(self.t as i32);

        for ((p, &m_val), &v_val) in params.iter_mut().zip(m.iter()).zip(v.iter()) {
            let m_hat = m_val / bias_correction1;
            let v_hat = v_val / bias_correction2;
            *p -= config.learning_rate * m_hat / (v_hat.sqrt() + config.epsilon);
        }
        Ok(())
    }
}

/// One Adam state per encoder tensor; frozen groups are never touched.
#[derive(Debug, Clone)]
pub struct ParamOptimizer {
    config: AdamConfig,
    slots: Vec<Optimizer>,
}

impl ParamOptimizer {
    pub fn new(config: AdamConfig) -> Self {
        Self {
            config,
            slots: Vec::new(),
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f32) {
        self.config.learning_rate = learning_rate;
    }

    pub fn step(
        &mut self,
        weights: &mut EncoderWeights,
        grads: &EncoderWeights,
        mask: &ParameterMask,
    ) -> Result<()> {
        let grad_tensors = grads.tensors();
        if self.slots.len() != grad_tensors.len() {
            self.slots = vec![Optimizer::new(); grad_tensors.len()];
        }
        for (((group, param), (_, grad)), slot) in weights
            .tensors_mut()
            .into_iter()
            .zip(grad_tensors)
            .zip(self.slots.iter_mut())
        {
            if mask.is_trainable(group) {
                slot.step(&self.config, param, grad)?;
            }
        }
        Ok(())
    }
}

/// Global L2 norm of the trainable gradients.
pub fn grad_norm(grads: &EncoderWeights, mask: &ParameterMask) -> f32 {
    grads
        .tensors()
        .into_iter()
        .filter(|(g, _)| mask.is_trainable(*g))
        .map(|(_, t)| t.iter().map(|v| v * v).sum::<f32>())
        .sum::<f32>()
        .sqrt()
}

/// Rescale trainable gradients so their global norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut EncoderWeights, mask: &ParameterMask, max_norm: f32) -> f32 {
    let norm = grad_norm(grads, mask);
    if norm.is_finite() && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for (group, t) in grads.tensors_mut() {
            if mask.is_trainable(group) {
                t.mapv_inplace(|v| v * scale);
            }
        }
    }
    norm
}

/// A prepared graph with its `N x 12` target matrix.
#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub prepared: PreparedGraph,
    pub targets: Array2<f32>,
}

impl TrainingSample {
    /// Prepare a labeled graph under a fixed normalizer.
    pub fn from_graph(graph: &InfraGraph, normalizer: &FeatureNormalizer) -> Result<Self> {
        let targets = graph
            .labels()
            .ok_or_else(|| CascadeError::input("training graph has no labels"))?
            .to_owned();
        if targets.ncols() != OUTPUT_DIM {
            return Err(CascadeError::dimension_mismatch(
                OUTPUT_DIM.to_string(),
                targets.ncols().to_string(),
            ));
        }
        Ok(Self {
            prepared: PreparedGraph::new(graph, normalizer)?,
            targets,
        })
    }
}

/// Outcome of one optimizer step.
#[derive(Debug, Clone, Copy)]
pub struct StepStats {
    /// Mean loss over the samples that contributed.
    pub loss: f32,
    /// Gradient norm before clipping.
    pub grad_norm: f32,
    /// Samples that contributed at least one labeled position.
    pub samples: usize,
}

/// Masked mini-batch gradient descent over encoder weights.
pub struct Trainer {
    optimizer: ParamOptimizer,
    mask: ParameterMask,
    loss: LossSpec,
    grad_clip_norm: f32,
    weight_decay: f32,
    rng: StdRng,
}

impl Trainer {
    pub fn new(adam: AdamConfig, mask: ParameterMask, loss: LossSpec, seed: u64) -> Self {
        Self {
            optimizer: ParamOptimizer::new(adam),
            mask,
            loss,
            grad_clip_norm: 1.0,
            weight_decay: 0.0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn with_grad_clip(mut self, max_norm: f32) -> Self {
        self.grad_clip_norm = max_norm;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn mask(&self) -> &ParameterMask {
        &self.mask
    }

    pub fn learning_rate(&self) -> f32 {
        self.optimizer.learning_rate()
    }

    pub fn set_learning_rate(&mut self, learning_rate: f32) {
        self.optimizer.set_learning_rate(learning_rate);
    }

    /// Accumulate gradients over `batch`, clip, and apply one update.
    ///
    /// Samples without any known target are skipped. Returns `None` when the
    /// whole batch was skipped.
    ///
    /// # Errors
    /// `TrainingDivergence` if the loss or gradient norm is not finite.
    pub fn step(
        &mut self,
        weights: &mut EncoderWeights,
        batch: &[&TrainingSample],
        epoch: usize,
    ) -> Result<Option<StepStats>> {
        let mut total = weights.zeros_like();
        let mut loss_sum = 0.0;
        let mut used = 0usize;

        for sample in batch {
            let cache = weights.forward(&sample.prepared, Some(&mut self.rng))?;
            let out = match Loss::compute(&self.loss, &cache.scores, &sample.targets) {
                Ok(out) => out,
                Err(CascadeError::InputError(_)) => continue,
                Err(e) => return Err(e),
            };
            if !out.value.is_finite() {
                return Err(CascadeError::divergence(epoch, "loss is not finite"));
            }
            let grads = weights.backward(&sample.prepared, &cache, &out.grad, &self.mask)?;
            for ((_, acc), (_, g)) in total.tensors_mut().into_iter().zip(grads.tensors()) {
                *acc += g;
            }
            loss_sum += out.value;
            used += 1;
        }

        if used == 0 {
            return Ok(None);
        }

        let scale = 1.0 / used as f32;
        for ((group, acc), (_, param)) in total.tensors_mut().into_iter().zip(weights.tensors()) {
            if self.mask.is_trainable(group) {
                acc.mapv_inplace(|v| v * scale);
                if self.weight_decay > 0.0 {
                    acc.scaled_add(self.weight_decay, param);
                }
            }
        }

        let norm = clip_grad_norm(&mut total, &self.mask, self.grad_clip_norm);
        if !norm.is_finite() {
            return Err(CascadeError::divergence(epoch, "gradient norm is not finite"));
        }
        self.optimizer.step(weights, &total, &self.mask)?;

        let stats = StepStats {
            loss: loss_sum / used as f32,
            grad_norm: norm,
            samples: used,
        };
        trace!(epoch, loss = stats.loss, grad_norm = norm, "optimizer step");
        Ok(Some(stats))
    }

    /// Mean loss without dropout or updates.
    pub fn evaluate(&self, weights: &EncoderWeights, samples: &[TrainingSample]) -> Result<f32> {
        evaluate_loss(&self.loss, weights, samples)
    }
}

/// Mean loss of `weights` over `samples` in inference mode.
pub fn evaluate_loss(
    spec: &LossSpec,
    weights: &EncoderWeights,
    samples: &[TrainingSample],
) -> Result<f32> {
    let mut sum = 0.0;
    let mut used = 0usize;
    for sample in samples {
        let cache = weights.forward(&sample.prepared, None)?;
        match Loss::compute(spec, &cache.scores, &sample.targets) {
            Ok(out) => {
                sum += out.value;
                used += 1;
            }
            Err(CascadeError::InputError(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    if used == 0 {
        return Err(CascadeError::input("no sample carries a known label"));
    }
    Ok(sum / used as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderConfig;
    use crate::graph::{Edge, Node, NodeType, OperationalAttributes};
    use crate::params::ParamGroup;

    fn adam(lr: f32) -> AdamConfig {
        AdamConfig::with_learning_rate(lr)
    }

    #[test]
    fn test_adam_optimizer_basic() {
        let mut optimizer = Optimizer::new();
        let mut params = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let grads = Array2::from_shape_vec((2, 2), vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        let original = params.clone();
        optimizer.step(&adam(0.001), &mut params, &grads).unwrap();
        for (p, o) in params.iter().zip(original.iter()) {
            assert!(p < o);
            // first Adam step moves each weight by ~lr
            assert!((o - p - 0.001).abs() < 1e-5);
        }
        assert_eq!(optimizer.timestep(), 1);
    }

    #[test]
    fn test_adam_convergence() {
        let mut optimizer = Optimizer::new();
        let mut params = Array2::from_shape_vec((1, 2), vec![5.0, 5.0]).unwrap();
        for _ in 0..200 {
            let grads = params.mapv(|x| 2.0 * x);
            optimizer.step(&adam(0.5), &mut params, &grads).unwrap();
        }
        assert!(params[[0, 0]].abs() < 0.5);
        assert!(params[[0, 1]].abs() < 0.5);
    }

    #[test]
    fn test_optimizer_shape_mismatch() {
        let mut optimizer = Optimizer::new();
        let mut params = Array2::zeros((2, 2));
        let grads = Array2::zeros((3, 2));
        let err = optimizer.step(&adam(0.1), &mut params, &grads).unwrap_err();
        assert!(matches!(err, CascadeError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_clip_grad_norm() {
        let config = EncoderConfig {
            hidden_dim: 4,
            heads: 1,
            gate_hidden_dim: 2,
            ..Default::default()
        };
        let mut grads = EncoderWeights::init(&config).zeros_like();
        grads.gate_output.bias.fill(3.0);
        grads.refinement.bias.fill(100.0);
        let mask = ParameterMask::only(&[ParamGroup::Gate]);
        let before = clip_grad_norm(&mut grads, &mask, 1.0);
        assert!((before - 6.0).abs() < 1e-4);
        assert!((grad_norm(&grads, &mask) - 1.0).abs() < 1e-3);
        // frozen groups untouched
        assert!(grads.refinement.bias.iter().all(|&v| v == 100.0));
    }

    fn labeled_sample(normalizer: &FeatureNormalizer) -> TrainingSample {
        let nodes = (0..4)
            .map(|i| {
                let mut attrs = OperationalAttributes::default();
                if i == 0 {
                    attrs.status = 0.0;
                }
                Node::new(i, NodeType::Pump, attrs)
            })
            .collect();
        let edges = vec![Edge::new(0, 1), Edge::new(1, 2), Edge::new(2, 3)];
        let mut labels = Array2::zeros((4, OUTPUT_DIM));
        labels.row_mut(0).fill(1.0);
        labels.row_mut(1).fill(0.5);
        let graph = InfraGraph::new(nodes, edges)
            .unwrap()
            .with_labels(labels)
            .unwrap();
        TrainingSample::from_graph(&graph, normalizer).unwrap()
    }

    #[test]
    fn test_trainer_respects_mask_and_reduces_loss() {
        let config = EncoderConfig {
            hidden_dim: 8,
            heads: 2,
            gate_hidden_dim: 4,
            dropout: 0.0,
            ..Default::default()
        };
        let mut weights = EncoderWeights::init(&config);
        let original = weights.clone();
        let normalizer = FeatureNormalizer::identity();
        let sample = labeled_sample(&normalizer);
        let mask = ParameterMask::all_trainable().freeze(ParamGroup::FeatureExpansion);
        let mut trainer = Trainer::new(adam(0.01), mask, LossSpec::masked(1.0), 1);

        let before = trainer.evaluate(&weights, std::slice::from_ref(&sample)).unwrap();
        for epoch in 1..=30 {
            trainer.step(&mut weights, &[&sample], epoch).unwrap();
        }
        let after = trainer.evaluate(&weights, std::slice::from_ref(&sample)).unwrap();

        assert!(after < before, "loss {before} -> {after}");
        assert!(weights.group_identical(&original, ParamGroup::FeatureExpansion));
        assert!(!weights.group_identical(&original, ParamGroup::OutputProjection));
    }

    #[test]
    fn test_unlabeled_batch_is_skipped() {
        let config = EncoderConfig {
            hidden_dim: 4,
            heads: 1,
            gate_hidden_dim: 2,
            ..Default::default()
        };
        let mut weights = EncoderWeights::init(&config);
        let normalizer = FeatureNormalizer::identity();
        let mut sample = labeled_sample(&normalizer);
        sample.targets.fill(-1.0);
        let mut trainer = Trainer::new(
            adam(0.01),
            ParameterMask::all_trainable(),
            LossSpec::masked(1.0),
            1,
        );
        let original = weights.clone();
        assert!(trainer.step(&mut weights, &[&sample], 1).unwrap().is_none());
        assert_eq!(weights, original);
    }

    #[test]
    fn test_divergence_detected() {
        let config = EncoderConfig {
            hidden_dim: 4,
            heads: 1,
            gate_hidden_dim: 2,
            ..Default::default()
        };
        let mut weights = EncoderWeights::init(&config);
        weights.output_projection.bias.fill(f32::NAN);
        let sample = labeled_sample(&FeatureNormalizer::identity());
        let mut trainer = Trainer::new(
            adam(0.01),
            ParameterMask::all_trainable(),
            LossSpec::masked(1.0),
            1,
        );
        let err = trainer.step(&mut weights, &[&sample], 3).unwrap_err();
        assert!(matches!(err, CascadeError::TrainingDivergence { epoch: 3, .. }));
    }
}

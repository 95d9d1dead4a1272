//! Configuration for the encoder, the three training stages and the
//! inference-side components.
//!
//! Every struct has a `Default` carrying the production values and a
//! `validate()` that rejects out-of-range settings before any work starts.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CascadeError, Result};
use crate::params::ParamGroup;

/// Top-level configuration, loadable from a JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub encoder: EncoderConfig,
    pub pretrain: PretrainConfig,
    pub transfer: TransferConfig,
    pub gate: GateRetrainConfig,
    pub simulation: SimulationConfig,
    pub decision: DecisionConfig,
    pub backtest: BacktestConfig,
}

impl CascadeConfig {
    /// Load from a JSON file; missing sections take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.encoder.validate()?;
        self.pretrain.validate()?;
        self.transfer.validate()?;
        self.gate.validate()?;
        self.simulation.validate()?;
        self.decision.validate()?;
        self.backtest.validate()
    }
}

/// Encoder architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Width of every hidden layer.
    pub hidden_dim: usize,
    /// Attention heads; `hidden_dim` must divide evenly.
    pub heads: usize,
    /// Hidden width of the gating perceptron.
    pub gate_hidden_dim: usize,
    /// Dropout rate applied after each rectified graph layer while training.
    pub dropout: f32,
    /// Leaky-rectifier slope of the attention scores.
    pub negative_slope: f32,
    /// Seed for weight initialization.
    pub seed: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 128,
            heads: 4,
            gate_hidden_dim: 64,
            dropout: 0.2,
            negative_slope: 0.2,
            seed: 42,
        }
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.hidden_dim == 0 || self.heads == 0 || self.gate_hidden_dim == 0 {
            return Err(CascadeError::config("encoder dimensions must be positive"));
        }
        if self.hidden_dim % self.heads != 0 {
            return Err(CascadeError::config(format!(
                "hidden_dim {} is not divisible by {} heads",
                self.hidden_dim, self.heads
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(CascadeError::config(format!(
                "dropout {} outside [0, 1)",
                self.dropout
            )));
        }
        if !(0.0..1.0).contains(&self.negative_slope) {
            return Err(CascadeError::config("negative_slope must be in [0, 1)"));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_dim / self.heads
    }
}

/// Full pretraining on synthetic graphs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PretrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// L2 penalty added to gradients.
    pub weight_decay: f32,
    /// Share of samples held out for validation.
    pub validation_split: f32,
    pub min_samples: usize,
    /// Loss multiplier for nodes whose mean target exceeds `critical_threshold`.
    pub critical_weight: f32,
    pub critical_threshold: f32,
    pub grad_clip_norm: f32,
    pub plateau_factor: f32,
    pub plateau_patience: usize,
    pub min_learning_rate: f32,
    /// Seed for dropout and shuffling.
    pub seed: u64,
}

impl Default for PretrainConfig {
    fn default() -> Self {
        Self {
            epochs: 50,
            batch_size: 32,
            learning_rate: 1e-3,
            weight_decay: 5e-4,
            validation_split: 0.2,
            min_samples: 100,
            critical_weight: 3.0,
            critical_threshold: 0.5,
            grad_clip_norm: 1.0,
            plateau_factor: 0.5,
            plateau_patience: 5,
            min_learning_rate: 1e-6,
            seed: 42,
        }
    }
}

impl PretrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(CascadeError::config("epochs and batch_size must be positive"));
        }
        if !(self.learning_rate > 0.0) || !(self.min_learning_rate > 0.0) {
            return Err(CascadeError::config("learning rates must be positive"));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(CascadeError::config("validation_split must be in [0, 1)"));
        }
        if !(self.plateau_factor > 0.0 && self.plateau_factor < 1.0) {
            return Err(CascadeError::config("plateau_factor must be in (0, 1)"));
        }
        if !(self.grad_clip_norm > 0.0) || self.critical_weight < 1.0 || self.weight_decay < 0.0 {
            return Err(CascadeError::config(
                "grad_clip_norm must be positive, critical_weight >= 1, weight_decay >= 0",
            ));
        }
        Ok(())
    }
}

/// Fine-tuning on real incidents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub epochs: usize,
    pub learning_rate: f32,
    /// Weight of the positive class in the masked loss.
    pub pos_weight: f32,
    pub grad_clip_norm: f32,
    pub seed: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            learning_rate: 1e-4,
            pos_weight: 5.0,
            grad_clip_norm: 1.0,
            seed: 7,
        }
    }
}

impl TransferConfig {
    pub const MIN_EPOCHS: usize = 10;
    pub const MAX_EPOCHS: usize = 50;

    pub fn validate(&self) -> Result<()> {
        if !(Self::MIN_EPOCHS..=Self::MAX_EPOCHS).contains(&self.epochs) {
            return Err(CascadeError::config(format!(
                "transfer epochs {} outside [{}, {}]",
                self.epochs,
                Self::MIN_EPOCHS,
                Self::MAX_EPOCHS
            )));
        }
        if !(self.learning_rate > 0.0) || !(self.pos_weight > 0.0) || !(self.grad_clip_norm > 0.0)
        {
            return Err(CascadeError::config(
                "learning_rate, pos_weight and grad_clip_norm must be positive",
            ));
        }
        Ok(())
    }
}

/// Targeted retraining of the gating subnetwork.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateRetrainConfig {
    /// Must be one of [`Self::ALLOWED_LEARNING_RATES`].
    pub learning_rate: f32,
    pub epochs: usize,
    /// Use focal loss instead of weighted cross-entropy.
    pub focal: bool,
    pub focal_gamma: f32,
    pub focal_alpha: f32,
    pub pos_weight: f32,
    /// Also train the output projection.
    pub train_output_layer: bool,
    /// Extra groups requested trainable. Any topology group listed here is a
    /// freeze violation.
    pub additional_trainable: Vec<ParamGroup>,
    pub min_incidents: usize,
    pub min_labeled_nodes: usize,
    pub min_failed_nodes: usize,
    pub grad_clip_norm: f32,
    pub seed: u64,
}

impl Default for GateRetrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            epochs: 10,
            focal: false,
            focal_gamma: 2.0,
            focal_alpha: 0.25,
            pos_weight: 5.0,
            train_output_layer: false,
            additional_trainable: Vec::new(),
            min_incidents: 5,
            min_labeled_nodes: 10,
            min_failed_nodes: 1,
            grad_clip_norm: 1.0,
            seed: 13,
        }
    }
}

impl GateRetrainConfig {
    pub const ALLOWED_LEARNING_RATES: [f32; 2] = [1e-4, 5e-5];
    pub const MIN_EPOCHS: usize = 5;
    pub const MAX_EPOCHS: usize = 15;
    pub const MAX_FOCAL_GAMMA: f32 = 2.0;
    pub const MAX_FOCAL_ALPHA: f32 = 0.75;

    pub fn validate(&self) -> Result<()> {
        let lr_ok = Self::ALLOWED_LEARNING_RATES
            .iter()
            .any(|&lr| (self.learning_rate - lr).abs() <= lr * 1e-3);
        if !lr_ok {
            return Err(CascadeError::config(format!(
                "gate learning rate {} must be one of {:?}",
                self.learning_rate,
                Self::ALLOWED_LEARNING_RATES
            )));
        }
        if !(Self::MIN_EPOCHS..=Self::MAX_EPOCHS).contains(&self.epochs) {
            return Err(CascadeError::config(format!(
                "gate epochs {} outside [{}, {}]",
                self.epochs,
                Self::MIN_EPOCHS,
                Self::MAX_EPOCHS
            )));
        }
        if self.focal && (!(self.focal_gamma >= 0.0) || !(self.focal_alpha > 0.0)) {
            return Err(CascadeError::config(
                "focal_gamma must be >= 0 and focal_alpha > 0",
            ));
        }
        if !(self.pos_weight > 0.0) || !(self.grad_clip_norm > 0.0) {
            return Err(CascadeError::config(
                "pos_weight and grad_clip_norm must be positive",
            ));
        }
        Ok(())
    }
}

/// Counterfactual simulator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// A node is affected when `|amplified delta|` exceeds this.
    pub sensitivity: f32,
    /// Display amplification applied to raw deltas.
    pub amplification: f32,
    /// Report the forced node as probability 1.0 and delta 1.0.
    pub pin_forced_node: bool,
    /// Output dimension read for deltas.
    pub impact_dimension: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sensitivity: 0.1,
            amplification: 10.0,
            pin_forced_node: false,
            impact_dimension: 0,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.sensitivity >= 0.0) || !(self.amplification > 0.0) {
            return Err(CascadeError::config(
                "sensitivity must be >= 0 and amplification > 0",
            ));
        }
        if self.impact_dimension >= crate::graph::OUTPUT_DIM {
            return Err(CascadeError::config(format!(
                "impact_dimension {} out of range",
                self.impact_dimension
            )));
        }
        Ok(())
    }
}

/// Default alert threshold for callers that do not supply one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub threshold: f32,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            threshold: crate::decision::DEFAULT_THRESHOLD,
        }
    }
}

impl DecisionConfig {
    pub fn validate(&self) -> Result<()> {
        crate::decision::check_threshold(self.threshold)
    }
}

/// Backtest ranking depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Length of the inspection list scored by precision@k and recall@k.
    pub top_k: usize,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self { top_k: 5 }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(CascadeError::config("backtest top_k must be at least 1"));
        }
        Ok(())
    }
}

//! Full pretraining on labeled synthetic graphs.
//!
//! Every parameter group is trained from a seeded initialization with
//! mini-batch Adam. The step size is reduced when validation loss stalls and
//! the weights with the lowest validation loss are the ones returned.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{EncoderConfig, PretrainConfig};
use crate::encoder::EncoderWeights;
use crate::error::{CascadeError, Result};
use crate::graph::InfraGraph;
use crate::loss::LossSpec;
use crate::normalize::FeatureNormalizer;
use crate::params::{ModelParameters, ParameterMask, Stage};
use crate::scheduler::PlateauScheduler;
use crate::synthetic::LabeledGraphSource;
use crate::training::{evaluate_loss, AdamConfig, Trainer, TrainingSample};

/// Per-epoch pretraining statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_loss: f32,
    /// Absent when no validation split was held out.
    pub val_loss: Option<f32>,
    pub learning_rate: f32,
}

/// Outcome of a pretraining run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PretrainReport {
    pub train_samples: usize,
    pub val_samples: usize,
    pub epochs: Vec<EpochStats>,
    /// Epoch whose weights were kept.
    pub best_epoch: usize,
    pub best_loss: f32,
    pub lr_reductions: usize,
}

/// Drives pretraining from a labeled graph set.
#[derive(Debug, Clone)]
pub struct TrainingOrchestrator {
    encoder: EncoderConfig,
    config: PretrainConfig,
}

impl TrainingOrchestrator {
    pub fn new(encoder: EncoderConfig, config: PretrainConfig) -> Result<Self> {
        encoder.validate()?;
        config.validate()?;
        Ok(Self { encoder, config })
    }

    pub fn config(&self) -> &PretrainConfig {
        &self.config
    }

    /// Draw `count` graphs from `source` and pretrain on them.
    pub fn pretrain_from_source(
        &self,
        source: &mut dyn LabeledGraphSource,
        count: usize,
    ) -> Result<(ModelParameters, PretrainReport)> {
        let graphs = source.take_graphs(count)?;
        self.pretrain(&graphs)
    }

    /// Train a fresh parameter set on `graphs`.
    ///
    /// # Errors
    /// `InputError` with fewer than `min_samples` graphs or unlabeled graphs,
    /// `TrainingDivergence` if the loss goes non-finite.
    pub fn pretrain(&self, graphs: &[InfraGraph]) -> Result<(ModelParameters, PretrainReport)> {
        let cfg = &self.config;
        if graphs.len() < cfg.min_samples {
            return Err(CascadeError::input(format!(
                "pretraining needs at least {} samples, got {}",
                cfg.min_samples,
                graphs.len()
            )));
        }
        if let Some(i) = graphs.iter().position(|g| g.labels().is_none()) {
            return Err(CascadeError::input(format!("sample {i} has no labels")));
        }

        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut order: Vec<usize> = (0..graphs.len()).collect();
        order.shuffle(&mut rng);
        let mut val_count = (graphs.len() as f32 * cfg.validation_split).floor() as usize;
        if cfg.validation_split > 0.0 && val_count == 0 && graphs.len() > 1 {
            val_count = 1;
        }
        let (val_idx, train_idx) = order.split_at(val_count);

        let normalizer = FeatureNormalizer::fit(train_idx.iter().map(|&i| &graphs[i]))?;
        let prepare = |idx: &[usize]| -> Result<Vec<TrainingSample>> {
            idx.iter()
                .map(|&i| TrainingSample::from_graph(&graphs[i], &normalizer))
                .collect()
        };
        let train = prepare(train_idx)?;
        let val = prepare(val_idx)?;
        info!(
            train = train.len(),
            val = val.len(),
            epochs = cfg.epochs,
            batch_size = cfg.batch_size,
            "starting pretraining"
        );

        let loss = LossSpec::pretraining(cfg.critical_threshold, cfg.critical_weight);
        let mut weights = EncoderWeights::init(&self.encoder);
        let mut trainer = Trainer::new(
            AdamConfig::with_learning_rate(cfg.learning_rate),
            ParameterMask::all_trainable(),
            loss,
            cfg.seed,
        )
        .with_grad_clip(cfg.grad_clip_norm)
        .with_weight_decay(cfg.weight_decay);
        let mut scheduler = PlateauScheduler::new(
            cfg.learning_rate,
            cfg.plateau_factor,
            cfg.plateau_patience,
            cfg.min_learning_rate,
        );

        let mut best = (weights.clone(), 0usize, f32::INFINITY);
        let mut epochs = Vec::with_capacity(cfg.epochs);
        let mut batch_order: Vec<usize> = (0..train.len()).collect();

        for epoch in 1..=cfg.epochs {
            batch_order.shuffle(&mut rng);
            let mut loss_sum = 0.0;
            let mut steps = 0usize;
            for chunk in batch_order.chunks(cfg.batch_size) {
                let batch: Vec<&TrainingSample> = chunk.iter().map(|&i| &train[i]).collect();
                if let Some(stats) = trainer.step(&mut weights, &batch, epoch)? {
                    loss_sum += stats.loss;
                    steps += 1;
                }
            }
            let train_loss = loss_sum / steps.max(1) as f32;

            let val_loss = if val.is_empty() {
                None
            } else {
                Some(evaluate_loss(&loss, &weights, &val)?)
            };
            let monitored = val_loss.unwrap_or(train_loss);
            if !monitored.is_finite() {
                return Err(CascadeError::divergence(epoch, "validation loss is not finite"));
            }
            if monitored < best.2 {
                best = (weights.clone(), epoch, monitored);
                debug!(epoch, loss = monitored, "new best checkpoint");
            }

            let learning_rate = trainer.learning_rate();
            epochs.push(EpochStats {
                epoch,
                train_loss,
                val_loss,
                learning_rate,
            });
            info!(epoch, train_loss, val_loss = ?val_loss, lr = learning_rate, "pretrain epoch");

            let next_lr = scheduler.observe(monitored);
            trainer.set_learning_rate(next_lr);
        }

        let (best_weights, best_epoch, best_loss) = best;
        let report = PretrainReport {
            train_samples: train.len(),
            val_samples: val.len(),
            epochs,
            best_epoch,
            best_loss,
            lr_reductions: scheduler.reductions(),
        };
        info!(best_epoch, best_loss, "pretraining finished");
        Ok((
            ModelParameters::new(best_weights, normalizer, Stage::Pretrain),
            report,
        ))
    }
}

//! Fine-tuning pretrained parameters on real, partially labeled incidents.
//!
//! Only the feature-expansion layer stays frozen. The candidate is returned
//! to the caller unpublished; [`evaluate`] compares it with its base so the
//! caller can decide whether to promote it.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::TransferConfig;
use crate::encoder::GraphEncoder;
use crate::error::{CascadeError, Result};
use crate::incident::{summarize, Incident};
use crate::loss::LossSpec;
use crate::params::{ModelParameters, ParamGroup, ParameterMask, Stage};
use crate::training::{AdamConfig, Trainer, TrainingSample};

/// Per-epoch fine-tuning statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransferEpoch {
    pub epoch: usize,
    pub loss: f32,
    /// Largest pre-clip gradient norm seen this epoch.
    pub max_grad_norm: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReport {
    pub base_version: u64,
    pub incidents: usize,
    pub labeled_nodes: usize,
    pub frozen_groups: Vec<ParamGroup>,
    pub epochs: Vec<TransferEpoch>,
}

/// Error comparison of two parameter sets on the same incidents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransferEvaluation {
    pub base_mae: f32,
    pub candidate_mae: f32,
    /// Relative reduction of the error, in percent.
    pub improvement_pct: f32,
    pub positions: usize,
}

impl TransferEvaluation {
    pub fn improved(&self) -> bool {
        self.candidate_mae < self.base_mae
    }
}

pub struct TransferAdapter {
    config: TransferConfig,
}

impl TransferAdapter {
    pub fn new(config: TransferConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn mask() -> ParameterMask {
        ParameterMask::all_trainable().freeze(ParamGroup::FeatureExpansion)
    }

    /// Adapt `base` to `incidents`, one optimizer step per incident.
    ///
    /// # Errors
    /// `InputError` when no incident carries a known label.
    pub fn fine_tune(
        &self,
        base: &ModelParameters,
        incidents: &[Incident],
    ) -> Result<(ModelParameters, TransferReport)> {
        let summary = summarize(incidents);
        if summary.labeled_nodes == 0 {
            return Err(CascadeError::input(
                "fine-tuning needs at least one labeled node",
            ));
        }

        let mut candidate = base.derive(Stage::Transfer);
        let samples = incidents
            .iter()
            .filter(|inc| inc.graph.labeled_count() > 0)
            .map(|inc| TrainingSample::from_graph(&inc.graph, &candidate.normalizer))
            .collect::<Result<Vec<_>>>()?;
        if samples.len() < incidents.len() {
            warn!(
                skipped = incidents.len() - samples.len(),
                "incidents without labels are ignored"
            );
        }

        let mask = Self::mask();
        let mut trainer = Trainer::new(
            AdamConfig::with_learning_rate(self.config.learning_rate),
            mask,
            LossSpec::masked(self.config.pos_weight),
            self.config.seed,
        )
        .with_grad_clip(self.config.grad_clip_norm);

        info!(
            base_version = base.version,
            incidents = samples.len(),
            labeled = summary.labeled_nodes,
            epochs = self.config.epochs,
            "starting fine-tuning"
        );

        let mut epochs = Vec::with_capacity(self.config.epochs);
        for epoch in 1..=self.config.epochs {
            let mut loss_sum = 0.0;
            let mut steps = 0usize;
            let mut max_grad_norm = 0.0f32;
            for sample in &samples {
                if let Some(stats) = trainer.step(&mut candidate.weights, &[sample], epoch)? {
                    loss_sum += stats.loss;
                    max_grad_norm = max_grad_norm.max(stats.grad_norm);
                    steps += 1;
                }
            }
            let loss = loss_sum / steps.max(1) as f32;
            info!(epoch, loss, max_grad_norm, "fine-tune epoch");
            epochs.push(TransferEpoch {
                epoch,
                loss,
                max_grad_norm,
            });
        }

        let report = TransferReport {
            base_version: base.version,
            incidents: samples.len(),
            labeled_nodes: summary.labeled_nodes,
            frozen_groups: mask.frozen_groups().into_iter().collect(),
            epochs,
        };
        Ok((candidate, report))
    }
}

/// Mean absolute error of predicted probabilities over known labels.
pub fn mean_absolute_error(params: &ModelParameters, incidents: &[Incident]) -> Result<(f32, usize)> {
    let encoder = GraphEncoder::new(params);
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for incident in incidents {
        let Some(labels) = incident.graph.labels() else {
            continue;
        };
        let probs = encoder.probabilities(&incident.graph)?;
        for (&p, &t) in probs.iter().zip(labels.iter()) {
            if t >= 0.0 {
                sum += (p - t).abs() as f64;
                count += 1;
            }
        }
    }
    if count == 0 {
        return Err(CascadeError::input("no known labels to evaluate against"));
    }
    Ok(((sum / count as f64) as f32, count))
}

/// Compare a fine-tuned candidate with its base.
pub fn evaluate(
    base: &ModelParameters,
    candidate: &ModelParameters,
    incidents: &[Incident],
) -> Result<TransferEvaluation> {
    let (base_mae, positions) = mean_absolute_error(base, incidents)?;
    let (candidate_mae, _) = mean_absolute_error(candidate, incidents)?;
    let improvement_pct = if base_mae > 0.0 {
        (base_mae - candidate_mae) / base_mae * 100.0
    } else {
        0.0
    };
    Ok(TransferEvaluation {
        base_mae,
        candidate_mae,
        improvement_pct,
        positions,
    })
}

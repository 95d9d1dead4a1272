//! Safety-gated retraining of the gating subnetwork.
//!
//! A run snapshots production, trains a derived candidate with every
//! topology group frozen, and promotes it only if all five detection
//! criteria hold. On rejection production is left untouched and the
//! failing criteria are returned inside [`CascadeError::ValidationRejection`].
//!
//! Node classes used by the criteria, on output dimension 0:
//! - failed: labeled and raw status below [`FAILED_STATUS`]
//! - healthy: labeled and raw status at or above it

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GateRetrainConfig;
use crate::encoder::GraphEncoder;
use crate::error::{CascadeError, Result};
use crate::incident::{summarize, Incident, IncidentSummary, FAILED_STATUS};
use crate::loss::{LossSpec, LossType};
use crate::params::{ModelParameters, ParamGroup, ParameterMask, Stage};
use crate::registry::{ModelRegistry, RunDecision, TrainingRunRecord};
use crate::training::{AdamConfig, Trainer, TrainingSample};

/// Probability a failed node must reach to count as detected: `exp(-2.5)`.
pub const DETECTION_THRESHOLD: f32 = 0.082_085;
/// Share of failed nodes that must cross the detection threshold.
pub const MIN_CROSSING_RATE: f32 = 0.5;
pub const MAX_HEALTHY_MEAN: f32 = 0.05;
pub const MAX_LABELED_MEAN: f32 = 0.05;
pub const MAX_PROBABILITY: f32 = 0.9;
/// Gate means outside `[SATURATION_LOW, SATURATION_HIGH]` stop training.
pub const SATURATION_LOW: f32 = 0.1;
pub const SATURATION_HIGH: f32 = 0.9;

/// Groups that must stay frozen in every gate run.
pub const FROZEN_GROUPS: [ParamGroup; 5] = [
    ParamGroup::FeatureExpansion,
    ParamGroup::Attention,
    ParamGroup::ResidualProjection,
    ParamGroup::Refinement,
    ParamGroup::StatusProjection,
];

/// Detection metrics of one parameter set over an incident set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GateMetrics {
    /// Share of failed nodes at or above [`DETECTION_THRESHOLD`].
    pub crossing_rate: f32,
    pub failed_mean: f32,
    pub healthy_mean: f32,
    pub labeled_mean: f32,
    /// Highest probability over every node, labeled or not.
    pub max_probability: f32,
    pub failed_nodes: usize,
    pub healthy_nodes: usize,
}

impl GateMetrics {
    pub fn compute(params: &ModelParameters, incidents: &[Incident]) -> Result<Self> {
        let encoder = GraphEncoder::new(params);
        let mut failed = Vec::new();
        let mut healthy = Vec::new();
        let mut max_probability = 0.0f32;
        for incident in incidents {
            let graph = &incident.graph;
            let probs = encoder.probabilities(graph)?;
            for (pos, node) in graph.nodes().iter().enumerate() {
                let p = probs[[pos, 0]];
                max_probability = max_probability.max(p);
                if !graph.is_labeled(pos) {
                    continue;
                }
                if node.status() < FAILED_STATUS {
                    failed.push(p);
                } else {
                    healthy.push(p);
                }
            }
        }

        let mean = |v: &[f32]| {
            if v.is_empty() {
                0.0
            } else {
                v.iter().sum::<f32>() / v.len() as f32
            }
        };
        let crossing = failed.iter().filter(|&&p| p >= DETECTION_THRESHOLD).count();
        let labeled = failed.len() + healthy.len();
        Ok(Self {
            crossing_rate: if failed.is_empty() {
                0.0
            } else {
                crossing as f32 / failed.len() as f32
            },
            failed_mean: mean(&failed),
            healthy_mean: mean(&healthy),
            labeled_mean: if labeled == 0 {
                0.0
            } else {
                (failed.iter().sum::<f32>() + healthy.iter().sum::<f32>()) / labeled as f32
            },
            max_probability,
            failed_nodes: failed.len(),
            healthy_nodes: healthy.len(),
        })
    }
}

/// Outcome of one promotion criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub name: String,
    pub value: f32,
    /// `">="`, `"<"` or `">"`.
    pub comparison: String,
    pub limit: f32,
    pub passed: bool,
}

impl CriterionResult {
    fn at_least(name: &str, value: f32, limit: f32) -> Self {
        Self::new(name, value, ">=", limit, value >= limit)
    }

    fn below(name: &str, value: f32, limit: f32) -> Self {
        Self::new(name, value, "<", limit, value < limit)
    }

    fn new(name: &str, value: f32, comparison: &str, limit: f32, passed: bool) -> Self {
        Self {
            name: name.to_string(),
            value,
            comparison: comparison.to_string(),
            limit,
            passed,
        }
    }
}

/// The five promotion criteria, in order.
pub fn evaluate_criteria(m: &GateMetrics) -> Vec<CriterionResult> {
    vec![
        CriterionResult::at_least("failed_node_crossing_rate", m.crossing_rate, MIN_CROSSING_RATE),
        CriterionResult::below("healthy_mean_probability", m.healthy_mean, MAX_HEALTHY_MEAN),
        CriterionResult::below("labeled_mean_probability", m.labeled_mean, MAX_LABELED_MEAN),
        CriterionResult::below("max_probability", m.max_probability, MAX_PROBABILITY),
        CriterionResult::new(
            "failed_above_healthy",
            m.failed_mean,
            ">",
            m.healthy_mean,
            m.failed_mean > m.healthy_mean,
        ),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateEpoch {
    pub epoch: usize,
    pub loss: f32,
    pub gate_mean: f32,
    pub gate_std: f32,
}

/// Non-fatal early stop on gate saturation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SaturationWarning {
    pub epoch: usize,
    pub gate_mean: f32,
    pub gate_std: f32,
}

/// Evidence that a rejected run left production in place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RollbackConfirmation {
    pub production_version: u64,
    /// Production still points at the exact pre-run snapshot.
    pub unchanged: bool,
}

/// Full account of a gate retraining run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRetrainReport {
    pub run_id: Uuid,
    pub base_version: u64,
    pub dataset: IncidentSummary,
    pub learning_rate: f32,
    pub epochs_requested: usize,
    pub loss: LossType,
    pub trainable_groups: Vec<ParamGroup>,
    pub frozen_groups: Vec<ParamGroup>,
    pub pre_metrics: GateMetrics,
    pub post_metrics: GateMetrics,
    pub epochs: Vec<GateEpoch>,
    pub criteria: Vec<CriterionResult>,
    pub saturation: Option<SaturationWarning>,
    pub warnings: Vec<String>,
    pub passed: bool,
    pub promoted_version: Option<u64>,
    pub rollback: Option<RollbackConfirmation>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl GateRetrainReport {
    /// Names of the criteria that did not hold.
    pub fn failed_criteria(&self) -> Vec<String> {
        self.criteria
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.clone())
            .collect()
    }

    fn run_record(&self) -> TrainingRunRecord {
        let mut metrics = BTreeMap::new();
        let m = &self.post_metrics;
        metrics.insert("pre_crossing_rate".to_string(), self.pre_metrics.crossing_rate);
        metrics.insert("crossing_rate".to_string(), m.crossing_rate);
        metrics.insert("healthy_mean".to_string(), m.healthy_mean);
        metrics.insert("labeled_mean".to_string(), m.labeled_mean);
        metrics.insert("max_probability".to_string(), m.max_probability);
        metrics.insert("failed_mean".to_string(), m.failed_mean);
        TrainingRunRecord {
            run_id: self.run_id,
            stage: Stage::GateRetrain,
            base_version: self.base_version,
            dataset: self.dataset,
            frozen_groups: self.frozen_groups.clone(),
            metrics,
            decision: if self.passed {
                RunDecision::Promoted
            } else {
                RunDecision::Rejected
            },
            promoted_version: self.promoted_version,
            rollback_to: self.rollback.map(|r| r.production_version),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Check that every group in [`FROZEN_GROUPS`] is frozen under `mask`.
pub fn verify_freeze(mask: &ParameterMask) -> Result<()> {
    let violations: Vec<String> = FROZEN_GROUPS
        .iter()
        .filter(|&&g| mask.is_trainable(g))
        .map(|g| g.name().to_string())
        .collect();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(CascadeError::FreezeViolation { groups: violations })
    }
}

fn gate_statistics(params: &ModelParameters, samples: &[TrainingSample]) -> Result<(f32, f32)> {
    let mut sum = 0.0f64;
    let mut sq = 0.0f64;
    let mut count = 0usize;
    for sample in samples {
        let cache = params.weights.forward(&sample.prepared, None)?;
        for &g in cache.gate() {
            sum += g as f64;
            sq += (g as f64) * (g as f64);
            count += 1;
        }
    }
    if count == 0 {
        return Ok((0.0, 0.0));
    }
    let mean = sum / count as f64;
    let var = (sq / count as f64 - mean * mean).max(0.0);
    Ok((mean as f32, var.sqrt() as f32))
}

/// Runs gate retraining against a registry.
pub struct GateRetrainer {
    config: GateRetrainConfig,
}

impl GateRetrainer {
    pub fn new(config: GateRetrainConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GateRetrainConfig {
        &self.config
    }

    /// Trainability mask requested by the configuration.
    pub fn mask(&self) -> ParameterMask {
        let mut mask = ParameterMask::only(&[ParamGroup::Gate]);
        if self.config.train_output_layer {
            mask = mask.unfreeze(ParamGroup::OutputProjection);
        }
        for &g in &self.config.additional_trainable {
            mask = mask.unfreeze(g);
        }
        mask
    }

    /// Loss spec with focal parameters clamped to their caps.
    fn loss_spec(&self, warnings: &mut Vec<String>) -> LossSpec {
        let cfg = &self.config;
        if !cfg.focal {
            return LossSpec::masked(cfg.pos_weight);
        }
        let gamma = cfg.focal_gamma.min(GateRetrainConfig::MAX_FOCAL_GAMMA);
        let alpha = cfg.focal_alpha.min(GateRetrainConfig::MAX_FOCAL_ALPHA);
        if gamma < cfg.focal_gamma || alpha < cfg.focal_alpha {
            let msg = format!(
                "focal parameters clamped: gamma {} -> {gamma}, alpha {} -> {alpha}",
                cfg.focal_gamma, cfg.focal_alpha
            );
            warn!("{msg}");
            warnings.push(msg);
        }
        LossSpec::masked_focal(cfg.pos_weight, gamma, alpha)
    }

    fn check_minimums(&self, summary: &IncidentSummary) -> Result<()> {
        let cfg = &self.config;
        if summary.incidents < cfg.min_incidents {
            return Err(CascadeError::input(format!(
                "gate retraining needs at least {} incidents, got {}",
                cfg.min_incidents, summary.incidents
            )));
        }
        if summary.labeled_nodes < cfg.min_labeled_nodes {
            return Err(CascadeError::input(format!(
                "gate retraining needs at least {} labeled nodes, got {}",
                cfg.min_labeled_nodes, summary.labeled_nodes
            )));
        }
        if summary.failed_nodes < cfg.min_failed_nodes {
            return Err(CascadeError::input(format!(
                "gate retraining needs at least {} failed nodes, got {}",
                cfg.min_failed_nodes, summary.failed_nodes
            )));
        }
        Ok(())
    }

    /// Retrain the gate on `incidents` and promote the result if it passes.
    ///
    /// # Errors
    /// - `Config` / `InputError` for bad settings or too little data
    /// - `FreezeViolation` if a topology group would be trained
    /// - `TrainingDivergence` on non-finite loss or gradients
    /// - `ValidationRejection` when any criterion fails; production is
    ///   unchanged and the boxed report says which
    pub fn retrain(
        &self,
        registry: &ModelRegistry,
        incidents: &[Incident],
    ) -> Result<GateRetrainReport> {
        self.config.validate()?;
        let dataset = summarize(incidents);
        self.check_minimums(&dataset)?;
        let mask = self.mask();
        verify_freeze(&mask)?;

        let snapshot = registry.production();
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            base_version = snapshot.version,
            incidents = dataset.incidents,
            labeled = dataset.labeled_nodes,
            failed = dataset.failed_nodes,
            "starting gate retraining"
        );

        match self.run(&snapshot, incidents, mask, dataset, run_id, started_at) {
            Ok((mut report, candidate)) if report.passed => {
                let promoted = registry.promote(candidate);
                report.promoted_version = Some(promoted.version);
                report.finished_at = Utc::now();
                info!(%run_id, version = promoted.version, "gate candidate promoted");
                registry.record(report.run_record());
                Ok(report)
            }
            Ok((mut report, _rejected)) => {
                let current = registry.production();
                report.rollback = Some(RollbackConfirmation {
                    production_version: current.version,
                    unchanged: Arc::ptr_eq(&current, &snapshot),
                });
                report.finished_at = Utc::now();
                warn!(
                    %run_id,
                    failed = ?report.failed_criteria(),
                    production_version = current.version,
                    "candidate rejected, production unchanged"
                );
                registry.record(report.run_record());
                Err(CascadeError::ValidationRejection(Box::new(report)))
            }
            Err(e) => {
                let mut record =
                    TrainingRunRecord::start(Stage::GateRetrain, snapshot.version, dataset);
                record.run_id = run_id;
                record.started_at = started_at;
                record.frozen_groups = mask.frozen_groups().into_iter().collect();
                record.rollback_to = Some(snapshot.version);
                registry.record(record.finish(RunDecision::Aborted));
                warn!(%run_id, error = %e, "gate retraining aborted");
                Err(e)
            }
        }
    }

    fn run(
        &self,
        snapshot: &Arc<ModelParameters>,
        incidents: &[Incident],
        mask: ParameterMask,
        dataset: IncidentSummary,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<(GateRetrainReport, ModelParameters)> {
        let cfg = &self.config;
        let mut warnings = Vec::new();
        let loss = self.loss_spec(&mut warnings);

        let mut candidate = snapshot.derive(Stage::GateRetrain);
        let samples = incidents
            .iter()
            .filter(|inc| inc.graph.labeled_count() > 0)
            .map(|inc| TrainingSample::from_graph(&inc.graph, &candidate.normalizer))
            .collect::<Result<Vec<_>>>()?;

        let pre_metrics = GateMetrics::compute(snapshot, incidents)?;
        debug!(?pre_metrics, "pre-training metrics");

        let mut trainer = Trainer::new(
            AdamConfig::with_learning_rate(cfg.learning_rate),
            mask,
            loss,
            cfg.seed,
        )
        .with_grad_clip(cfg.grad_clip_norm);

        let mut epochs = Vec::with_capacity(cfg.epochs);
        let mut saturation = None;
        for epoch in 1..=cfg.epochs {
            let mut loss_sum = 0.0;
            let mut steps = 0usize;
            for sample in &samples {
                if let Some(stats) = trainer.step(&mut candidate.weights, &[sample], epoch)? {
                    loss_sum += stats.loss;
                    steps += 1;
                }
            }
            let epoch_loss = loss_sum / steps.max(1) as f32;
            let (gate_mean, gate_std) = gate_statistics(&candidate, &samples)?;
            info!(epoch, loss = epoch_loss, gate_mean, gate_std, "gate epoch");
            epochs.push(GateEpoch {
                epoch,
                loss: epoch_loss,
                gate_mean,
                gate_std,
            });

            if !(SATURATION_LOW..=SATURATION_HIGH).contains(&gate_mean) {
                let msg = format!("gate saturated at epoch {epoch} (mean {gate_mean:.3}), stopping early");
                warn!("{msg}");
                warnings.push(msg);
                saturation = Some(SaturationWarning {
                    epoch,
                    gate_mean,
                    gate_std,
                });
                break;
            }
        }

        for group in FROZEN_GROUPS {
            if !candidate.weights.group_identical(&snapshot.weights, group) {
                return Err(CascadeError::FreezeViolation {
                    groups: vec![group.name().to_string()],
                });
            }
        }

        let post_metrics = GateMetrics::compute(&candidate, incidents)?;
        let criteria = evaluate_criteria(&post_metrics);
        let passed = criteria.iter().all(|c| c.passed);
        info!(
            crossing_before = pre_metrics.crossing_rate,
            crossing_after = post_metrics.crossing_rate,
            healthy_mean = post_metrics.healthy_mean,
            passed,
            "gate validation"
        );

        let report = GateRetrainReport {
            run_id,
            base_version: snapshot.version,
            dataset,
            learning_rate: cfg.learning_rate,
            epochs_requested: cfg.epochs,
            loss: loss.loss_type,
            trainable_groups: mask.trainable_groups().into_iter().collect(),
            frozen_groups: mask.frozen_groups().into_iter().collect(),
            pre_metrics,
            post_metrics,
            epochs,
            criteria,
            saturation,
            warnings,
            passed,
            promoted_version: None,
            rollback: None,
            started_at,
            finished_at: started_at,
        };
        Ok((report, candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> GateMetrics {
        GateMetrics {
            crossing_rate: 0.6,
            failed_mean: 0.11,
            healthy_mean: 0.02,
            labeled_mean: 0.03,
            max_probability: 0.2,
            failed_nodes: 25,
            healthy_nodes: 175,
        }
    }

    #[test]
    fn test_detection_threshold_is_exp_minus_two_and_a_half() {
        assert!((DETECTION_THRESHOLD - (-2.5f32).exp()).abs() < 1e-6);
    }

    #[test]
    fn test_all_criteria_pass() {
        let criteria = evaluate_criteria(&metrics());
        assert_eq!(criteria.len(), 5);
        assert!(criteria.iter().all(|c| c.passed));
    }

    #[test]
    fn test_each_criterion_can_fail() {
        let cases: [(fn(&mut GateMetrics), &str); 5] = [
            (|m| m.crossing_rate = 0.4, "failed_node_crossing_rate"),
            (|m| m.healthy_mean = 0.05, "healthy_mean_probability"),
            (|m| m.labeled_mean = 0.07, "labeled_mean_probability"),
            (|m| m.max_probability = 0.95, "max_probability"),
            (|m| m.failed_mean = 0.01, "failed_above_healthy"),
        ];
        for (mutate, name) in cases {
            let mut m = metrics();
            mutate(&mut m);
            let failed: Vec<_> = evaluate_criteria(&m)
                .into_iter()
                .filter(|c| !c.passed)
                .map(|c| c.name)
                .collect();
            assert_eq!(failed, vec![name.to_string()]);
        }
    }

    #[test]
    fn test_default_mask_freezes_topology() {
        let retrainer = GateRetrainer::new(GateRetrainConfig::default());
        let mask = retrainer.mask();
        verify_freeze(&mask).unwrap();
        assert_eq!(
            mask.trainable_groups().into_iter().collect::<Vec<_>>(),
            vec![ParamGroup::Gate]
        );

        let retrainer = GateRetrainer::new(GateRetrainConfig {
            train_output_layer: true,
            ..Default::default()
        });
        verify_freeze(&retrainer.mask()).unwrap();
        assert!(retrainer.mask().is_trainable(ParamGroup::OutputProjection));
    }

    #[test]
    fn test_freeze_violation_names_groups() {
        let retrainer = GateRetrainer::new(GateRetrainConfig {
            additional_trainable: vec![ParamGroup::Refinement, ParamGroup::StatusProjection],
            ..Default::default()
        });
        match verify_freeze(&retrainer.mask()) {
            Err(CascadeError::FreezeViolation { groups }) => {
                assert_eq!(groups, vec!["refinement", "status_projection"]);
            }
            other => panic!("expected freeze violation, got {other:?}"),
        }
    }

    #[test]
    fn test_focal_parameters_clamped() {
        let retrainer = GateRetrainer::new(GateRetrainConfig {
            focal: true,
            focal_gamma: 3.0,
            focal_alpha: 0.9,
            ..Default::default()
        });
        let mut warnings = Vec::new();
        let spec = retrainer.loss_spec(&mut warnings);
        assert_eq!(
            spec.loss_type,
            LossType::Focal {
                gamma: 2.0,
                alpha: 0.75
            }
        );
        assert_eq!(warnings.len(), 1);
    }
}

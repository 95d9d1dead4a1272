//! Backtesting against incidents whose outcome is known.
//!
//! Each incident is replayed through the encoder and the nodes with a known
//! label are ranked by predicted impact probability (output dimension 0).
//! The question is whether the model would have put the nodes that actually
//! failed at the top of an operator's inspection list.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BacktestConfig;
use crate::decision::check_threshold;
use crate::encoder::GraphEncoder;
use crate::error::{CascadeError, Result};
use crate::graph::OUTPUT_DIM;
use crate::incident::Incident;
use crate::params::ModelParameters;

/// Ground-truth impact above which a node counts as actually impacted.
pub const IMPACTED_LABEL: f32 = 0.5;

/// Precision and recall of the top `k` ranked nodes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankingMetrics {
    pub k: usize,
    pub hits: usize,
    pub actually_impacted: usize,
    /// Impacted nodes among the top `k`, divided by `k`.
    pub precision_at_k: f32,
    /// Impacted nodes among the top `k`, divided by all impacted nodes.
    pub recall_at_k: f32,
    /// Top-`k` nodes whose probability reaches the alert threshold.
    pub predicted_in_top_k: usize,
}

/// Known-label positions ordered by descending probability.
///
/// Ties keep node order.
fn ranked_known(predictions: &[f32], truth: &[f32]) -> Vec<usize> {
    let mut known: Vec<usize> = truth
        .iter()
        .enumerate()
        .filter(|&(_, &t)| t >= 0.0)
        .map(|(pos, _)| pos)
        .collect();
    known.sort_by(|&a, &b| predictions[b].total_cmp(&predictions[a]));
    known
}

/// Rank the known nodes by `predictions` and score the top `k` against
/// `truth` (negative entries are unknown and skipped).
///
/// When nothing was actually impacted, recall is 1 and precision is 1 only
/// if no top-`k` node reaches `threshold`. Returns `None` for `k == 0` or
/// when no label is known.
pub fn rank_at_k(
    predictions: &[f32],
    truth: &[f32],
    k: usize,
    threshold: f32,
) -> Option<RankingMetrics> {
    if k == 0 || predictions.len() != truth.len() {
        return None;
    }
    let ranked = ranked_known(predictions, truth);
    if ranked.is_empty() {
        return None;
    }
    let top = &ranked[..k.min(ranked.len())];
    let predicted_in_top_k = top.iter().filter(|&&p| predictions[p] >= threshold).count();
    let actually_impacted = ranked.iter().filter(|&&p| truth[p] > IMPACTED_LABEL).count();

    if actually_impacted == 0 {
        return Some(RankingMetrics {
            k,
            hits: 0,
            actually_impacted,
            precision_at_k: if predicted_in_top_k == 0 { 1.0 } else { 0.0 },
            recall_at_k: 1.0,
            predicted_in_top_k,
        });
    }

    let hits = top.iter().filter(|&&p| truth[p] > IMPACTED_LABEL).count();
    Some(RankingMetrics {
        k,
        hits,
        actually_impacted,
        precision_at_k: hits as f32 / k as f32,
        recall_at_k: hits as f32 / actually_impacted as f32,
        predicted_in_top_k,
    })
}

/// Thresholded predictions against impacted/not-impacted ground truth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionCounts {
    pub tp: usize,
    pub fp: usize,
    pub tn: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
}

impl ConfusionCounts {
    pub fn total(&self) -> usize {
        self.tp + self.fp + self.tn + self.fn_
    }

    pub fn accuracy(&self) -> f32 {
        ratio(self.tp + self.tn, self.total())
    }

    pub fn precision(&self) -> f32 {
        ratio(self.tp, self.tp + self.fp)
    }

    pub fn recall(&self) -> f32 {
        ratio(self.tp, self.tp + self.fn_)
    }

    pub fn f1(&self) -> f32 {
        let (p, r) = (self.precision(), self.recall());
        if p + r > 0.0 {
            2.0 * p * r / (p + r)
        } else {
            0.0
        }
    }
}

fn ratio(num: usize, den: usize) -> f32 {
    if den == 0 {
        0.0
    } else {
        num as f32 / den as f32
    }
}

fn mean(values: impl Iterator<Item = f32>) -> f32 {
    let (sum, n) = values.fold((0.0f64, 0usize), |(s, n), v| (s + v as f64, n + 1));
    if n == 0 {
        0.0
    } else {
        (sum / n as f64) as f32
    }
}

/// One entry of the inspection list.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankedNode {
    pub node_id: usize,
    pub probability: f32,
    pub actual: f32,
}

/// Backtest of a single incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentBacktest {
    pub incident_id: String,
    pub num_nodes: usize,
    pub known_labels: usize,
    pub mae: f32,
    pub rmse: f32,
    pub confusion: ConfusionCounts,
    pub accuracy: f32,
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
    pub ranking: RankingMetrics,
    /// The top `k` known nodes, highest probability first.
    pub top_nodes: Vec<RankedNode>,
}

impl IncidentBacktest {
    /// Score `probabilities` (`N x 12`, aligned with the incident's nodes)
    /// against the incident's dimension-0 labels.
    ///
    /// `Ok(None)` when the incident has no known label.
    pub fn from_predictions(
        incident: &Incident,
        probabilities: &Array2<f32>,
        k: usize,
        threshold: f32,
    ) -> Result<Option<Self>> {
        let graph = &incident.graph;
        if probabilities.dim() != (graph.num_nodes(), OUTPUT_DIM) {
            return Err(CascadeError::dimension_mismatch(
                format!("{}x{}", graph.num_nodes(), OUTPUT_DIM),
                format!("{}x{}", probabilities.nrows(), probabilities.ncols()),
            ));
        }
        let Some(labels) = graph.labels() else {
            return Ok(None);
        };
        let pred: Vec<f32> = probabilities.column(0).to_vec();
        let truth: Vec<f32> = labels.column(0).to_vec();
        let Some(ranking) = rank_at_k(&pred, &truth, k, threshold) else {
            return Ok(None);
        };

        let mut confusion = ConfusionCounts::default();
        let mut abs_sum = 0.0f64;
        let mut sq_sum = 0.0f64;
        let mut known = 0usize;
        for (&p, &t) in pred.iter().zip(&truth) {
            if t < 0.0 {
                continue;
            }
            known += 1;
            let err = (p - t) as f64;
            abs_sum += err.abs();
            sq_sum += err * err;
            match (p >= threshold, t > IMPACTED_LABEL) {
                (true, true) => confusion.tp += 1,
                (true, false) => confusion.fp += 1,
                (false, false) => confusion.tn += 1,
                (false, true) => confusion.fn_ += 1,
            }
        }

        let nodes = graph.nodes();
        let top_nodes = ranked_known(&pred, &truth)
            .into_iter()
            .take(k)
            .map(|pos| RankedNode {
                node_id: nodes[pos].id,
                probability: pred[pos],
                actual: truth[pos],
            })
            .collect();

        Ok(Some(Self {
            incident_id: incident.id.clone(),
            num_nodes: graph.num_nodes(),
            known_labels: known,
            mae: (abs_sum / known as f64) as f32,
            rmse: (sq_sum / known as f64).sqrt() as f32,
            accuracy: confusion.accuracy(),
            precision: confusion.precision(),
            recall: confusion.recall(),
            f1: confusion.f1(),
            confusion,
            ranking,
            top_nodes,
        }))
    }
}

/// Means over the evaluated incidents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub evaluated: usize,
    pub mean_mae: f32,
    pub mean_rmse: f32,
    pub mean_accuracy: f32,
    pub mean_precision: f32,
    pub mean_recall: f32,
    pub mean_f1: f32,
    pub mean_precision_at_k: f32,
    pub mean_recall_at_k: f32,
}

impl BacktestSummary {
    pub fn from_results(results: &[IncidentBacktest]) -> Self {
        Self {
            evaluated: results.len(),
            mean_mae: mean(results.iter().map(|r| r.mae)),
            mean_rmse: mean(results.iter().map(|r| r.rmse)),
            mean_accuracy: mean(results.iter().map(|r| r.accuracy)),
            mean_precision: mean(results.iter().map(|r| r.precision)),
            mean_recall: mean(results.iter().map(|r| r.recall)),
            mean_f1: mean(results.iter().map(|r| r.f1)),
            mean_precision_at_k: mean(results.iter().map(|r| r.ranking.precision_at_k)),
            mean_recall_at_k: mean(results.iter().map(|r| r.ranking.recall_at_k)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub model_version: u64,
    pub k: usize,
    pub threshold: f32,
    pub results: Vec<IncidentBacktest>,
    /// Incidents without a known label.
    pub skipped: Vec<String>,
    pub summary: BacktestSummary,
}

/// Two models backtested on the same incidents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelComparison {
    pub baseline: BacktestReport,
    pub candidate: BacktestReport,
    /// Relative MAE reduction of the candidate, in percent.
    pub mae_improvement_pct: f32,
    pub f1_delta: f32,
    pub precision_at_k_delta: f32,
    pub recall_at_k_delta: f32,
}

impl ModelComparison {
    /// Lower error without a worse inspection list.
    pub fn candidate_better(&self) -> bool {
        self.candidate.summary.mean_mae < self.baseline.summary.mean_mae
            && self.precision_at_k_delta >= 0.0
    }
}

pub struct Backtester {
    top_k: usize,
    threshold: f32,
}

impl Backtester {
    pub fn new(config: &BacktestConfig, threshold: f32) -> Result<Self> {
        config.validate()?;
        check_threshold(threshold)?;
        Ok(Self {
            top_k: config.top_k,
            threshold,
        })
    }

    /// Backtest one incident; `None` when it carries no known label.
    pub fn backtest_incident(
        &self,
        params: &ModelParameters,
        incident: &Incident,
    ) -> Result<Option<IncidentBacktest>> {
        let probabilities = GraphEncoder::new(params).probabilities(&incident.graph)?;
        IncidentBacktest::from_predictions(incident, &probabilities, self.top_k, self.threshold)
    }

    /// Backtest every incident.
    ///
    /// # Errors
    /// `InputError` when no incident carries a known label.
    pub fn run(&self, params: &ModelParameters, incidents: &[Incident]) -> Result<BacktestReport> {
        let mut results = Vec::with_capacity(incidents.len());
        let mut skipped = Vec::new();
        for incident in incidents {
            match self.backtest_incident(params, incident)? {
                Some(result) => {
                    debug!(
                        incident = %result.incident_id,
                        mae = result.mae,
                        precision_at_k = result.ranking.precision_at_k,
                        "backtested incident"
                    );
                    results.push(result);
                }
                None => {
                    warn!(incident = %incident.id, "no known labels, skipped");
                    skipped.push(incident.id.clone());
                }
            }
        }
        if results.is_empty() {
            return Err(CascadeError::input("no incident carries a known label"));
        }

        let summary = BacktestSummary::from_results(&results);
        info!(
            model_version = params.version,
            evaluated = summary.evaluated,
            mean_mae = summary.mean_mae,
            mean_precision_at_k = summary.mean_precision_at_k,
            "backtest finished"
        );
        Ok(BacktestReport {
            model_version: params.version,
            k: self.top_k,
            threshold: self.threshold,
            results,
            skipped,
            summary,
        })
    }

    /// Backtest `baseline` and `candidate` on the same incidents.
    pub fn compare(
        &self,
        baseline: &ModelParameters,
        candidate: &ModelParameters,
        incidents: &[Incident],
    ) -> Result<ModelComparison> {
        let baseline = self.run(baseline, incidents)?;
        let candidate = self.run(candidate, incidents)?;
        let (b, c) = (&baseline.summary, &candidate.summary);
        let mae_improvement_pct = if b.mean_mae > 0.0 {
            (b.mean_mae - c.mean_mae) / b.mean_mae * 100.0
        } else {
            0.0
        };
        Ok(ModelComparison {
            mae_improvement_pct,
            f1_delta: c.mean_f1 - b.mean_f1,
            precision_at_k_delta: c.mean_precision_at_k - b.mean_precision_at_k,
            recall_at_k_delta: c.mean_recall_at_k - b.mean_recall_at_k,
            baseline,
            candidate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderConfig;
    use crate::encoder::EncoderWeights;
    use crate::incident::parse_incidents;
    use crate::normalize::FeatureNormalizer;
    use crate::params::Stage;
    use crate::synthetic::{SyntheticConfig, SyntheticGenerator};

    // node 3 has no label; 0, 2 and 4 were actually impacted
    const LABELED: &str = r#"{
        "id": "substation-fire",
        "nodes": [
            {"id": 0, "type": "Power", "status": 0.0, "impacted": 1.0},
            {"id": 1, "type": "Road", "impacted": 0.0},
            {"id": 2, "type": "Hospital", "impacted": 0.8},
            {"id": 3, "type": "Pump"},
            {"id": 4, "type": "Pipe", "impacted": 0.6},
            {"id": 5, "type": "School", "impacted": 0.0}
        ],
        "edges": [
            {"source": 0, "target": 1}, {"source": 0, "target": 2},
            {"source": 2, "target": 3}, {"source": 3, "target": 4},
            {"source": 4, "target": 5}
        ]
    }"#;

    fn predictions(impact: [f32; 6]) -> Array2<f32> {
        let mut probs = Array2::from_elem((6, OUTPUT_DIM), 0.05);
        for (pos, p) in impact.into_iter().enumerate() {
            probs[[pos, 0]] = p;
        }
        probs
    }

    #[test]
    fn test_hand_labeled_top_k() {
        let incident = parse_incidents(LABELED).unwrap().remove(0);
        let probs = predictions([0.9, 0.7, 0.2, 0.99, 0.6, 0.1]);
        let result = IncidentBacktest::from_predictions(&incident, &probs, 3, 0.5)
            .unwrap()
            .unwrap();

        // node 3 scores highest but is unlabeled, so it never enters the list
        let top: Vec<usize> = result.top_nodes.iter().map(|n| n.node_id).collect();
        assert_eq!(top, vec![0, 1, 4]);
        assert_eq!(result.known_labels, 5);

        let r = result.ranking;
        assert_eq!(r.hits, 2);
        assert_eq!(r.actually_impacted, 3);
        assert!((r.precision_at_k - 2.0 / 3.0).abs() < 1e-6);
        assert!((r.recall_at_k - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(r.predicted_in_top_k, 3);

        assert_eq!(
            result.confusion,
            ConfusionCounts {
                tp: 2,
                fp: 1,
                tn: 1,
                fn_: 1
            }
        );
        assert!((result.accuracy - 0.6).abs() < 1e-6);
        assert!((result.f1 - 2.0 / 3.0).abs() < 1e-6);
        assert!((result.mae - 0.3).abs() < 1e-5);
    }

    #[test]
    fn test_recall_reaches_one_with_larger_k() {
        let incident = parse_incidents(LABELED).unwrap().remove(0);
        let probs = predictions([0.9, 0.7, 0.2, 0.99, 0.6, 0.1]);
        let result = IncidentBacktest::from_predictions(&incident, &probs, 4, 0.5)
            .unwrap()
            .unwrap();
        assert_eq!(result.ranking.hits, 3);
        assert_eq!(result.ranking.recall_at_k, 1.0);
        assert_eq!(result.ranking.precision_at_k, 0.75);
    }

    #[test]
    fn test_no_impacts_scores_quiet_ranking() {
        let quiet = rank_at_k(&[0.3, 0.2, 0.1], &[0.0, 0.0, 0.0], 2, 0.5).unwrap();
        assert_eq!(quiet.precision_at_k, 1.0);
        assert_eq!(quiet.recall_at_k, 1.0);

        let noisy = rank_at_k(&[0.7, 0.2, 0.1], &[0.0, 0.0, 0.0], 2, 0.5).unwrap();
        assert_eq!(noisy.precision_at_k, 0.0);
        assert_eq!(noisy.predicted_in_top_k, 1);

        assert!(rank_at_k(&[0.5], &[-1.0], 3, 0.5).is_none());
        assert!(rank_at_k(&[0.5], &[1.0], 0, 0.5).is_none());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let incident = parse_incidents(LABELED).unwrap().remove(0);
        let probs = Array2::zeros((4, OUTPUT_DIM));
        assert!(IncidentBacktest::from_predictions(&incident, &probs, 3, 0.5).is_err());
    }

    fn small_params(seed: u64) -> ModelParameters {
        let cfg = EncoderConfig {
            hidden_dim: 8,
            heads: 2,
            gate_hidden_dim: 4,
            seed,
            ..Default::default()
        };
        ModelParameters::new(
            EncoderWeights::init(&cfg),
            FeatureNormalizer::identity(),
            Stage::Pretrain,
        )
    }

    fn synthetic_incidents() -> Vec<Incident> {
        let mut gen = SyntheticGenerator::new(SyntheticConfig {
            max_nodes: 10,
            seed: 11,
            ..Default::default()
        })
        .unwrap();
        gen.generate(3)
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(i, graph)| Incident {
                id: format!("replay-{i}"),
                name: None,
                date: None,
                description: None,
                graph,
            })
            .collect()
    }

    #[test]
    fn test_run_and_compare_models() {
        let incidents = synthetic_incidents();
        let backtester = Backtester::new(&BacktestConfig::default(), 0.5).unwrap();

        let report = backtester.run(&small_params(1), &incidents).unwrap();
        assert_eq!(report.results.len(), 3);
        assert!(report.skipped.is_empty());
        let s = report.summary;
        assert_eq!(s.evaluated, 3);
        assert!(s.mean_mae.is_finite() && s.mean_rmse >= s.mean_mae - 1e-6);
        assert!((0.0..=1.0).contains(&s.mean_precision_at_k));

        let same = backtester
            .compare(&small_params(1), &small_params(1), &incidents)
            .unwrap();
        assert_eq!(same.f1_delta, 0.0);
        assert_eq!(same.precision_at_k_delta, 0.0);
        assert!(!same.candidate_better());

        let other = backtester
            .compare(&small_params(1), &small_params(2), &incidents)
            .unwrap();
        assert_eq!(other.baseline.summary, report.summary);
    }

    #[test]
    fn test_unlabeled_incidents_rejected() {
        let json = r#"{"id": "blind", "nodes": [{"id": 0, "type": "Road"}]}"#;
        let incidents = parse_incidents(json).unwrap();
        let backtester = Backtester::new(&BacktestConfig::default(), 0.5).unwrap();
        let err = backtester.run(&small_params(1), &incidents).unwrap_err();
        assert!(err.is_input_error());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(Backtester::new(&BacktestConfig { top_k: 0 }, 0.5).is_err());
        assert!(Backtester::new(&BacktestConfig::default(), 1.0).is_err());
    }
}

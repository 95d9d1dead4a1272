//! Counterfactual failure simulation.
//!
//! The encoder runs once on the graph as observed and once with the target
//! node's status forced to 0. The per-node difference in impact probability
//! is the cascade signal; measuring a difference rather than the absolute
//! output keeps the signal visible on densely connected graphs where baseline
//! probabilities are uniformly high.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SimulationConfig;
use crate::encoder::GraphEncoder;
use crate::error::{CascadeError, Result};
use crate::graph::{InfraGraph, NodeType};
use crate::params::ModelParameters;

/// What kind of outage the forced node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    PowerOutage,
    WaterShortage,
    WaterContamination,
    StructuralCollapse,
    AccessDisruption,
    ServiceDisruption,
}

impl FailureMode {
    pub fn for_node_type(node_type: NodeType) -> Self {
        match node_type {
            NodeType::Power => FailureMode::PowerOutage,
            NodeType::Tank | NodeType::Pump => FailureMode::WaterShortage,
            NodeType::Pipe => FailureMode::WaterContamination,
            NodeType::Building | NodeType::Bridge => FailureMode::StructuralCollapse,
            NodeType::Road => FailureMode::AccessDisruption,
            NodeType::Sensor
            | NodeType::Cluster
            | NodeType::School
            | NodeType::Hospital
            | NodeType::Market => FailureMode::ServiceDisruption,
        }
    }
}

/// Qualitative reading of a node's delta under a failure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskType {
    FailureSource,
    Unaffected,
    /// Negative delta: the node is relieved by the failure.
    LoadRelief,
    PowerLoss,
    ShortageRisk,
    ContaminationRisk,
    StructuralRisk,
    AccessLoss,
    ServiceDegradation,
    /// Hospitals and schools under a positive delta, whatever the mode.
    CriticalServiceLoss,
}

impl RiskType {
    pub fn classify(
        mode: FailureMode,
        node_type: NodeType,
        delta: f32,
        affected: bool,
        is_source: bool,
    ) -> Self {
        if is_source {
            return RiskType::FailureSource;
        }
        if !affected {
            return RiskType::Unaffected;
        }
        if delta < 0.0 {
            return RiskType::LoadRelief;
        }
        if matches!(node_type, NodeType::Hospital | NodeType::School) {
            return RiskType::CriticalServiceLoss;
        }
        match mode {
            FailureMode::PowerOutage => RiskType::PowerLoss,
            FailureMode::WaterShortage => RiskType::ShortageRisk,
            FailureMode::WaterContamination => RiskType::ContaminationRisk,
            FailureMode::StructuralCollapse => RiskType::StructuralRisk,
            FailureMode::AccessDisruption => RiskType::AccessLoss,
            FailureMode::ServiceDisruption => RiskType::ServiceDegradation,
        }
    }
}

/// `1 / (1 + hops)`, or 0 for unreachable nodes.
pub fn topology_weight(hops: Option<usize>) -> f32 {
    hops.map_or(0.0, |h| 1.0 / (1.0 + h as f32))
}

/// Worst-case reading of a delta: `sqrt(max(delta, 0)) * 2 * weight`, in [0, 1].
pub fn pessimistic_delta(delta: f32, topology_weight: f32) -> f32 {
    (delta.max(0.0).sqrt() * 2.0 * topology_weight).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDelta {
    pub node_id: usize,
    pub node_type: NodeType,
    pub baseline: f32,
    pub counterfactual: f32,
    /// `counterfactual - baseline`
    pub delta: f32,
    pub amplified: f32,
    pub affected: bool,
    /// Hop distance from the forced node.
    pub hops: Option<usize>,
    pub topology_weight: f32,
    pub confidence: f32,
    pub pessimistic_delta: f32,
    pub risk: RiskType,
}

/// Per-node outcome of forcing one node to fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaReport {
    pub forced_node: usize,
    pub failure_mode: FailureMode,
    pub dimension: usize,
    pub sensitivity: f32,
    pub amplification: f32,
    pub nodes: Vec<NodeDelta>,
}

impl DeltaReport {
    /// Assemble a report from the two passes' probabilities on one dimension.
    ///
    /// The forced node's counterfactual is never reported below its
    /// baseline; with `pin_forced_node` it is reported as 1.0 with delta 1.0.
    pub fn from_passes(
        graph: &InfraGraph,
        forced_node: usize,
        baseline: &[f32],
        counterfactual: &[f32],
        config: &SimulationConfig,
    ) -> Result<Self> {
        let n = graph.num_nodes();
        if baseline.len() != n || counterfactual.len() != n {
            return Err(CascadeError::dimension_mismatch(
                format!("{n} probabilities"),
                format!("{} and {}", baseline.len(), counterfactual.len()),
            ));
        }
        let forced_pos = graph.require_position(forced_node)?;
        let mode = FailureMode::for_node_type(graph.nodes()[forced_pos].node_type());
        let hops = graph.hop_distances(forced_pos);

        let nodes = graph
            .nodes()
            .iter()
            .enumerate()
            .map(|(pos, node)| {
                let is_source = pos == forced_pos;
                let base = baseline[pos];
                let (cf, delta) = if is_source && config.pin_forced_node {
                    (1.0, 1.0)
                } else if is_source {
                    let cf = counterfactual[pos].max(base);
                    (cf, cf - base)
                } else {
                    (counterfactual[pos], counterfactual[pos] - base)
                };
                let amplified = delta * config.amplification;
                let affected = amplified.abs() > config.sensitivity;
                let tw = topology_weight(hops[pos]);
                NodeDelta {
                    node_id: node.id,
                    node_type: node.node_type(),
                    baseline: base,
                    counterfactual: cf,
                    delta,
                    amplified,
                    affected,
                    hops: hops[pos],
                    topology_weight: tw,
                    confidence: 0.5 + 0.5 * tw,
                    pessimistic_delta: pessimistic_delta(delta, tw),
                    risk: RiskType::classify(mode, node.node_type(), delta, affected, is_source),
                }
            })
            .collect();

        Ok(Self {
            forced_node,
            failure_mode: mode,
            dimension: config.impact_dimension,
            sensitivity: config.sensitivity,
            amplification: config.amplification,
            nodes,
        })
    }

    pub fn node(&self, id: usize) -> Option<&NodeDelta> {
        self.nodes.iter().find(|d| d.node_id == id)
    }

    pub fn affected(&self) -> impl Iterator<Item = &NodeDelta> {
        self.nodes.iter().filter(|d| d.affected)
    }

    /// Sum of positive deltas over every node except the forced one.
    pub fn total_positive_delta(&self) -> f32 {
        self.nodes
            .iter()
            .filter(|d| d.node_id != self.forced_node)
            .map(|d| d.delta.max(0.0))
            .sum()
    }
}

/// Affected nodes at one hop distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceBucket {
    pub distance: usize,
    pub nodes: Vec<usize>,
    pub mean_amplified: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeAnalysis {
    pub forced_node: usize,
    pub buckets: Vec<DistanceBucket>,
    /// Largest hop distance at which a node is still affected.
    pub cascade_depth: usize,
    pub affected_count: usize,
    /// Affected nodes with no path to the forced node.
    pub unreachable_affected: Vec<usize>,
}

impl CascadeAnalysis {
    pub fn from_report(report: &DeltaReport) -> Self {
        let mut buckets: Vec<DistanceBucket> = Vec::new();
        let mut unreachable_affected = Vec::new();
        let mut affected_count = 0;
        for d in report.affected() {
            affected_count += 1;
            let Some(h) = d.hops else {
                unreachable_affected.push(d.node_id);
                continue;
            };
            match buckets.iter_mut().find(|b| b.distance == h) {
                Some(bucket) => {
                    bucket.nodes.push(d.node_id);
                    bucket.mean_amplified += d.amplified;
                }
                None => buckets.push(DistanceBucket {
                    distance: h,
                    nodes: vec![d.node_id],
                    mean_amplified: d.amplified,
                }),
            }
        }
        for b in &mut buckets {
            b.mean_amplified /= b.nodes.len() as f32;
        }
        buckets.sort_by_key(|b| b.distance);
        let cascade_depth = buckets.last().map_or(0, |b| b.distance);
        Self {
            forced_node: report.forced_node,
            buckets,
            cascade_depth,
            affected_count,
            unreachable_affected,
        }
    }
}

/// How much a neighbor's failure moves a target node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Attribution {
    pub neighbor_id: usize,
    pub delta_on_target: f32,
}

/// Runs baseline and counterfactual passes against one parameter snapshot.
pub struct CounterfactualSimulator<'a> {
    encoder: GraphEncoder<'a>,
    config: SimulationConfig,
}

impl<'a> CounterfactualSimulator<'a> {
    pub fn new(params: &'a ModelParameters, config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            encoder: GraphEncoder::new(params),
            config,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    fn column(&self, graph: &InfraGraph) -> Result<Vec<f32>> {
        let probs = self.encoder.probabilities(graph)?;
        Ok(probs.column(self.config.impact_dimension).to_vec())
    }

    fn simulate_with_baseline(
        &self,
        graph: &InfraGraph,
        baseline: &[f32],
        node_id: usize,
    ) -> Result<DeltaReport> {
        let forced = graph.with_failed_node(node_id)?;
        let counterfactual = self.column(&forced)?;
        DeltaReport::from_passes(graph, node_id, baseline, &counterfactual, &self.config)
    }

    /// Force `node_id` to fail and report per-node deltas.
    pub fn simulate(&self, graph: &InfraGraph, node_id: usize) -> Result<DeltaReport> {
        graph.require_position(node_id)?;
        let baseline = self.column(graph)?;
        let report = self.simulate_with_baseline(graph, &baseline, node_id)?;
        debug!(
            node = node_id,
            affected = report.affected().count(),
            "simulated failure"
        );
        Ok(report)
    }

    /// Simulate every candidate, most damaging first.
    pub fn batch_simulate(&self, graph: &InfraGraph, candidates: &[usize]) -> Result<Vec<DeltaReport>> {
        for &id in candidates {
            graph.require_position(id)?;
        }
        let baseline = self.column(graph)?;
        let mut reports = candidates
            .iter()
            .map(|&id| self.simulate_with_baseline(graph, &baseline, id))
            .collect::<Result<Vec<_>>>()?;
        reports.sort_by(|a, b| b.total_positive_delta().total_cmp(&a.total_positive_delta()));
        Ok(reports)
    }

    pub fn cascade_analysis(&self, graph: &InfraGraph, node_id: usize) -> Result<CascadeAnalysis> {
        Ok(CascadeAnalysis::from_report(&self.simulate(graph, node_id)?))
    }

    /// Rank the direct neighbors of `target_id` by the delta their failure
    /// induces on it.
    pub fn upstream_attribution(&self, graph: &InfraGraph, target_id: usize) -> Result<Vec<Attribution>> {
        let target = graph.require_position(target_id)?;
        let baseline = self.column(graph)?;
        let mut neighbors = graph.neighbors()[target].clone();
        neighbors.sort_unstable();
        neighbors.dedup();

        let mut ranked = neighbors
            .into_iter()
            .map(|pos| {
                let neighbor_id = graph.nodes()[pos].id;
                let forced = graph.with_failed_node(neighbor_id)?;
                let cf = self.column(&forced)?;
                Ok(Attribution {
                    neighbor_id,
                    delta_on_target: cf[target] - baseline[target],
                })
            })
            .collect::<Result<Vec<_>>>()?;
        ranked.sort_by(|a, b| b.delta_on_target.total_cmp(&a.delta_on_target));
        Ok(ranked)
    }
}

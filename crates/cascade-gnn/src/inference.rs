//! Request/response inference against the production parameters.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SimulationConfig;
use crate::decision::{alerts, RiskLevel};
use crate::encoder::GraphEncoder;
use crate::error::Result;
use crate::graph::{Edge, InfraGraph};
use crate::registry::ModelRegistry;
use crate::simulate::{CounterfactualSimulator, DeltaReport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// One 24-wide raw feature row per node; node ids are row positions.
    pub features: Vec<Vec<f32>>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Also run a counterfactual with this node forced to fail.
    #[serde(default)]
    pub failure_node_id: Option<usize>,
    /// Alert threshold; no alerts are computed without one.
    #[serde(default)]
    pub threshold: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub model_version: u64,
    /// `N x 12` impact probabilities.
    pub probabilities: Vec<Vec<f32>>,
    pub alerts: Option<Vec<bool>>,
    pub delta: Option<DeltaReport>,
    pub risk: RiskLevel,
}

/// Serves requests from whatever the registry holds as production.
///
/// Each request works on one snapshot, so a promotion landing mid-request
/// does not mix parameter versions.
pub struct InferenceEngine {
    registry: Arc<ModelRegistry>,
    simulation: SimulationConfig,
}

impl InferenceEngine {
    pub fn new(registry: Arc<ModelRegistry>, simulation: SimulationConfig) -> Result<Self> {
        simulation.validate()?;
        Ok(Self {
            registry,
            simulation,
        })
    }

    pub fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        if let Some(t) = request.threshold {
            crate::decision::check_threshold(t)?;
        }
        let graph = InfraGraph::from_feature_rows(&request.features, request.edges.clone())?;
        if let Some(id) = request.failure_node_id {
            graph.require_position(id)?;
        }

        let params = self.registry.production();
        let probs = GraphEncoder::new(&params).probabilities(&graph)?;
        let impact: Vec<f32> = probs.column(self.simulation.impact_dimension).to_vec();

        let delta = match request.failure_node_id {
            Some(id) => Some(
                CounterfactualSimulator::new(&params, self.simulation.clone())?.simulate(&graph, id)?,
            ),
            None => None,
        };
        let alerts = match request.threshold {
            Some(t) => Some(alerts(&impact, t)?),
            None => None,
        };
        debug!(
            version = params.version,
            nodes = graph.num_nodes(),
            "served inference request"
        );

        Ok(InferenceResponse {
            model_version: params.version,
            probabilities: probs.rows().into_iter().map(|r| r.to_vec()).collect(),
            alerts,
            delta,
            risk: RiskLevel::from_max(&impact),
        })
    }
}

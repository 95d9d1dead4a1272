//! # Cascade GNN
//!
//! Graph neural network engine that predicts how a failure in one piece of
//! infrastructure (a pump, a substation, a bridge) cascades through the
//! assets connected to it.
//!
//! The crate is organized around one encoder and the stages that train and
//! query it:
//!
//! - **Encoder**: graph convolution, neighbor attention and a refinement
//!   layer, followed by a gating subnetwork that blends a learned status
//!   override into the hidden state before the 12-dimensional output
//! - **Pretraining**: full training on synthetic single-failure graphs
//! - **Transfer**: fine-tuning on real, partially labeled incidents
//! - **Gate retraining**: safety-gated adaptation of the gate alone, promoted
//!   only when five detection criteria hold and rolled back otherwise
//! - **Simulation**: counterfactual "what if this node fails" deltas
//! - **Decisions**: threshold alerts and risk levels on probabilities
//! - **Backtesting**: top-k precision and recall of a model, or two models
//!   side by side, on incidents with known outcomes
//!
//! ### Usage Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cascade_gnn::{
//!     config::CascadeConfig,
//!     gate::GateRetrainer,
//!     incident::load_incidents,
//!     params::ModelParameters,
//!     registry::ModelRegistry,
//!     simulate::CounterfactualSimulator,
//! };
//!
//! let config = CascadeConfig::default();
//! let registry = Arc::new(ModelRegistry::new(ModelParameters::load("model.bin")?));
//! let incidents = load_incidents("incidents.json")?;
//!
//! // Promotes on success, returns ValidationRejection otherwise
//! let report = GateRetrainer::new(config.gate.clone()).retrain(&registry, &incidents)?;
//!
//! let production = registry.production();
//! let simulator = CounterfactualSimulator::new(&production, config.simulation)?;
//! let deltas = simulator.simulate(&incidents[0].graph, 3)?;
//! ```

pub mod backtest;
pub mod config;
pub mod decision;
pub mod encoder;
pub mod error;
pub mod gate;
pub mod graph;
pub mod incident;
pub mod inference;
pub mod layer;
pub mod loss;
pub mod normalize;
pub mod params;
pub mod pretrain;
pub mod registry;
pub mod scheduler;
pub mod simulate;
pub mod synthetic;
pub mod training;
pub mod transfer;

// Re-export commonly used types
pub use backtest::{Backtester, BacktestReport, ModelComparison};
pub use config::{
    BacktestConfig, CascadeConfig, DecisionConfig, EncoderConfig, GateRetrainConfig, PretrainConfig,
    SimulationConfig, TransferConfig,
};
pub use decision::{alert_matrix, alerts, check_threshold, Decision, RiskLevel};
pub use encoder::{EncoderWeights, GraphEncoder, PreparedGraph};
pub use error::{CascadeError, Result};
pub use gate::{GateMetrics, GateRetrainReport, GateRetrainer, DETECTION_THRESHOLD};
pub use graph::{Edge, InfraGraph, Node, NodeType, OperationalAttributes, Topology};
pub use incident::{load_incidents, parse_incidents, Incident, IncidentSummary};
pub use inference::{InferenceEngine, InferenceRequest, InferenceResponse};
pub use normalize::FeatureNormalizer;
pub use params::{ModelParameters, ParamGroup, ParameterMask, Stage};
pub use pretrain::{PretrainReport, TrainingOrchestrator};
pub use registry::{ModelRegistry, RunDecision, TrainingRunRecord};
pub use simulate::{CascadeAnalysis, CounterfactualSimulator, DeltaReport, FailureMode, RiskType};
pub use synthetic::{LabeledGraphSource, SyntheticConfig, SyntheticGenerator};
pub use transfer::{TransferAdapter, TransferEvaluation, TransferReport};

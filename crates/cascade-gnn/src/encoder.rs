//! The graph encoder: per-node impact scores from features and topology.
//!
//! Pipeline, with `H` the hidden width:
//!
//! 1. feature expansion: `H1 = relu(A (Xn W1) + b1)` (24 -> H)
//! 2. neighbor attention on `H1`, merged with the residual re-projection
//!    `H1 Wr + br` before rectification: `H2 = relu(Att(H1) + Res(H1))`
//! 3. refinement: `H3 = relu(A (H2 W3) + b3 + H1)`
//! 4. gate: `G = sigmoid(MLP([Xn | H3]))`, override `O = sev Ws + bs` with
//!    `sev = 1 - status`, blended `Hb = G * O + (1 - G) * H3`
//! 5. output: `S = Hb Wo + bo` (H -> 12), no activation
//!
//! `A` is the symmetric-normalized adjacency with self-loops from
//! [`Topology`]. Dropout follows each rectified graph layer in training.

use ndarray::{concatenate, s, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::EncoderConfig;
use crate::error::{CascadeError, Result};
use crate::graph::{InfraGraph, Topology, FEATURE_DIM, OUTPUT_DIM, STATUS_INDEX};
use crate::layer::{relu, relu_backward, sigmoid, AttentionCache, Dense, NeighborAttention};
use crate::normalize::FeatureNormalizer;
use crate::params::{ModelParameters, ParamGroup, ParameterMask};

/// All learnable tensors of the encoder.
///
/// The same structure doubles as a gradient container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderWeights {
    pub feature_expansion: Dense,
    pub attention: NeighborAttention,
    pub residual_projection: Dense,
    pub refinement: Dense,
    pub gate_hidden: Dense,
    pub gate_output: Dense,
    pub status_projection: Dense,
    pub output_projection: Dense,
    /// Dropout rate used by training passes.
    pub dropout: f32,
}

impl EncoderWeights {
    /// Xavier-initialized weights, seeded from the config.
    pub fn init(config: &EncoderConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let h = config.hidden_dim;
        Self {
            feature_expansion: Dense::new(FEATURE_DIM, h, &mut rng),
            attention: NeighborAttention::new(h, config.heads, config.negative_slope, &mut rng),
            residual_projection: Dense::new(h, h, &mut rng),
            refinement: Dense::new(h, h, &mut rng),
            gate_hidden: Dense::new(FEATURE_DIM + h, config.gate_hidden_dim, &mut rng),
            gate_output: Dense::new(config.gate_hidden_dim, h, &mut rng),
            status_projection: Dense::new(1, h, &mut rng),
            output_projection: Dense::new(h, OUTPUT_DIM, &mut rng),
            dropout: config.dropout,
        }
    }

    /// Zero tensors with the same shapes.
    pub fn zeros_like(&self) -> Self {
        let mut zeros = self.clone();
        for (_, t) in zeros.tensors_mut() {
            t.fill(0.0);
        }
        zeros
    }

    pub fn hidden_dim(&self) -> usize {
        self.feature_expansion.out_dim()
    }

    /// Every tensor tagged with its group, in a fixed order.
    pub fn tensors(&self) -> Vec<(ParamGroup, &Array2<f32>)> {
        use ParamGroup::*;
        vec![
            (FeatureExpansion, &self.feature_expansion.weight),
            (FeatureExpansion, &self.feature_expansion.bias),
            (Attention, &self.attention.projection),
            (Attention, &self.attention.att_src),
            (Attention, &self.attention.att_dst),
            (Attention, &self.attention.bias),
            (ResidualProjection, &self.residual_projection.weight),
            (ResidualProjection, &self.residual_projection.bias),
            (Refinement, &self.refinement.weight),
            (Refinement, &self.refinement.bias),
            (Gate, &self.gate_hidden.weight),
            (Gate, &self.gate_hidden.bias),
            (Gate, &self.gate_output.weight),
            (Gate, &self.gate_output.bias),
            (StatusProjection, &self.status_projection.weight),
            (StatusProjection, &self.status_projection.bias),
            (OutputProjection, &self.output_projection.weight),
            (OutputProjection, &self.output_projection.bias),
        ]
    }

    /// Mutable counterpart of [`tensors`](Self::tensors), same order.
    pub fn tensors_mut(&mut self) -> Vec<(ParamGroup, &mut Array2<f32>)> {
        use ParamGroup::*;
        vec![
            (FeatureExpansion, &mut self.feature_expansion.weight),
            (FeatureExpansion, &mut self.feature_expansion.bias),
            (Attention, &mut self.attention.projection),
            (Attention, &mut self.attention.att_src),
            (Attention, &mut self.attention.att_dst),
            (Attention, &mut self.attention.bias),
            (ResidualProjection, &mut self.residual_projection.weight),
            (ResidualProjection, &mut self.residual_projection.bias),
            (Refinement, &mut self.refinement.weight),
            (Refinement, &mut self.refinement.bias),
            (Gate, &mut self.gate_hidden.weight),
            (Gate, &mut self.gate_hidden.bias),
            (Gate, &mut self.gate_output.weight),
            (Gate, &mut self.gate_output.bias),
            (StatusProjection, &mut self.status_projection.weight),
            (StatusProjection, &mut self.status_projection.bias),
            (OutputProjection, &mut self.output_projection.weight),
            (OutputProjection, &mut self.output_projection.bias),
        ]
    }

    /// Whether every tensor of `group` is bit-for-bit equal in `other`.
    pub fn group_identical(&self, other: &Self, group: ParamGroup) -> bool {
        self.tensors()
            .into_iter()
            .zip(other.tensors())
            .filter(|((g, _), _)| *g == group)
            .all(|((_, a), (_, b))| {
                a.shape() == b.shape()
                    && a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits())
            })
    }

    /// Number of scalar parameters in `group`.
    pub fn group_len(&self, group: ParamGroup) -> usize {
        self.tensors()
            .into_iter()
            .filter(|(g, _)| *g == group)
            .map(|(_, t)| t.len())
            .sum()
    }

    /// Verify internal shape consistency, e.g. after loading an artifact.
    pub fn check_shapes(&self) -> Result<()> {
        let h = self.hidden_dim();
        let g = self.gate_hidden.out_dim();
        let heads = self.attention.heads();
        let expect = [
            ("feature_expansion", self.feature_expansion.weight.dim(), (FEATURE_DIM, h)),
            ("attention.projection", self.attention.projection.dim(), (h, h)),
            (
                "attention.att_dst",
                self.attention.att_dst.dim(),
                self.attention.att_src.dim(),
            ),
            ("residual_projection", self.residual_projection.weight.dim(), (h, h)),
            ("refinement", self.refinement.weight.dim(), (h, h)),
            ("gate_hidden", self.gate_hidden.weight.dim(), (FEATURE_DIM + h, g)),
            ("gate_output", self.gate_output.weight.dim(), (g, h)),
            ("status_projection", self.status_projection.weight.dim(), (1, h)),
            ("output_projection", self.output_projection.weight.dim(), (h, OUTPUT_DIM)),
        ];
        for (name, actual, expected) in expect {
            if actual != expected {
                return Err(CascadeError::dimension_mismatch(
                    format!("{name} {expected:?}"),
                    format!("{actual:?}"),
                ));
            }
        }
        if heads == 0 || heads * self.attention.head_dim() != h {
            return Err(CascadeError::dimension_mismatch(
                format!("{h} attention width"),
                format!("{heads} x {}", self.attention.head_dim()),
            ));
        }
        for (group, t) in self.tensors() {
            if t.iter().any(|v| !v.is_finite()) {
                return Err(CascadeError::artifact(format!(
                    "non-finite value in group {group}"
                )));
            }
        }
        Ok(())
    }
}

/// A graph with its message-passing topology and normalized features.
#[derive(Debug, Clone)]
pub struct PreparedGraph {
    pub topology: Topology,
    /// Normalized `N x 24` features.
    pub normalized: Array2<f32>,
    /// Failure severity `1 - status` from raw features, `N x 1`.
    pub severity: Array2<f32>,
    /// Raw status per node.
    pub status: Vec<f32>,
}

impl PreparedGraph {
    pub fn new(graph: &InfraGraph, normalizer: &FeatureNormalizer) -> Result<Self> {
        let raw = graph.feature_matrix();
        let normalized = normalizer.transform(&raw)?;
        let status: Vec<f32> = raw.column(STATUS_INDEX).to_vec();
        let severity = Array2::from_shape_fn((raw.nrows(), 1), |(i, _)| {
            (1.0 - status[i]).clamp(0.0, 1.0)
        });
        Ok(Self {
            topology: Topology::from_graph(graph),
            normalized,
            severity,
            status,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.normalized.nrows()
    }
}

/// Activations of one forward pass, kept for back-propagation.
#[derive(Debug, Clone)]
pub struct ForwardCache {
    z1: Array2<f32>,
    h1: Array2<f32>,
    mask1: Option<Array2<f32>>,
    attention: AttentionCache,
    z2: Array2<f32>,
    h2: Array2<f32>,
    mask2: Option<Array2<f32>>,
    z3: Array2<f32>,
    h3: Array2<f32>,
    mask3: Option<Array2<f32>>,
    gate_input: Array2<f32>,
    gate_pre: Array2<f32>,
    gate_hidden: Array2<f32>,
    gate: Array2<f32>,
    override_signal: Array2<f32>,
    blended: Array2<f32>,
    /// Output scores, `N x 12`.
    pub scores: Array2<f32>,
}

impl ForwardCache {
    /// Gate activations, `N x H`.
    pub fn gate(&self) -> &Array2<f32> {
        &self.gate
    }
}

fn dropout_mask(rng: &mut Option<&mut StdRng>, dim: (usize, usize), rate: f32) -> Option<Array2<f32>> {
    if rate <= 0.0 {
        return None;
    }
    let rng = rng.as_deref_mut()?;
    let keep = 1.0 / (1.0 - rate);
    Some(Array2::from_shape_fn(dim, |_| {
        if rng.gen::<f32>() < rate {
            0.0
        } else {
            keep
        }
    }))
}

fn apply_mask(mut x: Array2<f32>, mask: &Option<Array2<f32>>) -> Array2<f32> {
    if let Some(m) = mask {
        x *= m;
    }
    x
}

const BELOW_OUTPUT: [ParamGroup; 6] = [
    ParamGroup::FeatureExpansion,
    ParamGroup::Attention,
    ParamGroup::ResidualProjection,
    ParamGroup::Refinement,
    ParamGroup::Gate,
    ParamGroup::StatusProjection,
];

const TOPOLOGY_GROUPS: [ParamGroup; 4] = [
    ParamGroup::FeatureExpansion,
    ParamGroup::Attention,
    ParamGroup::ResidualProjection,
    ParamGroup::Refinement,
];

impl EncoderWeights {
    /// Forward pass keeping every activation.
    ///
    /// With `dropout_rng` set, dropout is sampled from it; otherwise the
    /// pass is deterministic.
    pub fn forward(
        &self,
        input: &PreparedGraph,
        mut dropout_rng: Option<&mut StdRng>,
    ) -> Result<ForwardCache> {
        let topo = &input.topology;
        let n = input.num_nodes();
        let h = self.hidden_dim();

        let z1 = self.feature_expansion.convolve(topo, &input.normalized)?;
        let mask1 = dropout_mask(&mut dropout_rng, (n, h), self.dropout);
        let h1 = apply_mask(relu(&z1), &mask1);

        let (attended, attention) = self.attention.forward(topo, &h1)?;
        let z2 = attended + &self.residual_projection.forward(&h1)?;
        let mask2 = dropout_mask(&mut dropout_rng, (n, h), self.dropout);
        let h2 = apply_mask(relu(&z2), &mask2);

        let z3 = self.refinement.convolve(topo, &h2)? + &h1;
        let mask3 = dropout_mask(&mut dropout_rng, (n, h), self.dropout);
        let h3 = apply_mask(relu(&z3), &mask3);

        let gate_input = concatenate(Axis(1), &[input.normalized.view(), h3.view()])
            .map_err(|e| CascadeError::dimension_mismatch(format!("{n} rows"), e.to_string()))?;
        let gate_pre = self.gate_hidden.forward(&gate_input)?;
        let gate_hidden = relu(&gate_pre);
        let gate = self.gate_output.forward(&gate_hidden)?.mapv(sigmoid);

        let override_signal = self.status_projection.forward(&input.severity)?;
        let blended = &gate * &override_signal + &gate.mapv(|g| 1.0 - g) * &h3;
        let scores = self.output_projection.forward(&blended)?;

        Ok(ForwardCache {
            z1,
            h1,
            mask1,
            attention,
            z2,
            h2,
            mask2,
            z3,
            h3,
            mask3,
            gate_input,
            gate_pre,
            gate_hidden,
            gate,
            override_signal,
            blended,
            scores,
        })
    }

    /// Gradients of a scalar loss given `dL/dS`.
    ///
    /// Only groups trainable under `mask` receive gradients; the others are
    /// left at zero, and back-propagation stops below the deepest trainable
    /// group.
    pub fn backward(
        &self,
        input: &PreparedGraph,
        cache: &ForwardCache,
        grad_scores: &Array2<f32>,
        mask: &ParameterMask,
    ) -> Result<EncoderWeights> {
        if grad_scores.dim() != cache.scores.dim() {
            return Err(CascadeError::dimension_mismatch(
                format!("{:?}", cache.scores.dim()),
                format!("{:?}", grad_scores.dim()),
            ));
        }
        let topo = &input.topology;
        let mut grads = self.zeros_like();

        let out = self.output_projection.backward(&cache.blended, grad_scores);
        if mask.is_trainable(ParamGroup::OutputProjection) {
            grads.output_projection.weight = out.weight;
            grads.output_projection.bias = out.bias;
        }
        if !mask.any_trainable(&BELOW_OUTPUT) {
            return Ok(grads);
        }

        // blend: Hb = G * O + (1 - G) * H3
        let grad_blended = out.input;
        let grad_gate = &grad_blended * &(&cache.override_signal - &cache.h3);
        let grad_override = &grad_blended * &cache.gate;
        let mut grad_h3 = &grad_blended * &cache.gate.mapv(|g| 1.0 - g);

        if mask.is_trainable(ParamGroup::StatusProjection) {
            let st = self.status_projection.backward(&input.severity, &grad_override);
            grads.status_projection.weight = st.weight;
            grads.status_projection.bias = st.bias;
        }

        let need_topology = mask.any_trainable(&TOPOLOGY_GROUPS);
        if mask.is_trainable(ParamGroup::Gate) || need_topology {
            let mut grad_gate_logit = grad_gate;
            grad_gate_logit.zip_mut_with(&cache.gate, |d, &g| *d *= g * (1.0 - g));
            let go = self.gate_output.backward(&cache.gate_hidden, &grad_gate_logit);
            let grad_gate_pre = relu_backward(&go.input, &cache.gate_pre);
            let gh = self.gate_hidden.backward(&cache.gate_input, &grad_gate_pre);
            if need_topology {
                grad_h3 += &gh.input.slice(s![.., FEATURE_DIM..]);
            }
            if mask.is_trainable(ParamGroup::Gate) {
                grads.gate_output.weight = go.weight;
                grads.gate_output.bias = go.bias;
                grads.gate_hidden.weight = gh.weight;
                grads.gate_hidden.bias = gh.bias;
            }
        }
        if !need_topology {
            return Ok(grads);
        }

        // refinement: H3 = relu(A (H2 W3) + b3 + H1)
        let grad_z3 = relu_backward(&apply_mask(grad_h3, &cache.mask3), &cache.z3);
        let rf = self.refinement.convolve_backward(topo, &cache.h2, &grad_z3);
        if mask.is_trainable(ParamGroup::Refinement) {
            grads.refinement.weight = rf.weight;
            grads.refinement.bias = rf.bias;
        }
        let upstream = [
            ParamGroup::FeatureExpansion,
            ParamGroup::Attention,
            ParamGroup::ResidualProjection,
        ];
        if !mask.any_trainable(&upstream) {
            return Ok(grads);
        }
        let mut grad_h1 = grad_z3;

        // H2 = relu(Att(H1) + H1 Wr + br)
        let grad_z2 = relu_backward(&apply_mask(rf.input, &cache.mask2), &cache.z2);
        let rp = self.residual_projection.backward(&cache.h1, &grad_z2);
        grad_h1 += &rp.input;
        if mask.is_trainable(ParamGroup::ResidualProjection) {
            grads.residual_projection.weight = rp.weight;
            grads.residual_projection.bias = rp.bias;
        }
        if !mask.any_trainable(&[ParamGroup::FeatureExpansion, ParamGroup::Attention]) {
            return Ok(grads);
        }
        let at = self
            .attention
            .backward(topo, &cache.h1, &cache.attention, &grad_z2);
        grad_h1 += &at.input;
        if mask.is_trainable(ParamGroup::Attention) {
            grads.attention.projection = at.projection;
            grads.attention.att_src = at.att_src;
            grads.attention.att_dst = at.att_dst;
            grads.attention.bias = at.bias;
        }
        if !mask.is_trainable(ParamGroup::FeatureExpansion) {
            return Ok(grads);
        }

        let grad_z1 = relu_backward(&apply_mask(grad_h1, &cache.mask1), &cache.z1);
        let fe = self
            .feature_expansion
            .convolve_backward(topo, &input.normalized, &grad_z1);
        grads.feature_expansion.weight = fe.weight;
        grads.feature_expansion.bias = fe.bias;
        Ok(grads)
    }
}

/// Inference front-end over one parameter snapshot.
///
/// Inference passes never apply dropout, so identical parameters and graphs
/// always produce identical outputs.
pub struct GraphEncoder<'a> {
    params: &'a ModelParameters,
}

impl<'a> GraphEncoder<'a> {
    pub fn new(params: &'a ModelParameters) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ModelParameters {
        self.params
    }

    pub fn prepare(&self, graph: &InfraGraph) -> Result<PreparedGraph> {
        PreparedGraph::new(graph, &self.params.normalizer)
    }

    /// Unnormalized scores, `N x 12`.
    pub fn scores(&self, graph: &InfraGraph) -> Result<Array2<f32>> {
        let prepared = self.prepare(graph)?;
        Ok(self.params.weights.forward(&prepared, None)?.scores)
    }

    /// Logistic of the scores, `N x 12`.
    pub fn probabilities(&self, graph: &InfraGraph) -> Result<Array2<f32>> {
        let prepared = self.prepare(graph)?;
        self.probabilities_prepared(&prepared)
    }

    pub fn probabilities_prepared(&self, prepared: &PreparedGraph) -> Result<Array2<f32>> {
        Ok(self
            .params
            .weights
            .forward(prepared, None)?
            .scores
            .mapv(sigmoid))
    }

    /// Gate activations, `N x H`.
    pub fn gate_values(&self, graph: &InfraGraph) -> Result<Array2<f32>> {
        let prepared = self.prepare(graph)?;
        Ok(self.params.weights.forward(&prepared, None)?.gate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, Node, NodeType, OperationalAttributes};
    use crate::params::Stage;
    use rand_distr::StandardNormal;

    pub(crate) fn small_config() -> EncoderConfig {
        EncoderConfig {
            hidden_dim: 8,
            heads: 2,
            gate_hidden_dim: 4,
            dropout: 0.0,
            ..Default::default()
        }
    }

    fn sample_graph() -> InfraGraph {
        let nodes = (0..5)
            .map(|i| {
                let mut attrs = OperationalAttributes::default();
                attrs.status = [0.9, 0.0, 0.6, 1.0, 0.3][i];
                attrs.capacity = 0.1 * i as f32 + 0.2;
                attrs.flow = 0.8 - 0.15 * i as f32;
                Node::new(i, NodeType::ALL[i * 2], attrs)
            })
            .collect();
        let edges = vec![
            Edge::weighted(0, 1, 0.8),
            Edge::weighted(1, 2, 0.5),
            Edge::weighted(2, 3, 1.0),
            Edge::weighted(1, 4, 0.3),
        ];
        InfraGraph::new(nodes, edges).unwrap()
    }

    fn params(config: &EncoderConfig) -> ModelParameters {
        ModelParameters::new(
            EncoderWeights::init(config),
            FeatureNormalizer::identity(),
            Stage::Pretrain,
        )
    }

    #[test]
    fn test_output_shape() {
        let params = params(&EncoderConfig::default());
        let graph = sample_graph();
        let probs = GraphEncoder::new(&params).probabilities(&graph).unwrap();
        assert_eq!(probs.dim(), (5, OUTPUT_DIM));
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_inference_is_deterministic() {
        let config = EncoderConfig::default();
        let params = params(&config);
        let graph = sample_graph();
        let encoder = GraphEncoder::new(&params);
        let a = encoder.probabilities(&graph).unwrap();
        let b = encoder.probabilities(&graph).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_init_is_seeded() {
        let config = small_config();
        assert_eq!(EncoderWeights::init(&config), EncoderWeights::init(&config));
        let other = EncoderConfig {
            seed: 99,
            ..small_config()
        };
        assert_ne!(EncoderWeights::init(&config), EncoderWeights::init(&other));
    }

    #[test]
    fn test_dropout_only_in_training() {
        let config = EncoderConfig {
            dropout: 0.5,
            ..small_config()
        };
        let params = params(&config);
        let prepared = PreparedGraph::new(&sample_graph(), &params.normalizer).unwrap();
        let plain = params.weights.forward(&prepared, None).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let dropped = params.weights.forward(&prepared, Some(&mut rng)).unwrap();
        assert_ne!(plain.scores, dropped.scores);
        assert!(plain.mask1.is_none());
    }

    #[test]
    fn test_check_shapes() {
        let mut weights = EncoderWeights::init(&small_config());
        assert!(weights.check_shapes().is_ok());
        weights.refinement.weight = Array2::zeros((8, 7));
        assert!(weights.check_shapes().is_err());
    }

    #[test]
    fn test_frozen_groups_get_no_gradient() {
        let params = params(&small_config());
        let prepared = PreparedGraph::new(&sample_graph(), &params.normalizer).unwrap();
        let cache = params.weights.forward(&prepared, None).unwrap();
        let grad_out = Array2::ones(cache.scores.dim());
        let mask = ParameterMask::only(&[ParamGroup::Gate]);
        let grads = params
            .weights
            .backward(&prepared, &cache, &grad_out, &mask)
            .unwrap();
        for (group, t) in grads.tensors() {
            if group != ParamGroup::Gate {
                assert!(t.iter().all(|&v| v == 0.0), "{group} has a gradient");
            }
        }
        assert!(grads.gate_output.bias.iter().any(|&v| v != 0.0));
    }

    /// Directional finite-difference check of every parameter group.
    #[test]
    fn test_gradients_match_finite_differences() {
        let config = small_config();
        let params = params(&config);
        let prepared = PreparedGraph::new(&sample_graph(), &params.normalizer).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let upstream = Array2::from_shape_fn((5, OUTPUT_DIM), |_| rng.sample::<f32, _>(StandardNormal));

        let objective = |w: &EncoderWeights| -> f32 {
            let cache = w.forward(&prepared, None).unwrap();
            (&cache.scores * &upstream).sum()
        };

        let cache = params.weights.forward(&prepared, None).unwrap();
        let grads = params
            .weights
            .backward(&prepared, &cache, &upstream, &ParameterMask::all_trainable())
            .unwrap();

        for group in ParamGroup::ALL {
            // random unit direction within the group
            let mut direction = params.weights.zeros_like();
            let mut norm_sq = 0.0;
            for (g, t) in direction.tensors_mut() {
                if g == group {
                    t.mapv_inplace(|_| rng.sample::<f32, _>(StandardNormal));
                    norm_sq += t.iter().map(|v| v * v).sum::<f32>();
                }
            }
            let norm = norm_sq.sqrt();
            for (_, t) in direction.tensors_mut() {
                t.mapv_inplace(|v| v / norm);
            }

            let analytic: f32 = grads
                .tensors()
                .into_iter()
                .zip(direction.tensors())
                .map(|((_, g), (_, d))| (g * d).sum())
                .sum();

            let eps = 1e-2;
            let shifted = |sign: f32| {
                let mut w = params.weights.clone();
                for ((_, t), (_, d)) in w.tensors_mut().into_iter().zip(direction.tensors()) {
                    t.scaled_add(sign * eps, d);
                }
                objective(&w)
            };
            let numeric = (shifted(1.0) - shifted(-1.0)) / (2.0 * eps);
            assert!(
                (numeric - analytic).abs() <= 0.05 * analytic.abs().max(numeric.abs()) + 2e-3,
                "{group}: numeric {numeric} analytic {analytic}"
            );
        }
    }
}

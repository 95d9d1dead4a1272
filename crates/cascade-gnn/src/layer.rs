//! Differentiable building blocks of the graph encoder.
//!
//! Every layer works on whole node matrices (`N x d`) and exposes an
//! explicit backward pass so that training can restrict updates to a
//! subset of parameter groups. Biases are stored as `1 x d` rows so the
//! optimizer treats every tensor uniformly.

use ndarray::{s, Array2, Axis};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{CascadeError, Result};
use crate::graph::Topology;

/// Xavier/Glorot normal initialization, `N(0, sqrt(2 / (fan_in + fan_out)))`.
pub fn xavier_normal<R: Rng + ?Sized>(fan_in: usize, fan_out: usize, rng: &mut R) -> Array2<f32> {
    let std_dev = (2.0 / (fan_in + fan_out).max(1) as f32).sqrt();
    Array2::from_shape_fn((fan_in, fan_out), |_| {
        let z: f32 = rng.sample(StandardNormal);
        z * std_dev
    })
}

/// Numerically stable logistic function.
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let ex = x.exp();
        ex / (1.0 + ex)
    }
}

pub fn relu(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| v.max(0.0))
}

/// `grad * 1[pre > 0]`
pub fn relu_backward(grad: &Array2<f32>, pre: &Array2<f32>) -> Array2<f32> {
    let mut out = grad.clone();
    out.zip_mut_with(pre, |g, &p| {
        if p <= 0.0 {
            *g = 0.0;
        }
    });
    out
}

pub fn leaky_relu(x: f32, slope: f32) -> f32 {
    if x > 0.0 {
        x
    } else {
        slope * x
    }
}

/// Sum over rows, kept as a `1 x d` row.
pub fn column_sums(x: &Array2<f32>) -> Array2<f32> {
    x.sum_axis(Axis(0)).insert_axis(Axis(0))
}

/// Fully connected layer `y = x W + b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    /// `in_dim x out_dim`
    pub weight: Array2<f32>,
    /// `1 x out_dim`
    pub bias: Array2<f32>,
}

/// Parameter gradients of a [`Dense`] layer plus the input gradient.
pub struct DenseGrad {
    pub weight: Array2<f32>,
    pub bias: Array2<f32>,
    pub input: Array2<f32>,
}

impl Dense {
    /// Xavier-initialized weights, zero bias.
    pub fn new<R: Rng + ?Sized>(in_dim: usize, out_dim: usize, rng: &mut R) -> Self {
        Self {
            weight: xavier_normal(in_dim, out_dim, rng),
            bias: Array2::zeros((1, out_dim)),
        }
    }

    pub fn in_dim(&self) -> usize {
        self.weight.nrows()
    }

    pub fn out_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn forward(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.in_dim() {
            return Err(CascadeError::dimension_mismatch(
                self.in_dim().to_string(),
                x.ncols().to_string(),
            ));
        }
        Ok(x.dot(&self.weight) + &self.bias)
    }

    /// Given the layer input and `dL/dy`, return all gradients.
    pub fn backward(&self, x: &Array2<f32>, grad_out: &Array2<f32>) -> DenseGrad {
        DenseGrad {
            weight: x.t().dot(grad_out),
            bias: column_sums(grad_out),
            input: grad_out.dot(&self.weight.t()),
        }
    }

    /// Graph convolution `A (x W) + b`.
    pub fn convolve(&self, topology: &Topology, x: &Array2<f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.in_dim() {
            return Err(CascadeError::dimension_mismatch(
                self.in_dim().to_string(),
                x.ncols().to_string(),
            ));
        }
        Ok(topology.aggregate(&x.dot(&self.weight)) + &self.bias)
    }

    /// Backward pass of [`convolve`](Self::convolve).
    pub fn convolve_backward(
        &self,
        topology: &Topology,
        x: &Array2<f32>,
        grad_out: &Array2<f32>,
    ) -> DenseGrad {
        let grad_xw = topology.aggregate_transpose(grad_out);
        DenseGrad {
            weight: x.t().dot(&grad_xw),
            bias: column_sums(grad_out),
            input: grad_xw.dot(&self.weight.t()),
        }
    }
}

/// Multi-head neighbor attention.
///
/// Node states are projected (`P = H W`), then every head scores each
/// incoming entry `j -> i` with one linear unit over the concatenated
/// (source, target) slices, `e = a_src . P_j + a_dst . P_i`. The score is
/// passed through a leaky rectifier and multiplied by the edge weight before
/// a softmax over `i`'s incoming entries. Heads are concatenated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborAttention {
    /// `dim x dim` projection, no bias.
    pub projection: Array2<f32>,
    /// `heads x head_dim`
    pub att_src: Array2<f32>,
    /// `heads x head_dim`
    pub att_dst: Array2<f32>,
    /// `1 x dim`
    pub bias: Array2<f32>,
    pub negative_slope: f32,
}

/// Activations kept from the attention forward pass.
#[derive(Debug, Clone)]
pub struct AttentionCache {
    projected: Array2<f32>,
    /// Pre-activation scores, `num_entries x heads`.
    raw: Array2<f32>,
    /// Softmax weights, `num_entries x heads`.
    alpha: Array2<f32>,
}

impl AttentionCache {
    /// Attention weights per incoming entry and head.
    pub fn alpha(&self) -> &Array2<f32> {
        &self.alpha
    }
}

/// Parameter gradients of [`NeighborAttention`] plus the input gradient.
pub struct AttentionGrad {
    pub projection: Array2<f32>,
    pub att_src: Array2<f32>,
    pub att_dst: Array2<f32>,
    pub bias: Array2<f32>,
    pub input: Array2<f32>,
}

impl NeighborAttention {
    pub fn new<R: Rng + ?Sized>(dim: usize, heads: usize, negative_slope: f32, rng: &mut R) -> Self {
        let head_dim = dim / heads.max(1);
        Self {
            projection: xavier_normal(dim, dim, rng),
            att_src: xavier_normal(heads, head_dim, rng),
            att_dst: xavier_normal(heads, head_dim, rng),
            bias: Array2::zeros((1, dim)),
            negative_slope,
        }
    }

    pub fn heads(&self) -> usize {
        self.att_src.nrows()
    }

    pub fn head_dim(&self) -> usize {
        self.att_src.ncols()
    }

    /// Per-head score of every node as source and as target.
    fn node_scores(&self, projected: &Array2<f32>) -> (Array2<f32>, Array2<f32>) {
        let n = projected.nrows();
        let (heads, hd) = (self.heads(), self.head_dim());
        let mut src = Array2::zeros((n, heads));
        let mut dst = Array2::zeros((n, heads));
        for h in 0..heads {
            let block = projected.slice(s![.., h * hd..(h + 1) * hd]);
            src.column_mut(h).assign(&block.dot(&self.att_src.row(h)));
            dst.column_mut(h).assign(&block.dot(&self.att_dst.row(h)));
        }
        (src, dst)
    }

    pub fn forward(
        &self,
        topology: &Topology,
        x: &Array2<f32>,
    ) -> Result<(Array2<f32>, AttentionCache)> {
        let dim = self.projection.nrows();
        if x.ncols() != dim {
            return Err(CascadeError::dimension_mismatch(
                dim.to_string(),
                x.ncols().to_string(),
            ));
        }
        let (heads, hd) = (self.heads(), self.head_dim());
        let projected = x.dot(&self.projection);
        let (src_score, dst_score) = self.node_scores(&projected);

        let entries = topology.num_entries();
        let mut raw = Array2::zeros((entries, heads));
        let mut alpha = Array2::zeros((entries, heads));
        let mut out = Array2::zeros((x.nrows(), dim));

        for i in 0..topology.num_nodes() {
            let range = topology.incoming(i);
            for h in 0..heads {
                let mut max = f32::NEG_INFINITY;
                for k in range.clone() {
                    let j = topology.source(k);
                    let e = src_score[[j, h]] + dst_score[[i, h]];
                    raw[[k, h]] = e;
                    let scaled = topology.weight(k) * leaky_relu(e, self.negative_slope);
                    alpha[[k, h]] = scaled;
                    max = max.max(scaled);
                }
                let mut sum = 0.0;
                for k in range.clone() {
                    let v = (alpha[[k, h]] - max).exp();
                    alpha[[k, h]] = v;
                    sum += v;
                }
                let sum = sum.max(1e-10);
                let mut out_block = out.slice_mut(s![i, h * hd..(h + 1) * hd]);
                for k in range.clone() {
                    alpha[[k, h]] /= sum;
                    let j = topology.source(k);
                    out_block.scaled_add(alpha[[k, h]], &projected.slice(s![j, h * hd..(h + 1) * hd]));
                }
            }
        }

        let out = out + &self.bias;
        Ok((
            out,
            AttentionCache {
                projected,
                raw,
                alpha,
            },
        ))
    }

    pub fn backward(
        &self,
        topology: &Topology,
        x: &Array2<f32>,
        cache: &AttentionCache,
        grad_out: &Array2<f32>,
    ) -> AttentionGrad {
        let (heads, hd) = (self.heads(), self.head_dim());
        let projected = &cache.projected;
        let n = projected.nrows();

        let mut grad_projected = Array2::<f32>::zeros(projected.dim());
        let mut grad_src_score = Array2::<f32>::zeros((n, heads));
        let mut grad_dst_score = Array2::<f32>::zeros((n, heads));

        for i in 0..topology.num_nodes() {
            let range = topology.incoming(i);
            for h in 0..heads {
                let cols = h * hd..(h + 1) * hd;
                let g_out = grad_out.slice(s![i, cols.clone()]);

                let mut grad_alpha = Vec::with_capacity(range.len());
                let mut weighted = 0.0;
                for k in range.clone() {
                    let j = topology.source(k);
                    let a = cache.alpha[[k, h]];
                    let ga = g_out.dot(&projected.slice(s![j, cols.clone()]));
                    grad_projected
                        .slice_mut(s![j, cols.clone()])
                        .scaled_add(a, &g_out);
                    weighted += a * ga;
                    grad_alpha.push(ga);
                }

                for (k, ga) in range.clone().zip(grad_alpha) {
                    let j = topology.source(k);
                    let a = cache.alpha[[k, h]];
                    let grad_scaled = a * (ga - weighted);
                    let slope = if cache.raw[[k, h]] > 0.0 {
                        1.0
                    } else {
                        self.negative_slope
                    };
                    let grad_raw = grad_scaled * topology.weight(k) * slope;
                    grad_src_score[[j, h]] += grad_raw;
                    grad_dst_score[[i, h]] += grad_raw;
                }
            }
        }

        let mut grad_att_src = Array2::zeros(self.att_src.dim());
        let mut grad_att_dst = Array2::zeros(self.att_dst.dim());
        for h in 0..heads {
            let cols = h * hd..(h + 1) * hd;
            let block = projected.slice(s![.., cols.clone()]);
            grad_att_src
                .row_mut(h)
                .assign(&block.t().dot(&grad_src_score.column(h)));
            grad_att_dst
                .row_mut(h)
                .assign(&block.t().dot(&grad_dst_score.column(h)));
            for node in 0..n {
                let gs = grad_src_score[[node, h]];
                let gd = grad_dst_score[[node, h]];
                let mut row = grad_projected.slice_mut(s![node, cols.clone()]);
                row.scaled_add(gs, &self.att_src.row(h));
                row.scaled_add(gd, &self.att_dst.row(h));
            }
        }

        AttentionGrad {
            projection: x.t().dot(&grad_projected),
            att_src: grad_att_src,
            att_dst: grad_att_dst,
            bias: column_sums(grad_out),
            input: grad_projected.dot(&self.projection.t()),
        }
    }
}

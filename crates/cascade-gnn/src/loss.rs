//! Loss functions on raw scores.
//!
//! All losses take unnormalized scores and compute the logistic internally
//! in a numerically stable form. Targets equal to the unknown sentinel
//! (`-1`) are skipped when masking is on, and the loss is averaged over the
//! positions that contribute.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{CascadeError, Result};
use crate::layer::sigmoid;

/// Loss variant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LossType {
    /// Binary cross-entropy on logits.
    BinaryCrossEntropy,
    /// Focal loss: `alpha * (1 - pt)^gamma * bce`.
    Focal { gamma: f32, alpha: f32 },
}

/// Full loss specification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossSpec {
    pub loss_type: LossType,
    /// Weight on the positive term of the cross-entropy.
    pub pos_weight: f32,
    /// Skip positions whose target is negative (unknown).
    pub mask_unknown: bool,
    /// `(threshold, multiplier)`: nodes whose mean target exceeds the
    /// threshold have their loss multiplied.
    pub critical: Option<(f32, f32)>,
}

impl LossSpec {
    /// Pretraining loss: dense BCE with critical-node up-weighting.
    pub fn pretraining(critical_threshold: f32, critical_weight: f32) -> Self {
        Self {
            loss_type: LossType::BinaryCrossEntropy,
            pos_weight: 1.0,
            mask_unknown: false,
            critical: Some((critical_threshold, critical_weight)),
        }
    }

    /// Masked, positive-weighted BCE used on partially labeled incidents.
    pub fn masked(pos_weight: f32) -> Self {
        Self {
            loss_type: LossType::BinaryCrossEntropy,
            pos_weight,
            mask_unknown: true,
            critical: None,
        }
    }

    /// Masked focal loss.
    pub fn masked_focal(pos_weight: f32, gamma: f32, alpha: f32) -> Self {
        Self {
            loss_type: LossType::Focal { gamma, alpha },
            pos_weight,
            mask_unknown: true,
            critical: None,
        }
    }
}

/// Loss value and its gradient with respect to the scores.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub value: f32,
    pub grad: Array2<f32>,
    /// Number of positions that contributed.
    pub count: usize,
}

/// `log(1 + exp(x))` without overflow.
fn softplus(x: f32) -> f32 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

/// Weighted BCE on one logit and its derivative.
///
/// `l = p * y * softplus(-s) + (1 - y) * softplus(s)`
fn weighted_bce(score: f32, target: f32, pos_weight: f32) -> (f32, f32) {
    let loss = pos_weight * target * softplus(-score) + (1.0 - target) * softplus(score);
    let sig = sigmoid(score);
    let grad = (1.0 - target) * sig - pos_weight * target * (1.0 - sig);
    (loss, grad)
}

/// Focal modulation of the weighted BCE and its derivative.
fn focal(score: f32, target: f32, pos_weight: f32, gamma: f32, alpha: f32) -> (f32, f32) {
    let (bce, bce_grad) = weighted_bce(score, target, pos_weight);
    let pt = (-bce).exp();
    let one_minus = 1.0 - pt;
    if one_minus <= 0.0 {
        return (0.0, 0.0);
    }
    let modulator = one_minus.powf(gamma);
    let loss = alpha * modulator * bce;
    // d/ds [(1 - e^-b)^g * b] = b' [(1 - pt)^g + g (1 - pt)^(g-1) pt b]
    let dmod = if gamma > 0.0 {
        gamma * one_minus.powf(gamma - 1.0) * pt * bce
    } else {
        0.0
    };
    (loss, alpha * bce_grad * (modulator + dmod))
}

/// Loss function implementations on logits.
pub struct Loss;

impl Loss {
    /// Compute loss and gradient.
    ///
    /// # Errors
    /// `DimensionMismatch` on shape disagreement, `InputError` when nothing
    /// contributes (no known targets).
    pub fn compute(spec: &LossSpec, scores: &Array2<f32>, targets: &Array2<f32>) -> Result<LossOutput> {
        if scores.shape() != targets.shape() {
            return Err(CascadeError::dimension_mismatch(
                format!("{:?}", scores.shape()),
                format!("{:?}", targets.shape()),
            ));
        }

        let mut grad = Array2::zeros(scores.dim());
        let mut total = 0.0f64;
        let mut count = 0usize;

        for (i, (s_row, t_row)) in scores.rows().into_iter().zip(targets.rows()).enumerate() {
            let node_weight = match spec.critical {
                Some((threshold, weight)) => {
                    let known: Vec<f32> = t_row.iter().copied().filter(|&t| t >= 0.0).collect();
                    let mean = known.iter().sum::<f32>() / known.len().max(1) as f32;
                    if !known.is_empty() && mean > threshold {
                        weight
                    } else {
                        1.0
                    }
                }
                None => 1.0,
            };

            for (j, (&s, &t)) in s_row.iter().zip(t_row.iter()).enumerate() {
                if spec.mask_unknown && t < 0.0 {
                    continue;
                }
                let t = t.clamp(0.0, 1.0);
                let (l, g) = match spec.loss_type {
                    LossType::BinaryCrossEntropy => weighted_bce(s, t, spec.pos_weight),
                    LossType::Focal { gamma, alpha } => focal(s, t, spec.pos_weight, gamma, alpha),
                };
                total += (node_weight * l) as f64;
                grad[[i, j]] = node_weight * g;
                count += 1;
            }
        }

        if count == 0 {
            return Err(CascadeError::input("no labeled positions contribute to the loss"));
        }
        let n = count as f32;
        grad.mapv_inplace(|g| g / n);
        Ok(LossOutput {
            value: (total / count as f64) as f32,
            grad,
            count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn arr(rows: usize, cols: usize, v: Vec<f32>) -> Array2<f32> {
        Array2::from_shape_vec((rows, cols), v).unwrap()
    }

    #[test]
    fn test_bce_matches_reference() {
        let scores = arr(1, 2, vec![0.0, 2.0]);
        let targets = arr(1, 2, vec![1.0, 0.0]);
        let out = Loss::compute(&LossSpec::masked(1.0), &scores, &targets).unwrap();
        let expected = ((2.0f32).ln() + (1.0 + 2.0f32.exp()).ln()) / 2.0;
        assert_relative_eq!(out.value, expected, epsilon = 1e-5);
        assert_relative_eq!(out.grad[[0, 0]], (0.5 - 1.0) / 2.0, epsilon = 1e-6);
        assert_relative_eq!(out.grad[[0, 1]], sigmoid(2.0) / 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_masking_skips_unknown() {
        let scores = arr(2, 2, vec![0.3, -1.0, 5.0, 5.0]);
        let targets = arr(2, 2, vec![1.0, -1.0, -1.0, -1.0]);
        let out = Loss::compute(&LossSpec::masked(5.0), &scores, &targets).unwrap();
        assert_eq!(out.count, 1);
        assert_eq!(out.grad[[0, 1]], 0.0);
        assert_eq!(out.grad[[1, 0]], 0.0);
        assert!(out.grad[[0, 0]] < 0.0);
    }

    #[test]
    fn test_all_unknown_is_error() {
        let scores = arr(1, 2, vec![0.0, 0.0]);
        let targets = arr(1, 2, vec![-1.0, -1.0]);
        assert!(Loss::compute(&LossSpec::masked(1.0), &scores, &targets).is_err());
    }

    #[test]
    fn test_pos_weight_scales_positive_term() {
        let scores = arr(1, 1, vec![-1.0]);
        let targets = arr(1, 1, vec![1.0]);
        let a = Loss::compute(&LossSpec::masked(1.0), &scores, &targets).unwrap();
        let b = Loss::compute(&LossSpec::masked(5.0), &scores, &targets).unwrap();
        assert_relative_eq!(b.value, 5.0 * a.value, epsilon = 1e-5);
    }

    #[test]
    fn test_critical_weighting() {
        let scores = arr(2, 2, vec![0.0, 0.0, 0.0, 0.0]);
        let targets = arr(2, 2, vec![0.9, 0.8, 0.9, 0.8]);
        let plain = Loss::compute(&LossSpec::pretraining(0.5, 1.0), &scores, &targets).unwrap();
        let weighted = Loss::compute(&LossSpec::pretraining(0.5, 3.0), &scores, &targets).unwrap();
        assert_relative_eq!(weighted.value, 3.0 * plain.value, epsilon = 1e-5);

        let low = arr(2, 2, vec![0.1, 0.2, 0.1, 0.2]);
        let plain = Loss::compute(&LossSpec::pretraining(0.5, 1.0), &scores, &low).unwrap();
        let weighted = Loss::compute(&LossSpec::pretraining(0.5, 3.0), &scores, &low).unwrap();
        assert_relative_eq!(weighted.value, plain.value, epsilon = 1e-6);
    }

    #[test]
    fn test_focal_gradient_finite_difference() {
        let spec = LossSpec::masked_focal(5.0, 2.0, 0.25);
        for (s, t) in [(-2.0f32, 1.0f32), (0.5, 0.0), (1.5, 1.0), (-0.3, 0.4)] {
            let targets = arr(1, 1, vec![t]);
            let out = Loss::compute(&spec, &arr(1, 1, vec![s]), &targets).unwrap();
            let eps = 1e-3;
            let plus = Loss::compute(&spec, &arr(1, 1, vec![s + eps]), &targets).unwrap();
            let minus = Loss::compute(&spec, &arr(1, 1, vec![s - eps]), &targets).unwrap();
            let numeric = (plus.value - minus.value) / (2.0 * eps);
            assert_relative_eq!(out.grad[[0, 0]], numeric, epsilon = 2e-3, max_relative = 0.02);
        }
    }

    #[test]
    fn test_focal_downweights_easy_examples() {
        let targets = arr(1, 1, vec![0.0]);
        let easy = arr(1, 1, vec![-6.0]);
        let bce = Loss::compute(&LossSpec::masked(1.0), &easy, &targets).unwrap();
        let focal = Loss::compute(&LossSpec::masked_focal(1.0, 2.0, 0.25), &easy, &targets).unwrap();
        assert!(focal.value < bce.value * 0.01);
    }

    #[test]
    fn test_extreme_scores_finite() {
        let scores = arr(1, 2, vec![80.0, -80.0]);
        let targets = arr(1, 2, vec![0.0, 1.0]);
        let out = Loss::compute(&LossSpec::masked(5.0), &scores, &targets).unwrap();
        assert!(out.value.is_finite());
        assert!(out.grad.iter().all(|g| g.is_finite()));
    }

    #[test]
    fn test_shape_mismatch() {
        let err = Loss::compute(&LossSpec::masked(1.0), &Array2::zeros((2, 2)), &Array2::zeros((2, 3)))
            .unwrap_err();
        assert!(matches!(err, CascadeError::DimensionMismatch { .. }));
    }
}

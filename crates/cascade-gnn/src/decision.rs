//! Threshold decisions on impact probabilities.
//!
//! Pure functions of `(probabilities, threshold)`. Nothing here feeds back
//! into training; the threshold only changes which nodes raise an alert.

use std::fmt;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{CascadeError, Result};

/// Threshold used when a caller does not supply one.
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Reject thresholds outside the open interval (0, 1).
pub fn check_threshold(threshold: f32) -> Result<()> {
    if threshold > 0.0 && threshold < 1.0 {
        Ok(())
    } else {
        Err(CascadeError::input(format!(
            "threshold {threshold} must lie strictly between 0 and 1"
        )))
    }
}

/// Alert flag per probability: `p >= threshold`.
pub fn alerts(probabilities: &[f32], threshold: f32) -> Result<Vec<bool>> {
    check_threshold(threshold)?;
    Ok(probabilities.iter().map(|&p| p >= threshold).collect())
}

/// Alert flags for every output dimension of an `N x D` matrix.
pub fn alert_matrix(probabilities: &Array2<f32>, threshold: f32) -> Result<Array2<bool>> {
    check_threshold(threshold)?;
    Ok(probabilities.mapv(|p| p >= threshold))
}

/// Four-level summary of the worst node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_probability(p: f32) -> Self {
        if p >= 0.7 {
            RiskLevel::Critical
        } else if p >= 0.5 {
            RiskLevel::High
        } else if p >= 0.3 {
            RiskLevel::Moderate
        } else {
            RiskLevel::Low
        }
    }

    /// Level of the largest probability; `Low` for an empty slice.
    pub fn from_max(probabilities: &[f32]) -> Self {
        let max = probabilities.iter().copied().fold(0.0f32, f32::max);
        Self::from_probability(max)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Moderate => "moderate",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alerts and risk level for one probability vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub threshold: f32,
    pub alerts: Vec<bool>,
    pub risk: RiskLevel,
}

impl Decision {
    pub fn new(probabilities: &[f32], threshold: f32) -> Result<Self> {
        Ok(Self {
            threshold,
            alerts: alerts(probabilities, threshold)?,
            risk: RiskLevel::from_max(probabilities),
        })
    }

    pub fn alert_count(&self) -> usize {
        self.alerts.iter().filter(|&&a| a).count()
    }
}

/// Decision on dimension 0 of an `N x D` probability matrix.
pub fn decide(probabilities: &Array2<f32>, threshold: f32) -> Result<Decision> {
    let column = probabilities.column(0).to_vec();
    Decision::new(&column, threshold)
}

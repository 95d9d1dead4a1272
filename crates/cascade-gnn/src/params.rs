//! Parameter groups, trainability masks and the versioned parameter bundle.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::encoder::EncoderWeights;
use crate::error::{CascadeError, Result};
use crate::normalize::FeatureNormalizer;

/// Named subsets of encoder parameters that are frozen or trained together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamGroup {
    /// First graph convolution, 24 -> hidden.
    FeatureExpansion,
    /// Multi-head neighbor attention.
    Attention,
    /// Re-projection of the first layer output merged into the attention output.
    ResidualProjection,
    /// Second graph convolution.
    Refinement,
    /// Two-layer gating perceptron.
    Gate,
    /// Projection of node failure severity into the override signal.
    StatusProjection,
    /// Final hidden -> 12 projection.
    OutputProjection,
}

impl ParamGroup {
    pub const ALL: [ParamGroup; 7] = [
        ParamGroup::FeatureExpansion,
        ParamGroup::Attention,
        ParamGroup::ResidualProjection,
        ParamGroup::Refinement,
        ParamGroup::Gate,
        ParamGroup::StatusProjection,
        ParamGroup::OutputProjection,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ParamGroup::FeatureExpansion => "feature_expansion",
            ParamGroup::Attention => "attention",
            ParamGroup::ResidualProjection => "residual_projection",
            ParamGroup::Refinement => "refinement",
            ParamGroup::Gate => "gate",
            ParamGroup::StatusProjection => "status_projection",
            ParamGroup::OutputProjection => "output_projection",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ParamGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ParamGroup {
    type Err = CascadeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|g| g.name() == s.trim())
            .ok_or_else(|| CascadeError::config(format!("unknown parameter group '{s}'")))
    }
}

/// Per-group trainability flags consumed by the optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterMask {
    trainable: [bool; 7],
}

impl ParameterMask {
    pub fn all_trainable() -> Self {
        Self {
            trainable: [true; 7],
        }
    }

    pub fn all_frozen() -> Self {
        Self {
            trainable: [false; 7],
        }
    }

    /// Only the listed groups are trainable.
    pub fn only(groups: &[ParamGroup]) -> Self {
        let mut mask = Self::all_frozen();
        for &g in groups {
            mask.trainable[g.slot()] = true;
        }
        mask
    }

    pub fn freeze(mut self, group: ParamGroup) -> Self {
        self.trainable[group.slot()] = false;
        self
    }

    pub fn unfreeze(mut self, group: ParamGroup) -> Self {
        self.trainable[group.slot()] = true;
        self
    }

    pub fn is_trainable(&self, group: ParamGroup) -> bool {
        self.trainable[group.slot()]
    }

    pub fn any_trainable(&self, groups: &[ParamGroup]) -> bool {
        groups.iter().any(|&g| self.is_trainable(g))
    }

    pub fn trainable_groups(&self) -> BTreeSet<ParamGroup> {
        ParamGroup::ALL
            .iter()
            .copied()
            .filter(|&g| self.is_trainable(g))
            .collect()
    }

    pub fn frozen_groups(&self) -> BTreeSet<ParamGroup> {
        ParamGroup::ALL
            .iter()
            .copied()
            .filter(|&g| !self.is_trainable(g))
            .collect()
    }
}

/// Training stage that produced a parameter version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pretrain,
    Transfer,
    GateRetrain,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Pretrain => "pretrain",
            Stage::Transfer => "transfer",
            Stage::GateRetrain => "gate_retrain",
        };
        f.write_str(name)
    }
}

/// Format tag written into every artifact.
pub const FORMAT_TAG: &str = "cascade-gnn/params";
/// Current artifact layout version.
pub const FORMAT_VERSION: u32 = 1;

/// A complete, self-describing set of encoder parameters.
///
/// Bundles are treated as immutable once handed to the registry; training
/// works on a clone and the registry swaps the reference on promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub format: String,
    pub format_version: u32,
    /// Registry version; 0 until published.
    pub version: u64,
    /// Version this bundle was derived from.
    pub parent_version: Option<u64>,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    pub weights: EncoderWeights,
    pub normalizer: FeatureNormalizer,
}

impl ModelParameters {
    pub fn new(weights: EncoderWeights, normalizer: FeatureNormalizer, stage: Stage) -> Self {
        Self {
            format: FORMAT_TAG.to_string(),
            format_version: FORMAT_VERSION,
            version: 0,
            parent_version: None,
            stage,
            created_at: Utc::now(),
            weights,
            normalizer,
        }
    }

    /// Unpublished copy to be trained, remembering its parent version.
    pub fn derive(&self, stage: Stage) -> Self {
        let mut child = self.clone();
        child.version = 0;
        child.parent_version = Some(self.version);
        child.stage = stage;
        child.created_at = Utc::now();
        child
    }

    /// Encode as a `bincode` artifact.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CascadeError::artifact(format!("encode failed: {e}")))
    }

    /// Decode an artifact and check its format tag.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (params, _): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| CascadeError::artifact(format!("decode failed: {e}")))?;
        params.check_format()?;
        Ok(params)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::from_bytes(&bytes)
    }

    fn check_format(&self) -> Result<()> {
        if self.format != FORMAT_TAG {
            return Err(CascadeError::artifact(format!(
                "unexpected format tag '{}'",
                self.format
            )));
        }
        if self.format_version != FORMAT_VERSION {
            return Err(CascadeError::artifact(format!(
                "unsupported format version {} (expected {FORMAT_VERSION})",
                self.format_version
            )));
        }
        self.weights.check_shapes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderConfig;

    fn small_params() -> ModelParameters {
        let cfg = EncoderConfig {
            hidden_dim: 8,
            heads: 2,
            gate_hidden_dim: 4,
            ..Default::default()
        };
        ModelParameters::new(
            EncoderWeights::init(&cfg),
            FeatureNormalizer::identity(),
            Stage::Pretrain,
        )
    }

    #[test]
    fn test_group_names_roundtrip() {
        for g in ParamGroup::ALL {
            assert_eq!(g.name().parse::<ParamGroup>().unwrap(), g);
        }
        let json = serde_json::to_string(&ParamGroup::ResidualProjection).unwrap();
        assert_eq!(json, "\"residual_projection\"");
    }

    #[test]
    fn test_mask_sets() {
        let mask = ParameterMask::only(&[ParamGroup::Gate, ParamGroup::OutputProjection]);
        assert!(mask.is_trainable(ParamGroup::Gate));
        assert!(!mask.is_trainable(ParamGroup::Attention));
        assert_eq!(mask.trainable_groups().len(), 2);
        assert_eq!(mask.frozen_groups().len(), 5);

        let mask = ParameterMask::all_trainable().freeze(ParamGroup::FeatureExpansion);
        assert_eq!(
            mask.frozen_groups().into_iter().collect::<Vec<_>>(),
            vec![ParamGroup::FeatureExpansion]
        );
    }

    #[test]
    fn test_artifact_roundtrip_file() {
        let params = small_params();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        params.save(&path).unwrap();
        let loaded = ModelParameters::load(&path).unwrap();
        assert_eq!(loaded, params);
    }

    #[test]
    fn test_foreign_tag_rejected() {
        let mut params = small_params();
        params.format = "something-else".into();
        let bytes = params.to_bytes().unwrap();
        let err = ModelParameters::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, CascadeError::Artifact(_)));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(ModelParameters::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_derive_tracks_parent() {
        let mut params = small_params();
        params.version = 4;
        let child = params.derive(Stage::GateRetrain);
        assert_eq!(child.version, 0);
        assert_eq!(child.parent_version, Some(4));
        assert_eq!(child.weights, params.weights);
    }
}

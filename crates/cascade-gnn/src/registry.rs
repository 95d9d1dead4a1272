//! Versioned parameter store with an atomically swappable production slot.
//!
//! Readers clone the production `Arc` and keep a consistent snapshot for as
//! long as they hold it, even while a promotion swaps the slot. Superseded
//! versions stay in the history and can be restored with
//! [`ModelRegistry::rollback`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{CascadeError, Result};
use crate::incident::IncidentSummary;
use crate::params::{ModelParameters, ParamGroup, Stage};

/// How a training run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunDecision {
    Promoted,
    Rejected,
    /// Stopped by an error before validation.
    Aborted,
}

/// Audit entry for one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRunRecord {
    pub run_id: Uuid,
    pub stage: Stage,
    pub base_version: u64,
    pub dataset: IncidentSummary,
    pub frozen_groups: Vec<ParamGroup>,
    pub metrics: BTreeMap<String, f32>,
    pub decision: RunDecision,
    pub promoted_version: Option<u64>,
    /// Production version left in place after a rejection.
    pub rollback_to: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TrainingRunRecord {
    /// Open a record for a run starting now.
    pub fn start(stage: Stage, base_version: u64, dataset: IncidentSummary) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            stage,
            base_version,
            dataset,
            frozen_groups: Vec::new(),
            metrics: BTreeMap::new(),
            decision: RunDecision::Aborted,
            promoted_version: None,
            rollback_to: None,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn finish(mut self, decision: RunDecision) -> Self {
        self.decision = decision;
        self.finished_at = Utc::now();
        self
    }
}

struct RegistryState {
    production: Arc<ModelParameters>,
    versions: BTreeMap<u64, Arc<ModelParameters>>,
    /// Previously active versions, most recent last.
    previous: Vec<u64>,
    records: Vec<TrainingRunRecord>,
}

/// Holds every published parameter version and the production pointer.
pub struct ModelRegistry {
    state: RwLock<RegistryState>,
}

impl ModelRegistry {
    /// Publish `initial` as production. Unpublished bundles become version 1.
    pub fn new(mut initial: ModelParameters) -> Self {
        if initial.version == 0 {
            initial.version = 1;
        }
        let version = initial.version;
        let production = Arc::new(initial);
        let mut versions = BTreeMap::new();
        versions.insert(version, Arc::clone(&production));
        info!(version, "registry initialized");
        Self {
            state: RwLock::new(RegistryState {
                production,
                versions,
                previous: Vec::new(),
                records: Vec::new(),
            }),
        }
    }

    /// Snapshot of the current production parameters.
    pub fn production(&self) -> Arc<ModelParameters> {
        Arc::clone(&self.state.read().production)
    }

    pub fn production_version(&self) -> u64 {
        self.state.read().production.version
    }

    pub fn latest_version(&self) -> u64 {
        self.state
            .read()
            .versions
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }

    /// Assign the next version number to `candidate` and make it production.
    pub fn promote(&self, mut candidate: ModelParameters) -> Arc<ModelParameters> {
        let mut state = self.state.write();
        let next = state.versions.keys().next_back().copied().unwrap_or(0) + 1;
        candidate.version = next;
        let promoted = Arc::new(candidate);
        let old = state.production.version;
        state.previous.push(old);
        state.versions.insert(next, Arc::clone(&promoted));
        state.production = Arc::clone(&promoted);
        info!(from = old, to = next, stage = %promoted.stage, "promoted parameters");
        promoted
    }

    /// Restore the previously active production version.
    pub fn rollback(&self) -> Result<Arc<ModelParameters>> {
        let mut state = self.state.write();
        let target = state
            .previous
            .pop()
            .ok_or_else(|| CascadeError::input("no previous version to roll back to"))?;
        let restored = state
            .versions
            .get(&target)
            .cloned()
            .ok_or_else(|| CascadeError::artifact(format!("version {target} missing")))?;
        let from = state.production.version;
        state.production = Arc::clone(&restored);
        info!(from, to = target, "rolled back production");
        Ok(restored)
    }

    pub fn version(&self, version: u64) -> Option<Arc<ModelParameters>> {
        self.state.read().versions.get(&version).cloned()
    }

    /// All published versions in ascending order.
    pub fn history(&self) -> Vec<Arc<ModelParameters>> {
        self.state.read().versions.values().cloned().collect()
    }

    pub fn record(&self, record: TrainingRunRecord) {
        self.state.write().records.push(record);
    }

    pub fn records(&self) -> Vec<TrainingRunRecord> {
        self.state.read().records.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderConfig;
    use crate::encoder::EncoderWeights;
    use crate::normalize::FeatureNormalizer;

    fn params(seed: u64) -> ModelParameters {
        let cfg = EncoderConfig {
            hidden_dim: 4,
            heads: 1,
            gate_hidden_dim: 2,
            seed,
            ..Default::default()
        };
        ModelParameters::new(
            EncoderWeights::init(&cfg),
            FeatureNormalizer::identity(),
            Stage::Pretrain,
        )
    }

    #[test]
    fn test_promote_and_rollback() {
        let registry = ModelRegistry::new(params(1));
        assert_eq!(registry.production_version(), 1);

        let base = registry.production();
        let child = base.derive(Stage::GateRetrain);
        let promoted = registry.promote(child);
        assert_eq!(promoted.version, 2);
        assert_eq!(promoted.parent_version, Some(1));
        assert_eq!(registry.production_version(), 2);

        // the old snapshot is still intact for its holder
        assert_eq!(base.version, 1);

        let restored = registry.rollback().unwrap();
        assert_eq!(restored.version, 1);
        assert!(Arc::ptr_eq(&restored, &base));
        assert_eq!(registry.history().len(), 2);
        assert!(registry.rollback().is_err());
    }

    #[test]
    fn test_versions_never_reused() {
        let registry = ModelRegistry::new(params(1));
        registry.promote(params(2));
        registry.rollback().unwrap();
        let third = registry.promote(params(3));
        assert_eq!(third.version, 3);
        assert_eq!(registry.latest_version(), 3);
        assert!(registry.version(2).is_some());
    }

    #[test]
    fn test_concurrent_readers_see_whole_snapshots() {
        let registry = ModelRegistry::new(params(1));
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..100 {
                        let snap = registry.production();
                        assert!(snap.weights.check_shapes().is_ok());
                        assert!(registry.version(snap.version).is_some());
                    }
                });
            }
            s.spawn(|| {
                for seed in 2..20 {
                    registry.promote(params(seed));
                }
            });
        });
        assert_eq!(registry.production_version(), 19);
    }

    #[test]
    fn test_run_records_append() {
        let registry = ModelRegistry::new(params(1));
        let mut rec = TrainingRunRecord::start(Stage::GateRetrain, 1, IncidentSummary::default());
        rec.metrics.insert("crossing_rate".into(), 0.6);
        registry.record(rec.finish(RunDecision::Rejected));
        let records = registry.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].decision, RunDecision::Rejected);
        assert!(records[0].finished_at >= records[0].started_at);
    }
}

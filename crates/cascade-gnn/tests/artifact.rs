//! Parameter artifacts and the pretrain -> fine-tune -> serve path.
use std::sync::Arc;

use cascade_gnn::config::{EncoderConfig, PretrainConfig, TransferConfig};
use cascade_gnn::encoder::GraphEncoder;
use cascade_gnn::error::CascadeError;
use cascade_gnn::incident::{load_incidents, parse_incidents, save_incidents};
use cascade_gnn::params::{ModelParameters, ParamGroup, Stage};
use cascade_gnn::pretrain::TrainingOrchestrator;
use cascade_gnn::registry::ModelRegistry;
use cascade_gnn::synthetic::{SyntheticConfig, SyntheticGenerator};
use cascade_gnn::transfer::{self, TransferAdapter};
use tempfile::tempdir;

const INCIDENTS: &str = r#"[
    {
        "id": "substation-fire",
        "nodes": [
            {"id": 0, "type": "Power", "status": 0.0, "impacted": 1.0},
            {"id": 1, "type": "Hospital", "impacted": 0.6},
            {"id": 2, "type": "Road", "impacted": 0.0},
            {"id": 3, "type": "Building"}
        ],
        "edges": [
            {"source": 0, "target": 1},
            {"source": 1, "target": 2},
            {"source": 2, "target": 3}
        ]
    },
    {
        "id": "main-break",
        "nodes": [
            {"id": 10, "type": "Pipe", "status": 0.1, "impacted": 1.0},
            {"id": 11, "type": "Pump", "impacted": 0.4},
            {"id": 12, "type": "Tank", "impacted": 0.0}
        ],
        "edges": [
            {"source": 10, "target": 11, "weight": 0.8},
            {"source": 11, "target": 12}
        ]
    }
]"#;

fn small_encoder() -> EncoderConfig {
    EncoderConfig {
        hidden_dim: 16,
        heads: 4,
        gate_hidden_dim: 8,
        ..Default::default()
    }
}

fn pretrained() -> ModelParameters {
    let mut gen = SyntheticGenerator::new(SyntheticConfig {
        max_nodes: 12,
        ..Default::default()
    })
    .unwrap();
    let config = PretrainConfig {
        epochs: 2,
        batch_size: 4,
        learning_rate: 1e-2,
        min_samples: 10,
        ..Default::default()
    };
    let orchestrator = TrainingOrchestrator::new(small_encoder(), config).unwrap();
    orchestrator.pretrain_from_source(&mut gen, 12).unwrap().0
}

#[test]
fn test_saved_parameters_reproduce_scores() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("model.bin");
    let params = pretrained();
    params.save(&path).unwrap();
    let loaded = ModelParameters::load(&path).unwrap();
    assert_eq!(loaded, params);

    let incidents = parse_incidents(INCIDENTS).unwrap();
    for incident in &incidents {
        let a = GraphEncoder::new(&params).scores(&incident.graph).unwrap();
        let b = GraphEncoder::new(&loaded).scores(&incident.graph).unwrap();
        assert_eq!(a, b);
    }
}

#[test]
fn test_foreign_artifacts_rejected() {
    let mut params = pretrained();
    params.format = "something-else".to_string();
    let bytes = params.to_bytes().unwrap();
    assert!(matches!(
        ModelParameters::from_bytes(&bytes),
        Err(CascadeError::Artifact(_))
    ));

    let good = pretrained().to_bytes().unwrap();
    assert!(ModelParameters::from_bytes(&good[..good.len() / 2]).is_err());
}

#[test]
fn test_fine_tune_then_promote() {
    let base = pretrained();
    let registry = Arc::new(ModelRegistry::new(base));
    let incidents = parse_incidents(INCIDENTS).unwrap();

    let adapter = TransferAdapter::new(TransferConfig {
        epochs: 10,
        learning_rate: 1e-3,
        ..Default::default()
    })
    .unwrap();
    let production = registry.production();
    let (candidate, report) = adapter.fine_tune(&production, &incidents).unwrap();

    assert_eq!(report.base_version, 1);
    assert_eq!(report.incidents, 2);
    assert_eq!(report.labeled_nodes, 6);
    assert_eq!(report.epochs.len(), 10);
    assert_eq!(report.frozen_groups, vec![ParamGroup::FeatureExpansion]);
    assert!(candidate
        .weights
        .group_identical(&production.weights, ParamGroup::FeatureExpansion));
    assert_eq!(candidate.normalizer, production.normalizer);

    let evaluation = transfer::evaluate(&production, &candidate, &incidents).unwrap();
    assert_eq!(evaluation.positions, 6 * 12);
    assert!(evaluation.candidate_mae.is_finite());

    let promoted = registry.promote(candidate);
    assert_eq!(promoted.version, 2);
    assert_eq!(promoted.stage, Stage::Transfer);
    assert_eq!(promoted.parent_version, Some(1));

    let rolled_back = registry.rollback().unwrap();
    assert_eq!(rolled_back.version, 1);
    assert_eq!(registry.production_version(), 1);
}

#[test]
fn test_incident_file_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("incidents.json");
    let incidents = parse_incidents(INCIDENTS).unwrap();
    save_incidents(&path, &incidents).unwrap();
    let reloaded = load_incidents(&path).unwrap();
    assert_eq!(reloaded.len(), 2);
    assert_eq!(reloaded[1].id, "main-break");
    assert_eq!(reloaded[1].graph.edges(), incidents[1].graph.edges());
    assert_eq!(
        reloaded[1].graph.feature_matrix(),
        incidents[1].graph.feature_matrix()
    );
    assert_eq!(reloaded[0].graph.labeled_count(), 3);
}

//! Real incident ingestion.
//!
//! An incident file holds a list of incidents, an object with an
//! `incidents` array, or one bare incident. Each node lists its category,
//! any operational attributes (missing ones take defaults) and an optional
//! `impacted` ground truth in [0, 1], or -1 when unknown. A known `impacted`
//! value is expanded to all twelve output dimensions unless the node gives
//! explicit per-dimension values.

use std::path::Path;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CascadeError, Result};
use crate::graph::{
    Edge, InfraGraph, Node, NodeType, OperationalAttributes, OUTPUT_DIM, UNKNOWN_LABEL,
};

/// Per-dimension share of the `impacted` value for dimensions 0 to 10.
pub const IMPACT_PROFILE: [f32; OUTPUT_DIM - 1] =
    [1.0, 0.8, 0.6, 0.9, 0.7, 0.5, 0.6, 0.8, 0.7, 0.75, 0.85];

/// Raw status below which a labeled node counts as failed.
pub const FAILED_STATUS: f32 = 0.5;

/// Names of the twelve output dimensions.
pub const IMPACT_DIMENSIONS: [&str; OUTPUT_DIM] = [
    "probability",
    "severity",
    "time_to_impact",
    "water_impact",
    "power_impact",
    "road_impact",
    "building_impact",
    "population_affected",
    "economic_loss",
    "recovery_time",
    "priority",
    "confidence",
];

/// Expand a scalar impact into a full label vector.
///
/// Negative input yields an all-unknown vector.
pub fn impact_labels(impacted: f32) -> [f32; OUTPUT_DIM] {
    if impacted < 0.0 {
        return [UNKNOWN_LABEL; OUTPUT_DIM];
    }
    let mut labels = [0.0; OUTPUT_DIM];
    for (dst, share) in labels.iter_mut().zip(IMPACT_PROFILE) {
        *dst = impacted * share;
    }
    labels[OUTPUT_DIM - 1] = if impacted > 0.0 { 0.7 } else { 0.8 };
    labels
}

/// Optional explicit values for output dimensions 1 to 11.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_impact: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub water_impact: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_impact: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub road_impact: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub building_impact: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub population_affected: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub economic_loss: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_time: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl LabelOverrides {
    fn values(&self) -> [Option<f32>; OUTPUT_DIM - 1] {
        [
            self.severity,
            self.time_to_impact,
            self.water_impact,
            self.power_impact,
            self.road_impact,
            self.building_impact,
            self.population_affected,
            self.economic_loss,
            self.recovery_time,
            self.priority,
            self.confidence,
        ]
    }
}

fn default_node_type() -> String {
    NodeType::Building.name().to_string()
}

fn unknown_impact() -> f32 {
    UNKNOWN_LABEL
}

/// One node as written in an incident file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentNodeRecord {
    pub id: usize,
    #[serde(rename = "type", default = "default_node_type")]
    pub node_type: String,
    #[serde(flatten)]
    pub attributes: OperationalAttributes,
    /// Ground truth in [0, 1]; -1 when unknown.
    #[serde(default = "unknown_impact")]
    pub impacted: f32,
    #[serde(flatten)]
    pub overrides: LabelOverrides,
}

impl IncidentNodeRecord {
    fn labels(&self) -> [f32; OUTPUT_DIM] {
        let mut labels = impact_labels(self.impacted);
        if self.impacted >= 0.0 {
            for (dst, value) in labels[1..].iter_mut().zip(self.overrides.values()) {
                if let Some(v) = value {
                    *dst = v;
                }
            }
        }
        labels
    }
}

/// One incident as written in an incident file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    #[serde(default, alias = "incident_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub nodes: Vec<IncidentNodeRecord>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IncidentFile {
    Many(Vec<IncidentRecord>),
    Wrapped { incidents: Vec<IncidentRecord> },
    Single(IncidentRecord),
}

/// A validated, partially labeled incident graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Incident {
    pub id: String,
    pub name: Option<String>,
    pub date: Option<String>,
    pub description: Option<String>,
    pub graph: InfraGraph,
}

impl Incident {
    pub fn from_record(record: IncidentRecord) -> Result<Self> {
        let id = record.id;
        let mut nodes = Vec::with_capacity(record.nodes.len());
        let mut labels = Array2::from_elem((record.nodes.len(), OUTPUT_DIM), UNKNOWN_LABEL);
        for (row, node) in record.nodes.iter().enumerate() {
            let node_type: NodeType = node
                .node_type
                .parse()
                .map_err(|e| CascadeError::input(format!("incident '{id}': {e}")))?;
            if node.impacted != UNKNOWN_LABEL && !(0.0..=1.0).contains(&node.impacted) {
                return Err(CascadeError::input(format!(
                    "incident '{id}': node {} impacted {} is neither -1 nor in [0, 1]",
                    node.id, node.impacted
                )));
            }
            nodes.push(Node::new(node.id, node_type, node.attributes));
            for (dst, v) in labels.row_mut(row).iter_mut().zip(node.labels()) {
                *dst = v;
            }
        }
        let graph = InfraGraph::new(nodes, record.edges)
            .and_then(|g| g.with_labels(labels))
            .map_err(|e| match e {
                CascadeError::InputError(msg) => {
                    CascadeError::input(format!("incident '{id}': {msg}"))
                }
                other => other,
            })?;
        Ok(Self {
            id,
            name: record.name,
            date: record.date,
            description: record.description,
            graph,
        })
    }

    /// Back to the file representation; `impacted` is the dimension 0 label.
    pub fn to_record(&self) -> IncidentRecord {
        let labels = self.graph.labels();
        let nodes = self
            .graph
            .nodes()
            .iter()
            .enumerate()
            .map(|(pos, node)| {
                let mut row = [UNKNOWN_LABEL; OUTPUT_DIM];
                if let Some(l) = labels {
                    for (dst, &v) in row.iter_mut().zip(l.row(pos)) {
                        *dst = v;
                    }
                }
                let impacted = row[0];
                let mut overrides = LabelOverrides::default();
                if impacted >= 0.0 {
                    let derived = impact_labels(impacted);
                    let slots: [&mut Option<f32>; OUTPUT_DIM - 1] = [
                        &mut overrides.severity,
                        &mut overrides.time_to_impact,
                        &mut overrides.water_impact,
                        &mut overrides.power_impact,
                        &mut overrides.road_impact,
                        &mut overrides.building_impact,
                        &mut overrides.population_affected,
                        &mut overrides.economic_loss,
                        &mut overrides.recovery_time,
                        &mut overrides.priority,
                        &mut overrides.confidence,
                    ];
                    for ((slot, &stored), &expected) in
                        slots.into_iter().zip(&row[1..]).zip(&derived[1..])
                    {
                        if (stored - expected).abs() > 1e-6 {
                            *slot = Some(stored);
                        }
                    }
                }
                IncidentNodeRecord {
                    id: node.id,
                    node_type: node.node_type().name().to_string(),
                    attributes: node.attributes(),
                    impacted,
                    overrides,
                }
            })
            .collect();
        IncidentRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            date: self.date.clone(),
            description: self.description.clone(),
            nodes,
            edges: self.graph.edges().to_vec(),
        }
    }
}

/// Parse incidents from JSON text.
pub fn parse_incidents(json: &str) -> Result<Vec<Incident>> {
    let file: IncidentFile = serde_json::from_str(json)?;
    let records = match file {
        IncidentFile::Many(records) => records,
        IncidentFile::Wrapped { incidents } => incidents,
        IncidentFile::Single(record) => vec![record],
    };
    records
        .into_iter()
        .enumerate()
        .map(|(i, mut record)| {
            if record.id.is_empty() {
                record.id = format!("incident-{i}");
            }
            let incident = Incident::from_record(record)?;
            debug!(
                incident = %incident.id,
                nodes = incident.graph.num_nodes(),
                labeled = incident.graph.labeled_count(),
                "parsed incident"
            );
            Ok(incident)
        })
        .collect()
}

/// Load and validate an incident file.
pub fn load_incidents(path: impl AsRef<Path>) -> Result<Vec<Incident>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let incidents = parse_incidents(&text)?;
    info!(path = %path.display(), count = incidents.len(), "loaded incidents");
    Ok(incidents)
}

/// Write incidents as a JSON array.
pub fn save_incidents(path: impl AsRef<Path>, incidents: &[Incident]) -> Result<()> {
    let records: Vec<IncidentRecord> = incidents.iter().map(Incident::to_record).collect();
    std::fs::write(path.as_ref(), serde_json::to_string_pretty(&records)?)?;
    Ok(())
}

/// Label statistics of an incident set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentSummary {
    pub incidents: usize,
    pub nodes: usize,
    pub labeled_nodes: usize,
    /// Labeled nodes whose raw status is below [`FAILED_STATUS`].
    pub failed_nodes: usize,
}

pub fn summarize(incidents: &[Incident]) -> IncidentSummary {
    let mut summary = IncidentSummary {
        incidents: incidents.len(),
        ..Default::default()
    };
    for incident in incidents {
        let graph = &incident.graph;
        summary.nodes += graph.num_nodes();
        for (pos, node) in graph.nodes().iter().enumerate() {
            if graph.is_labeled(pos) {
                summary.labeled_nodes += 1;
                if node.status() < FAILED_STATUS {
                    summary.failed_nodes += 1;
                }
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::STATUS_INDEX;

    const SAMPLE: &str = r#"
    {
        "incident_id": "2024-08-12-pipe-burst",
        "date": "2024-08-12",
        "description": "Water main burst near hospital",
        "nodes": [
            {"id": 0, "type": "Tank", "capacity": 0.8, "status": 0.0, "impacted": 1.0},
            {"id": 1, "type": "Pipe", "status": 0.9, "impacted": 0.0},
            {"id": 2, "type": "Hospital", "impacted": 0.4, "severity": 0.9},
            {"id": 3, "type": "Road"}
        ],
        "edges": [
            {"source": 0, "target": 1, "weight": 0.9},
            {"source": 1, "target": 2},
            {"source": 2, "target": 3, "weight": 0.5}
        ]
    }"#;

    #[test]
    fn test_single_incident() {
        let incidents = parse_incidents(SAMPLE).unwrap();
        assert_eq!(incidents.len(), 1);
        let inc = &incidents[0];
        assert_eq!(inc.id, "2024-08-12-pipe-burst");
        assert_eq!(inc.graph.num_nodes(), 4);
        assert_eq!(inc.graph.edges()[1].weight, 1.0);

        let labels = inc.graph.labels().unwrap();
        assert_eq!(labels[[0, 0]], 1.0);
        assert!((labels[[0, 1]] - 0.8).abs() < 1e-6);
        assert!((labels[[0, 11]] - 0.7).abs() < 1e-6);
        assert!((labels[[1, 11]] - 0.8).abs() < 1e-6);
        assert!((labels[[2, 1]] - 0.9).abs() < 1e-6);
        assert!(labels.row(3).iter().all(|&v| v == UNKNOWN_LABEL));

        // defaults fill missing attributes
        let x = inc.graph.feature_matrix();
        assert_eq!(x[[3, STATUS_INDEX]], 0.9);
        assert_eq!(x[[0, NodeType::Tank.index()]], 1.0);
    }

    #[test]
    fn test_list_and_wrapped_forms() {
        let list = format!("[{SAMPLE}, {SAMPLE}]");
        assert_eq!(parse_incidents(&list).unwrap().len(), 2);
        let wrapped = format!(r#"{{"incidents": [{SAMPLE}]}}"#);
        assert_eq!(parse_incidents(&wrapped).unwrap().len(), 1);
    }

    #[test]
    fn test_summary_counts_failed_nodes() {
        let incidents = parse_incidents(SAMPLE).unwrap();
        let summary = summarize(&incidents);
        assert_eq!(summary.incidents, 1);
        assert_eq!(summary.nodes, 4);
        assert_eq!(summary.labeled_nodes, 3);
        assert_eq!(summary.failed_nodes, 1);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let json = r#"{"id": "x", "nodes": [{"id": 0, "type": "Reactor"}], "edges": []}"#;
        let err = parse_incidents(json).unwrap_err();
        assert!(err.to_string().contains("Reactor"));
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let json = r#"{"id": "x", "nodes": [{"id": 0, "type": "Road"}],
                       "edges": [{"source": 0, "target": 7}]}"#;
        let err = parse_incidents(json).unwrap_err();
        assert!(err.is_input_error());
        assert!(err.to_string().contains("incident 'x'"));
    }

    #[test]
    fn test_impacted_out_of_range_rejected() {
        let json = r#"{"id": "x", "nodes": [{"id": 0, "type": "Road", "impacted": 3.0}]}"#;
        assert!(parse_incidents(json).is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let incidents = parse_incidents(SAMPLE).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incidents.json");
        save_incidents(&path, &incidents).unwrap();
        let reloaded = load_incidents(&path).unwrap();
        assert_eq!(reloaded[0].graph.feature_matrix(), incidents[0].graph.feature_matrix());
        let a = reloaded[0].graph.labels().unwrap().to_owned();
        let b = incidents[0].graph.labels().unwrap().to_owned();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_record_keeps_only_explicit_overrides() {
        let incidents = parse_incidents(SAMPLE).unwrap();
        let record = incidents[0].to_record();

        let hospital = &record.nodes[2];
        assert!((hospital.impacted - 0.4).abs() < 1e-6);
        assert_eq!(hospital.overrides.severity, Some(0.9));
        assert_eq!(hospital.overrides.water_impact, None);

        assert_eq!(record.nodes[0].overrides, LabelOverrides::default());
        assert_eq!(record.nodes[3].impacted, UNKNOWN_LABEL);
        assert_eq!(record.nodes[3].overrides, LabelOverrides::default());
    }

    #[test]
    fn test_impact_labels() {
        assert_eq!(impact_labels(-1.0), [UNKNOWN_LABEL; OUTPUT_DIM]);
        let zero = impact_labels(0.0);
        assert_eq!(zero[0], 0.0);
        assert_eq!(zero[11], 0.8);
    }
}

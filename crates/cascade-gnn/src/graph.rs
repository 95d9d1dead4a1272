//! Infrastructure graph model.
//!
//! Nodes carry a 24-wide raw feature row: the one-hot asset category
//! followed by twelve operational attributes. Edges are undirected and
//! weighted in (0, 1]. [`Topology`] is the message-passing view of a graph
//! with both edge directions and a unit self-loop on every node.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::{CascadeError, Result};

/// Number of asset categories in the one-hot prefix.
pub const NUM_NODE_TYPES: usize = 12;
/// Number of continuous operational attributes.
pub const NUM_ATTRIBUTES: usize = 12;
/// Width of a raw node feature row.
pub const FEATURE_DIM: usize = NUM_NODE_TYPES + NUM_ATTRIBUTES;
/// Width of a per-node impact vector.
pub const OUTPUT_DIM: usize = 12;
/// Offset of `status` within the operational attributes.
pub const STATUS_ATTRIBUTE: usize = 3;
/// Absolute column of `status` in a raw feature row.
pub const STATUS_INDEX: usize = NUM_NODE_TYPES + STATUS_ATTRIBUTE;
/// Label value marking an unknown ground truth.
pub const UNKNOWN_LABEL: f32 = -1.0;

/// Infrastructure asset category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeType {
    Road,
    Building,
    Power,
    Tank,
    Pump,
    Pipe,
    Sensor,
    Cluster,
    Bridge,
    School,
    Hospital,
    Market,
}

impl NodeType {
    /// All categories in one-hot order.
    pub const ALL: [NodeType; NUM_NODE_TYPES] = [
        NodeType::Road,
        NodeType::Building,
        NodeType::Power,
        NodeType::Tank,
        NodeType::Pump,
        NodeType::Pipe,
        NodeType::Sensor,
        NodeType::Cluster,
        NodeType::Bridge,
        NodeType::School,
        NodeType::Hospital,
        NodeType::Market,
    ];

    /// Position of this category in the one-hot prefix.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Canonical name used by incident files.
    pub fn name(self) -> &'static str {
        match self {
            NodeType::Road => "Road",
            NodeType::Building => "Building",
            NodeType::Power => "Power",
            NodeType::Tank => "Tank",
            NodeType::Pump => "Pump",
            NodeType::Pipe => "Pipe",
            NodeType::Sensor => "Sensor",
            NodeType::Cluster => "Cluster",
            NodeType::Bridge => "Bridge",
            NodeType::School => "School",
            NodeType::Hospital => "Hospital",
            NodeType::Market => "Market",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NodeType {
    type Err = CascadeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CascadeError::input(format!("unknown node type '{s}'")))
    }
}

fn default_capacity() -> f32 {
    0.5
}
fn default_level() -> f32 {
    0.5
}
fn default_flow() -> f32 {
    0.5
}
fn default_status() -> f32 {
    0.9
}
fn default_criticality() -> f32 {
    0.5
}
fn default_population() -> f32 {
    0.3
}
fn default_economic() -> f32 {
    0.3
}
fn default_connectivity() -> f32 {
    0.5
}
fn default_maintenance() -> f32 {
    0.7
}
fn default_weather() -> f32 {
    0.2
}
fn default_history() -> f32 {
    0.1
}

/// The twelve continuous operational attributes of a node.
///
/// Field order matches the feature layout. Missing fields deserialize to
/// typical mid-range values so sparse incident reports still load.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperationalAttributes {
    #[serde(default = "default_capacity")]
    pub capacity: f32,
    #[serde(default = "default_level")]
    pub level: f32,
    #[serde(default = "default_flow")]
    pub flow: f32,
    /// Operating status in [0, 1]; 0 is a hard failure.
    #[serde(default = "default_status")]
    pub status: f32,
    #[serde(default = "default_criticality")]
    pub criticality: f32,
    #[serde(default = "default_population")]
    pub population_served: f32,
    #[serde(default = "default_economic")]
    pub economic_value: f32,
    #[serde(default = "default_connectivity")]
    pub connectivity: f32,
    #[serde(default = "default_maintenance")]
    pub maintenance_score: f32,
    #[serde(default = "default_weather")]
    pub weather_risk: f32,
    #[serde(default = "default_history")]
    pub failure_history: f32,
    #[serde(default)]
    pub reserved: f32,
}

impl Default for OperationalAttributes {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            level: default_level(),
            flow: default_flow(),
            status: default_status(),
            criticality: default_criticality(),
            population_served: default_population(),
            economic_value: default_economic(),
            connectivity: default_connectivity(),
            maintenance_score: default_maintenance(),
            weather_risk: default_weather(),
            failure_history: default_history(),
            reserved: 0.0,
        }
    }
}

impl OperationalAttributes {
    /// Attributes in feature-column order.
    pub fn to_array(&self) -> [f32; NUM_ATTRIBUTES] {
        [
            self.capacity,
            self.level,
            self.flow,
            self.status,
            self.criticality,
            self.population_served,
            self.economic_value,
            self.connectivity,
            self.maintenance_score,
            self.weather_risk,
            self.failure_history,
            self.reserved,
        ]
    }

    /// Inverse of [`to_array`](Self::to_array).
    pub fn from_array(values: [f32; NUM_ATTRIBUTES]) -> Self {
        Self {
            capacity: values[0],
            level: values[1],
            flow: values[2],
            status: values[3],
            criticality: values[4],
            population_served: values[5],
            economic_value: values[6],
            connectivity: values[7],
            maintenance_score: values[8],
            weather_risk: values[9],
            failure_history: values[10],
            reserved: values[11],
        }
    }
}

/// An infrastructure asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Caller-assigned identifier, unique within a graph.
    pub id: usize,
    features: [f32; FEATURE_DIM],
}

impl Node {
    /// Build a node from its category and attributes.
    pub fn new(id: usize, node_type: NodeType, attributes: OperationalAttributes) -> Self {
        let mut features = [0.0; FEATURE_DIM];
        features[node_type.index()] = 1.0;
        features[NUM_NODE_TYPES..].copy_from_slice(&attributes.to_array());
        Self { id, features }
    }

    /// Build a node from a raw 24-wide feature row.
    pub fn from_features(id: usize, row: &[f32]) -> Result<Self> {
        if row.len() != FEATURE_DIM {
            return Err(CascadeError::input(format!(
                "node {id}: expected {FEATURE_DIM} features, got {}",
                row.len()
            )));
        }
        let mut features = [0.0; FEATURE_DIM];
        features.copy_from_slice(row);
        Ok(Self { id, features })
    }

    /// Raw feature row.
    pub fn features(&self) -> &[f32; FEATURE_DIM] {
        &self.features
    }

    /// Category with the largest one-hot entry.
    pub fn node_type(&self) -> NodeType {
        let mut best = 0;
        for i in 1..NUM_NODE_TYPES {
            if self.features[i] > self.features[best] {
                best = i;
            }
        }
        NodeType::ALL[best]
    }

    /// Operational attributes.
    pub fn attributes(&self) -> OperationalAttributes {
        let mut values = [0.0; NUM_ATTRIBUTES];
        values.copy_from_slice(&self.features[NUM_NODE_TYPES..]);
        OperationalAttributes::from_array(values)
    }

    /// Raw operating status.
    pub fn status(&self) -> f32 {
        self.features[STATUS_INDEX]
    }

    /// Overwrite the operating status.
    pub fn set_status(&mut self, status: f32) {
        self.features[STATUS_INDEX] = status;
    }
}

fn default_weight() -> f32 {
    1.0
}

/// Undirected weighted connection between two nodes (by id).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: usize,
    pub target: usize,
    #[serde(default = "default_weight")]
    pub weight: f32,
}

impl Edge {
    /// Unit-weight edge.
    pub fn new(source: usize, target: usize) -> Self {
        Self {
            source,
            target,
            weight: 1.0,
        }
    }

    /// Weighted edge.
    pub fn weighted(source: usize, target: usize, weight: f32) -> Self {
        Self {
            source,
            target,
            weight,
        }
    }
}

/// A validated infrastructure graph with optional per-node labels.
///
/// Labels are an `N x 12` matrix where [`UNKNOWN_LABEL`] marks positions
/// with no ground truth.
#[derive(Debug, Clone, PartialEq)]
pub struct InfraGraph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    /// Edge endpoints resolved to node positions.
    links: Vec<(usize, usize, f32)>,
    positions: HashMap<usize, usize>,
    labels: Option<Array2<f32>>,
}

impl InfraGraph {
    /// Validate nodes and edges and build the graph.
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(CascadeError::input("graph has no nodes"));
        }

        let mut positions = HashMap::with_capacity(nodes.len());
        for (pos, node) in nodes.iter().enumerate() {
            if positions.insert(node.id, pos).is_some() {
                return Err(CascadeError::input(format!("duplicate node id {}", node.id)));
            }
            if let Some(bad) = node.features.iter().position(|v| !v.is_finite()) {
                return Err(CascadeError::input(format!(
                    "node {}: feature {bad} is not finite",
                    node.id
                )));
            }
            let status = node.status();
            if !(0.0..=1.0).contains(&status) {
                return Err(CascadeError::input(format!(
                    "node {}: status {status} outside [0, 1]",
                    node.id
                )));
            }
        }

        let mut links = Vec::with_capacity(edges.len());
        for (k, edge) in edges.iter().enumerate() {
            let src = positions.get(&edge.source).copied().ok_or_else(|| {
                CascadeError::input(format!(
                    "edge {k} references unknown source node {}",
                    edge.source
                ))
            })?;
            let dst = positions.get(&edge.target).copied().ok_or_else(|| {
                CascadeError::input(format!(
                    "edge {k} references unknown target node {}",
                    edge.target
                ))
            })?;
            if !edge.weight.is_finite() || edge.weight <= 0.0 || edge.weight > 1.0 {
                return Err(CascadeError::input(format!(
                    "edge {k}: weight {} outside (0, 1]",
                    edge.weight
                )));
            }
            links.push((src, dst, edge.weight));
        }

        Ok(Self {
            nodes,
            edges,
            links,
            positions,
            labels: None,
        })
    }

    /// Build a graph from raw feature rows; node ids are row positions.
    pub fn from_feature_rows(rows: &[Vec<f32>], edges: Vec<Edge>) -> Result<Self> {
        let nodes = rows
            .iter()
            .enumerate()
            .map(|(i, row)| Node::from_features(i, row))
            .collect::<Result<Vec<_>>>()?;
        Self::new(nodes, edges)
    }

    /// Attach an `N x 12` label matrix.
    pub fn with_labels(mut self, labels: Array2<f32>) -> Result<Self> {
        if labels.dim() != (self.nodes.len(), OUTPUT_DIM) {
            return Err(CascadeError::input(format!(
                "labels have shape {:?}, expected ({}, {OUTPUT_DIM})",
                labels.dim(),
                self.nodes.len()
            )));
        }
        if let Some(bad) = labels
            .iter()
            .find(|&&v| v != UNKNOWN_LABEL && !(0.0..=1.0).contains(&v))
        {
            return Err(CascadeError::input(format!(
                "label value {bad} is neither unknown (-1) nor in [0, 1]"
            )));
        }
        self.labels = Some(labels);
        Ok(self)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Edges as `(source position, target position, weight)`.
    pub fn links(&self) -> &[(usize, usize, f32)] {
        &self.links
    }

    pub fn labels(&self) -> Option<ArrayView2<'_, f32>> {
        self.labels.as_ref().map(|l| l.view())
    }

    /// Row position of a node id.
    pub fn position(&self, id: usize) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    /// Row position of a node id, or an input error.
    pub fn require_position(&self, id: usize) -> Result<usize> {
        self.position(id)
            .ok_or_else(|| CascadeError::input(format!("node {id} is not in the graph")))
    }

    /// Whether any label of the node at `pos` is known.
    pub fn is_labeled(&self, pos: usize) -> bool {
        self.labels
            .as_ref()
            .map(|l| l.row(pos).iter().any(|&v| v != UNKNOWN_LABEL))
            .unwrap_or(false)
    }

    /// Number of nodes with at least one known label.
    pub fn labeled_count(&self) -> usize {
        (0..self.nodes.len()).filter(|&p| self.is_labeled(p)).count()
    }

    /// Raw `N x 24` feature matrix.
    pub fn feature_matrix(&self) -> Array2<f32> {
        let mut x = Array2::zeros((self.nodes.len(), FEATURE_DIM));
        for (mut row, node) in x.rows_mut().into_iter().zip(&self.nodes) {
            for (dst, src) in row.iter_mut().zip(node.features.iter()) {
                *dst = *src;
            }
        }
        x
    }

    /// Copy of the graph with one node's status forced to hard failure.
    pub fn with_failed_node(&self, id: usize) -> Result<Self> {
        let pos = self.require_position(id)?;
        let mut forced = self.clone();
        forced.nodes[pos].set_status(0.0);
        Ok(forced)
    }

    /// Undirected adjacency lists over node positions.
    pub fn neighbors(&self) -> Vec<Vec<usize>> {
        let mut adj = vec![Vec::new(); self.nodes.len()];
        for &(s, t, _) in &self.links {
            if s != t {
                adj[s].push(t);
                adj[t].push(s);
            }
        }
        adj
    }

    /// Hop distance from `start` to every node; `None` when unreachable.
    pub fn hop_distances(&self, start: usize) -> Vec<Option<usize>> {
        let adj = self.neighbors();
        let mut dist = vec![None; self.nodes.len()];
        if start >= self.nodes.len() {
            return dist;
        }
        dist[start] = Some(0);
        let mut queue = VecDeque::from([start]);
        while let Some(u) = queue.pop_front() {
            let du = dist[u].unwrap_or(0);
            for &v in &adj[u] {
                if dist[v].is_none() {
                    dist[v] = Some(du + 1);
                    queue.push_back(v);
                }
            }
        }
        dist
    }
}

/// Message-passing view of a graph in compressed sparse row form.
///
/// Every node lists its incoming neighbors, both directions of every edge
/// and a unit self-loop. Each entry carries the raw edge weight and the
/// symmetric normalization coefficient `w / sqrt(deg_i * deg_j)`, where
/// degrees sum incoming weights including the self-loop.
#[derive(Debug, Clone)]
pub struct Topology {
    offsets: Vec<usize>,
    sources: Vec<usize>,
    weights: Vec<f32>,
    coefficients: Vec<f32>,
}

impl Topology {
    pub fn from_graph(graph: &InfraGraph) -> Self {
        let n = graph.num_nodes();
        let mut incoming: Vec<Vec<(usize, f32)>> = vec![Vec::new(); n];
        for &(s, t, w) in graph.links() {
            if s == t {
                incoming[t].push((s, w));
            } else {
                incoming[t].push((s, w));
                incoming[s].push((t, w));
            }
        }
        for (i, list) in incoming.iter_mut().enumerate() {
            list.push((i, 1.0));
        }

        let degree: Vec<f32> = incoming
            .iter()
            .map(|list| list.iter().map(|&(_, w)| w).sum())
            .collect();

        let mut offsets = Vec::with_capacity(n + 1);
        let mut sources = Vec::new();
        let mut weights = Vec::new();
        let mut coefficients = Vec::new();
        offsets.push(0);
        for (i, list) in incoming.iter().enumerate() {
            for &(j, w) in list {
                sources.push(j);
                weights.push(w);
                coefficients.push(w / (degree[i] * degree[j]).sqrt());
            }
            offsets.push(sources.len());
        }

        Self {
            offsets,
            sources,
            weights,
            coefficients,
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Total number of incoming entries, self-loops included.
    pub fn num_entries(&self) -> usize {
        self.sources.len()
    }

    /// Entry index range of node `i`'s incoming neighbors.
    pub fn incoming(&self, i: usize) -> std::ops::Range<usize> {
        self.offsets[i]..self.offsets[i + 1]
    }

    /// Source position of entry `k`.
    pub fn source(&self, k: usize) -> usize {
        self.sources[k]
    }

    /// Raw edge weight of entry `k`.
    pub fn weight(&self, k: usize) -> f32 {
        self.weights[k]
    }

    /// Normalized aggregation `A x`.
    pub fn aggregate(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut out = Array2::zeros(x.dim());
        for i in 0..self.num_nodes() {
            let mut row = out.row_mut(i);
            for k in self.incoming(i) {
                row.scaled_add(self.coefficients[k], &x.row(self.sources[k]));
            }
        }
        out
    }

    /// Transposed aggregation `A^T x`, used by back-propagation.
    pub fn aggregate_transpose(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut out = Array2::zeros(x.dim());
        for i in 0..self.num_nodes() {
            let src_row = x.row(i);
            for k in self.incoming(i) {
                out.row_mut(self.sources[k])
                    .scaled_add(self.coefficients[k], &src_row);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(n: usize) -> InfraGraph {
        let nodes = (0..n)
            .map(|i| Node::new(i, NodeType::Pipe, OperationalAttributes::default()))
            .collect();
        let edges = (1..n).map(|i| Edge::weighted(i - 1, i, 0.5)).collect();
        InfraGraph::new(nodes, edges).unwrap()
    }

    #[test]
    fn test_node_layout() {
        let node = Node::new(7, NodeType::Hospital, OperationalAttributes::default());
        assert_eq!(node.features()[NodeType::Hospital.index()], 1.0);
        assert_eq!(node.node_type(), NodeType::Hospital);
        assert_eq!(node.status(), 0.9);
        assert_eq!(node.features()[STATUS_INDEX], 0.9);
    }

    #[test]
    fn test_node_type_parse() {
        assert_eq!("power".parse::<NodeType>().unwrap(), NodeType::Power);
        assert_eq!("Market".parse::<NodeType>().unwrap(), NodeType::Market);
        assert!("reactor".parse::<NodeType>().is_err());
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let nodes = vec![Node::new(0, NodeType::Road, OperationalAttributes::default())];
        let err = InfraGraph::new(nodes, vec![Edge::new(0, 5)]).unwrap_err();
        assert!(err.is_input_error());
    }

    #[test]
    fn test_bad_weight_rejected() {
        let nodes = vec![
            Node::new(0, NodeType::Road, OperationalAttributes::default()),
            Node::new(1, NodeType::Road, OperationalAttributes::default()),
        ];
        assert!(InfraGraph::new(nodes.clone(), vec![Edge::weighted(0, 1, 0.0)]).is_err());
        assert!(InfraGraph::new(nodes, vec![Edge::weighted(0, 1, 1.5)]).is_err());
    }

    #[test]
    fn test_wrong_feature_width_rejected() {
        let rows = vec![vec![0.0; 23]];
        assert!(InfraGraph::from_feature_rows(&rows, vec![]).is_err());
    }

    #[test]
    fn test_missing_edge_weight_defaults_to_one() {
        let edge: Edge = serde_json::from_str(r#"{"source": 0, "target": 1}"#).unwrap();
        assert_eq!(edge.weight, 1.0);
    }

    #[test]
    fn test_isolated_node_gets_self_loop() {
        let nodes = vec![
            Node::new(0, NodeType::Road, OperationalAttributes::default()),
            Node::new(1, NodeType::Road, OperationalAttributes::default()),
        ];
        let graph = InfraGraph::new(nodes, vec![]).unwrap();
        let topo = Topology::from_graph(&graph);
        assert_eq!(topo.num_entries(), 2);

        let x = Array2::from_shape_vec((2, 1), vec![3.0, 4.0]).unwrap();
        assert_eq!(topo.aggregate(&x), x);
    }

    #[test]
    fn test_symmetric_normalization() {
        let graph = chain(3);
        let topo = Topology::from_graph(&graph);
        let x = Array2::from_shape_vec((3, 1), vec![1.0, 2.0, 3.0]).unwrap();
        let ax = topo.aggregate(&x);
        let atx = topo.aggregate_transpose(&x);
        for (a, b) in ax.iter().zip(atx.iter()) {
            assert!((a - b).abs() < 1e-6);
        }

        // deg(0) = 1.5, deg(1) = 2.0
        let expected = 1.0 / 1.5 + 0.5 / (1.5f32 * 2.0).sqrt() * 2.0;
        assert!((ax[[0, 0]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_hop_distances() {
        let mut nodes: Vec<Node> = (0..4)
            .map(|i| Node::new(i, NodeType::Pipe, OperationalAttributes::default()))
            .collect();
        nodes.push(Node::new(9, NodeType::Sensor, OperationalAttributes::default()));
        let edges = vec![Edge::new(0, 1), Edge::new(1, 2), Edge::new(2, 3)];
        let graph = InfraGraph::new(nodes, edges).unwrap();
        let dist = graph.hop_distances(0);
        assert_eq!(dist, vec![Some(0), Some(1), Some(2), Some(3), None]);
    }

    #[test]
    fn test_with_failed_node() {
        let graph = chain(3);
        let forced = graph.with_failed_node(1).unwrap();
        assert_eq!(forced.nodes()[1].status(), 0.0);
        assert_eq!(graph.nodes()[1].status(), 0.9);
        assert!(graph.with_failed_node(42).is_err());
    }

    #[test]
    fn test_label_validation() {
        let graph = chain(2);
        let mut labels = Array2::from_elem((2, OUTPUT_DIM), UNKNOWN_LABEL);
        labels[[0, 0]] = 0.7;
        let labeled = graph.clone().with_labels(labels.clone()).unwrap();
        assert_eq!(labeled.labeled_count(), 1);
        assert!(labeled.is_labeled(0));
        assert!(!labeled.is_labeled(1));

        labels[[1, 0]] = 2.0;
        assert!(graph.with_labels(labels).is_err());
    }
}

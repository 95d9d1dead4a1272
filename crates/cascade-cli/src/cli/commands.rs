//! Command implementations

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use cascade_gnn::backtest::Backtester;
use cascade_gnn::config::CascadeConfig;
use cascade_gnn::error::CascadeError;
use cascade_gnn::gate::GateRetrainer;
use cascade_gnn::incident::{load_incidents, save_incidents, summarize, Incident};
use cascade_gnn::inference::{InferenceEngine, InferenceRequest};
use cascade_gnn::params::ModelParameters;
use cascade_gnn::pretrain::TrainingOrchestrator;
use cascade_gnn::registry::ModelRegistry;
use cascade_gnn::simulate::{CascadeAnalysis, CounterfactualSimulator};
use cascade_gnn::synthetic::{SyntheticConfig, SyntheticGenerator};
use cascade_gnn::transfer::{self, TransferAdapter};
use colored::*;
use serde::Serialize;

use super::format::*;

/// Gate retraining flags that override the config file.
#[derive(Debug, Default, Clone)]
pub struct GateOverrides {
    pub learning_rate: Option<f32>,
    pub epochs: Option<usize>,
    pub focal: bool,
    pub focal_gamma: Option<f32>,
    pub focal_alpha: Option<f32>,
    pub train_output_layer: bool,
}

fn load_model(path: &Path) -> Result<ModelParameters> {
    ModelParameters::load(path)
        .with_context(|| format!("Failed to load model from {}", path.display()))
}

fn save_model(params: &ModelParameters, path: &Path) -> Result<()> {
    params
        .save(path)
        .with_context(|| format!("Failed to write model to {}", path.display()))
}

fn read_incidents(path: &Path) -> Result<Vec<Incident>> {
    load_incidents(path).with_context(|| format!("Failed to load incidents from {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Pick an incident by id, falling back to a numeric index.
pub fn select_incident<'a>(incidents: &'a [Incident], selector: Option<&str>) -> Result<&'a Incident> {
    let Some(selector) = selector else {
        return incidents
            .first()
            .ok_or_else(|| anyhow!("Incident file is empty"));
    };
    if let Some(found) = incidents.iter().find(|i| i.id == selector) {
        return Ok(found);
    }
    selector
        .parse::<usize>()
        .ok()
        .and_then(|idx| incidents.get(idx))
        .ok_or_else(|| anyhow!("No incident with id or index '{}'", selector))
}

/// Write synthetic labeled graphs as an incident file
pub fn generate_incidents(output: &Path, count: usize, seed: u64) -> Result<()> {
    let mut generator = SyntheticGenerator::new(SyntheticConfig {
        seed,
        ..Default::default()
    })?;
    let incidents: Vec<Incident> = generator
        .generate(count)?
        .into_iter()
        .enumerate()
        .map(|(i, graph)| Incident {
            id: format!("synthetic-{i}"),
            name: None,
            date: None,
            description: Some("generated single-failure scenario".to_string()),
            graph,
        })
        .collect();
    save_incidents(output, &incidents)
        .with_context(|| format!("Failed to write incidents to {}", output.display()))?;

    let summary = summarize(&incidents);
    println!(
        "{}",
        format_success(&format!(
            "Wrote {} incidents ({} nodes) to {}",
            summary.incidents,
            summary.nodes,
            output.display()
        ))
    );
    Ok(())
}

/// Pretrain a fresh model on synthetic graphs
pub fn pretrain(
    output: &Path,
    samples: usize,
    epochs: Option<usize>,
    seed: Option<u64>,
    config: &CascadeConfig,
) -> Result<()> {
    let mut pretrain_config = config.pretrain.clone();
    if let Some(epochs) = epochs {
        pretrain_config.epochs = epochs;
    }
    let mut synthetic = SyntheticConfig::default();
    if let Some(seed) = seed {
        synthetic.seed = seed;
        pretrain_config.seed = seed;
    }

    println!(
        "{}",
        format_info(&format!(
            "Pretraining on {} synthetic graphs for {} epochs",
            samples, pretrain_config.epochs
        ))
    );
    let orchestrator = TrainingOrchestrator::new(config.encoder.clone(), pretrain_config)?;
    let mut source = SyntheticGenerator::new(synthetic)?;
    let (params, report) = orchestrator.pretrain_from_source(&mut source, samples)?;

    save_model(&params, output)?;
    println!("  Train/val samples: {}/{}", report.train_samples, report.val_samples);
    println!(
        "  Best epoch: {} (loss {:.4})",
        report.best_epoch.to_string().cyan(),
        report.best_loss
    );
    println!("  Learning-rate reductions: {}", report.lr_reductions);
    println!("{}", format_success(&format!("Model written to {}", output.display())));
    Ok(())
}

/// Fine-tune a model on real incidents
pub fn fine_tune(
    model: &Path,
    incidents_path: &Path,
    output: &Path,
    epochs: Option<usize>,
    learning_rate: Option<f32>,
    config: &CascadeConfig,
) -> Result<()> {
    let mut transfer_config = config.transfer.clone();
    if let Some(epochs) = epochs {
        transfer_config.epochs = epochs;
    }
    if let Some(lr) = learning_rate {
        transfer_config.learning_rate = lr;
    }

    let registry = ModelRegistry::new(load_model(model)?);
    let incidents = read_incidents(incidents_path)?;
    let adapter = TransferAdapter::new(transfer_config)?;

    let base = registry.production();
    let (candidate, report) = adapter.fine_tune(&base, &incidents)?;
    let evaluation = transfer::evaluate(&base, &candidate, &incidents)?;

    println!(
        "  Incidents: {} ({} labeled nodes)",
        report.incidents, report.labeled_nodes
    );
    println!(
        "  MAE: {:.4} -> {:.4} ({:+.1}%)",
        evaluation.base_mae, evaluation.candidate_mae, evaluation.improvement_pct
    );
    if !evaluation.improved() {
        println!(
            "{}",
            format_warning("Fine-tuned model does not improve on the base model")
        );
    }

    let promoted = registry.promote(candidate);
    save_model(&promoted, output)?;
    println!(
        "{}",
        format_success(&format!(
            "Model version {} written to {}",
            promoted.version,
            output.display()
        ))
    );
    Ok(())
}

/// Safety-gated gate retraining
///
/// On success the promoted model is written to `output`. On rejection
/// nothing is written and the report carries the rollback confirmation.
pub fn retrain_gate(
    model: &Path,
    incidents_path: &Path,
    output: &Path,
    report_path: Option<&Path>,
    overrides: &GateOverrides,
    json: bool,
    config: &CascadeConfig,
) -> Result<()> {
    let mut gate = config.gate.clone();
    if let Some(lr) = overrides.learning_rate {
        gate.learning_rate = lr;
    }
    if let Some(epochs) = overrides.epochs {
        gate.epochs = epochs;
    }
    if overrides.focal {
        gate.focal = true;
    }
    if let Some(gamma) = overrides.focal_gamma {
        gate.focal_gamma = gamma;
    }
    if let Some(alpha) = overrides.focal_alpha {
        gate.focal_alpha = alpha;
    }
    if overrides.train_output_layer {
        gate.train_output_layer = true;
    }

    let registry = ModelRegistry::new(load_model(model)?);
    let incidents = read_incidents(incidents_path)?;

    let (report, promoted) = match GateRetrainer::new(gate).retrain(&registry, &incidents) {
        Ok(report) => (report, true),
        Err(CascadeError::ValidationRejection(report)) => (*report, false),
        Err(e) => return Err(e).context("Gate retraining aborted"),
    };

    if let Some(path) = report_path {
        std::fs::write(path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
    }
    if json {
        print_json(&report)?;
    } else {
        println!("{}", format_gate_report(&report));
    }

    if promoted {
        save_model(&registry.production(), output)?;
        if !json {
            println!(
                "{}",
                format_success(&format!(
                    "Promoted version {} written to {}",
                    registry.production_version(),
                    output.display()
                ))
            );
        }
        return Ok(());
    }

    if let Some(rollback) = &report.rollback {
        if !json {
            println!(
                "{}",
                format_warning(&format!(
                    "Candidate rejected; production stays at version {}{}",
                    rollback.production_version,
                    if rollback.unchanged { " (unchanged)" } else { "" }
                ))
            );
        }
    }
    bail!(
        "Validation rejected the candidate: {}",
        report.failed_criteria().join(", ")
    )
}

/// Impact probabilities and alerts for one incident graph
pub fn predict(
    model: &Path,
    incidents_path: &Path,
    incident: Option<&str>,
    threshold: Option<f32>,
    json: bool,
    config: &CascadeConfig,
) -> Result<()> {
    let registry = Arc::new(ModelRegistry::new(load_model(model)?));
    let incidents = read_incidents(incidents_path)?;
    let incident = select_incident(&incidents, incident)?;
    let graph = &incident.graph;

    let engine = InferenceEngine::new(registry, config.simulation.clone())?;
    let request = InferenceRequest {
        features: graph.nodes().iter().map(|n| n.features().to_vec()).collect(),
        edges: graph.edges().to_vec(),
        failure_node_id: None,
        threshold: Some(threshold.unwrap_or(config.decision.threshold)),
    };
    let response = engine.infer(&request)?;
    if json {
        return print_json(&response);
    }

    println!(
        "\n{} {} (model version {})",
        "Incident".bold().green(),
        incident.id.cyan(),
        response.model_version
    );
    println!("  {:>6}  {:<10} {:>8}  {}", "node", "type", "impact", "alert");
    let alerts = response.alerts.unwrap_or_default();
    for (pos, node) in graph.nodes().iter().enumerate() {
        let p = response.probabilities[pos][config.simulation.impact_dimension];
        let alert = if alerts.get(pos).copied().unwrap_or(false) {
            "ALERT".red().bold()
        } else {
            "-".dimmed()
        };
        println!("  {:>6}  {:<10} {:>8.4}  {}", node.id, node.node_type().name(), p, alert);
    }
    println!("\n  Risk level: {}", format_risk(response.risk));
    Ok(())
}

/// Counterfactual failure simulation
pub fn simulate(
    model: &Path,
    incidents_path: &Path,
    incident: Option<&str>,
    node: Option<usize>,
    show_all: bool,
    json: bool,
    config: &CascadeConfig,
) -> Result<()> {
    let params = load_model(model)?;
    let incidents = read_incidents(incidents_path)?;
    let incident = select_incident(&incidents, incident)?;
    let graph = &incident.graph;
    let simulator = CounterfactualSimulator::new(&params, config.simulation.clone())?;

    match node {
        Some(id) => {
            let report = simulator.simulate(graph, id)?;
            if json {
                return print_json(&report);
            }
            let analysis = CascadeAnalysis::from_report(&report);
            println!("{}", format_delta_report(&report, show_all));
            println!("{}", format_cascade(&analysis));
        }
        None => {
            let candidates: Vec<usize> = graph.nodes().iter().map(|n| n.id).collect();
            let reports = simulator.batch_simulate(graph, &candidates)?;
            if json {
                return print_json(&reports);
            }
            println!(
                "\n{} {}",
                "Most damaging failures in".bold().green(),
                incident.id.cyan()
            );
            for (rank, report) in reports.iter().enumerate() {
                let node = report.node(report.forced_node);
                println!(
                    "  {:>3}. node {:>5} {:<10} total delta {:.4}, {} affected",
                    rank + 1,
                    report.forced_node,
                    node.map_or("?", |d| d.node_type.name()),
                    report.total_positive_delta(),
                    report.affected().count()
                );
            }
        }
    }
    Ok(())
}

/// Backtest one model, or compare two, on labeled incidents
pub fn backtest(
    model: &Path,
    incidents_path: &Path,
    compare: Option<&Path>,
    top_k: Option<usize>,
    threshold: Option<f32>,
    json: bool,
    config: &CascadeConfig,
) -> Result<()> {
    let mut backtest_config = config.backtest.clone();
    if let Some(k) = top_k {
        backtest_config.top_k = k;
    }
    let backtester = Backtester::new(
        &backtest_config,
        threshold.unwrap_or(config.decision.threshold),
    )?;
    let params = load_model(model)?;
    let incidents = read_incidents(incidents_path)?;

    match compare {
        Some(candidate_path) => {
            let candidate = load_model(candidate_path)?;
            let comparison = backtester.compare(&params, &candidate, &incidents)?;
            if json {
                return print_json(&comparison);
            }
            println!("{}", format_comparison(&comparison));
        }
        None => {
            let report = backtester.run(&params, &incidents)?;
            if json {
                return print_json(&report);
            }
            println!("{}", format_backtest(&report));
        }
    }
    Ok(())
}

/// Show model artifact details
pub fn inspect(model: &Path, json: bool) -> Result<()> {
    let params = load_model(model)?;
    params
        .weights
        .check_shapes()
        .context("Model weights are inconsistent")?;
    if json {
        return print_json(&serde_json::json!({
            "version": params.version,
            "parent_version": params.parent_version,
            "stage": params.stage,
            "created_at": params.created_at,
            "hidden_dim": params.weights.hidden_dim(),
            "normalizer": params.normalizer,
        }));
    }
    println!("{}", format_model(&params));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_gnn::incident::parse_incidents;

    const TWO: &str = r#"[
        {"id": "a", "nodes": [{"id": 0, "type": "Pump"}], "edges": []},
        {"id": "b", "nodes": [{"id": 0, "type": "Road"}], "edges": []}
    ]"#;

    #[test]
    fn test_select_incident() {
        let incidents = parse_incidents(TWO).unwrap();
        assert_eq!(select_incident(&incidents, None).unwrap().id, "a");
        assert_eq!(select_incident(&incidents, Some("b")).unwrap().id, "b");
        assert_eq!(select_incident(&incidents, Some("1")).unwrap().id, "b");
        assert!(select_incident(&incidents, Some("7")).is_err());
        assert!(select_incident(&[], None).is_err());
    }
}

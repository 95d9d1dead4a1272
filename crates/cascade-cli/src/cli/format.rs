//! Output formatting utilities

use cascade_gnn::backtest::{BacktestReport, BacktestSummary, ModelComparison};
use cascade_gnn::decision::RiskLevel;
use cascade_gnn::gate::{CriterionResult, GateRetrainReport};
use cascade_gnn::params::{ModelParameters, ParamGroup};
use cascade_gnn::simulate::{CascadeAnalysis, DeltaReport};
use colored::*;
use serde::Serialize;

/// Format error message
pub fn format_error(msg: &str) -> String {
    format!("{} {}", "Error:".red().bold(), msg)
}

/// Format success message
pub fn format_success(msg: &str) -> String {
    format!("{} {}", "✓".green().bold(), msg)
}

/// Format warning message
pub fn format_warning(msg: &str) -> String {
    format!("{} {}", "Warning:".yellow().bold(), msg)
}

/// Format info message
pub fn format_info(msg: &str) -> String {
    format!("{} {}", "ℹ".blue().bold(), msg)
}

/// snake_case name of a serde unit variant.
pub fn variant_name<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => "unknown".to_string(),
    }
}

pub fn format_risk(risk: RiskLevel) -> ColoredString {
    match risk {
        RiskLevel::Low => risk.as_str().green(),
        RiskLevel::Moderate => risk.as_str().yellow(),
        RiskLevel::High => risk.as_str().red(),
        RiskLevel::Critical => risk.as_str().red().bold(),
    }
}

/// Format model artifact summary
pub fn format_model(params: &ModelParameters) -> String {
    let mut output = format!(
        "\n{}\n  Version: {}\n  Stage: {}\n  Parent: {}\n  Created: {}\n  Hidden dim: {}\n",
        "Model Parameters".bold().green(),
        params.version.to_string().cyan(),
        params.stage.to_string().cyan(),
        params
            .parent_version
            .map_or_else(|| "none".to_string(), |v| v.to_string())
            .cyan(),
        params.created_at.to_rfc3339().cyan(),
        params.weights.hidden_dim().to_string().cyan(),
    );

    output.push_str(&format!("\n{}\n", "Parameter groups:".bold().cyan()));
    let mut total = 0;
    for group in ParamGroup::ALL {
        let count = params.weights.group_len(group);
        total += count;
        output.push_str(&format!("  {:<22} {:>9}\n", group.name(), count));
    }
    output.push_str(&format!("  {:<22} {:>9}\n", "total".bold(), total));
    output
}

/// Format the five promotion criteria
pub fn format_criteria(criteria: &[CriterionResult]) -> String {
    let mut output = String::new();
    for c in criteria {
        let mark = if c.passed { "PASS".green().bold() } else { "FAIL".red().bold() };
        output.push_str(&format!(
            "  [{}] {:<28} {:.4} {} {:.4}\n",
            mark, c.name, c.value, c.comparison, c.limit
        ));
    }
    output
}

/// Format a gate retraining report for the terminal
pub fn format_gate_report(report: &GateRetrainReport) -> String {
    let mut output = format!(
        "\n{}\n  Run: {}\n  Base version: {}\n  Incidents: {} ({} labeled nodes, {} failed)\n  Learning rate: {}\n  Epochs run: {}/{}\n",
        "Gate Retraining".bold().green(),
        report.run_id.to_string().dimmed(),
        report.base_version.to_string().cyan(),
        report.dataset.incidents,
        report.dataset.labeled_nodes,
        report.dataset.failed_nodes,
        report.learning_rate,
        report.epochs.len(),
        report.epochs_requested,
    );

    output.push_str(&format!(
        "  Crossing rate: {:.3} -> {:.3}\n",
        report.pre_metrics.crossing_rate, report.post_metrics.crossing_rate
    ));
    if let Some(last) = report.epochs.last() {
        output.push_str(&format!(
            "  Final gate: mean {:.3}, std {:.3}\n",
            last.gate_mean, last.gate_std
        ));
    }

    output.push_str(&format!("\n{}\n", "Criteria:".bold().cyan()));
    output.push_str(&format_criteria(&report.criteria));

    for warning in &report.warnings {
        output.push_str(&format!("{}\n", format_warning(warning)));
    }
    output
}

/// Format a counterfactual delta report
pub fn format_delta_report(report: &DeltaReport, show_all: bool) -> String {
    let mut output = format!(
        "\n{} node {} ({})\n",
        "Simulated failure of".bold().green(),
        report.forced_node.to_string().cyan(),
        variant_name(&report.failure_mode).yellow(),
    );
    output.push_str(&format!(
        "  {:>6}  {:<10} {:>8} {:>8} {:>8} {:>5}  {}\n",
        "node", "type", "base", "sim", "delta", "hops", "risk"
    ));

    for d in &report.nodes {
        if !show_all && !d.affected && d.node_id != report.forced_node {
            continue;
        }
        let delta = format!("{:+.4}", d.delta);
        let delta = if d.delta > 0.0 {
            delta.red()
        } else if d.delta < 0.0 {
            delta.green()
        } else {
            delta.normal()
        };
        output.push_str(&format!(
            "  {:>6}  {:<10} {:>8.4} {:>8.4} {:>8} {:>5}  {}\n",
            d.node_id,
            d.node_type.name(),
            d.baseline,
            d.counterfactual,
            delta,
            d.hops.map_or_else(|| "-".to_string(), |h| h.to_string()),
            variant_name(&d.risk),
        ));
    }
    output
}

/// Format hop-distance buckets of a cascade
pub fn format_cascade(analysis: &CascadeAnalysis) -> String {
    let mut output = format!(
        "\n{}\n  Affected nodes: {}\n  Cascade depth: {}\n",
        "Cascade Analysis".bold().green(),
        analysis.affected_count.to_string().cyan(),
        analysis.cascade_depth.to_string().cyan(),
    );
    for bucket in &analysis.buckets {
        output.push_str(&format!(
            "  {} hop(s): {:?} (mean amplified {:.3})\n",
            bucket.distance, bucket.nodes, bucket.mean_amplified
        ));
    }
    if !analysis.unreachable_affected.is_empty() {
        output.push_str(&format!(
            "  {} {:?}\n",
            "Affected without a path:".yellow(),
            analysis.unreachable_affected
        ));
    }
    output
}

/// Format a backtest report with one line per incident
pub fn format_backtest(report: &BacktestReport) -> String {
    let mut output = format!(
        "\n{} (model version {}, top-{}, threshold {})\n",
        "Backtest".bold().green(),
        report.model_version.to_string().cyan(),
        report.k,
        report.threshold,
    );
    output.push_str(&format!(
        "  {:<24} {:>6} {:>8} {:>8} {:>6} {:>8}  {}\n",
        "incident", "known", "mae", "f1", "p@k", "r@k", "top nodes"
    ));
    for r in &report.results {
        let top: Vec<String> = r.top_nodes.iter().map(|n| n.node_id.to_string()).collect();
        output.push_str(&format!(
            "  {:<24} {:>6} {:>8.4} {:>8.3} {:>6.2} {:>8.2}  {}\n",
            r.incident_id,
            r.known_labels,
            r.mae,
            r.f1,
            r.ranking.precision_at_k,
            r.ranking.recall_at_k,
            top.join(","),
        ));
    }
    if !report.skipped.is_empty() {
        output.push_str(&format!(
            "{}\n",
            format_warning(&format!("Skipped without labels: {}", report.skipped.join(", ")))
        ));
    }
    output.push_str(&format!("\n{}\n", "Summary:".bold().cyan()));
    output.push_str(&format_summary(&report.summary));
    output
}

fn format_summary(s: &BacktestSummary) -> String {
    format!(
        "  Incidents: {}\n  MAE: {:.4}  RMSE: {:.4}\n  Accuracy: {:.1}%  Precision: {:.1}%  Recall: {:.1}%  F1: {:.3}\n  Precision@k: {:.1}%  Recall@k: {:.1}%\n",
        s.evaluated,
        s.mean_mae,
        s.mean_rmse,
        s.mean_accuracy * 100.0,
        s.mean_precision * 100.0,
        s.mean_recall * 100.0,
        s.mean_f1,
        s.mean_precision_at_k * 100.0,
        s.mean_recall_at_k * 100.0,
    )
}

/// Side-by-side table of two backtested models
pub fn format_comparison(cmp: &ModelComparison) -> String {
    let (b, c) = (&cmp.baseline.summary, &cmp.candidate.summary);
    let mut output = format!(
        "\n{}\n  {:<14} {:>12} {:>12}\n",
        "Model Comparison".bold().green(),
        "metric",
        format!("v{}", cmp.baseline.model_version),
        format!("v{}", cmp.candidate.model_version),
    );
    let rows = [
        ("mae", b.mean_mae, c.mean_mae),
        ("rmse", b.mean_rmse, c.mean_rmse),
        ("accuracy", b.mean_accuracy, c.mean_accuracy),
        ("f1", b.mean_f1, c.mean_f1),
        ("precision@k", b.mean_precision_at_k, c.mean_precision_at_k),
        ("recall@k", b.mean_recall_at_k, c.mean_recall_at_k),
    ];
    for (name, base, cand) in rows {
        output.push_str(&format!("  {:<14} {:>12.4} {:>12.4}\n", name, base, cand));
    }
    output.push_str(&format!("  MAE change: {:+.1}%\n", cmp.mae_improvement_pct));
    let verdict = if cmp.candidate_better() {
        format_success("Candidate improves on the baseline")
    } else {
        format_warning("Candidate does not improve on the baseline")
    };
    output.push_str(&format!("{}\n", verdict));
    output
}

//! Human and machine rendering of run outcomes.

use anyhow::{Context, Result};
use colored::Colorize;

use crate::classify::HealthState;
use crate::reconciler::{ActionOutcome, FinalState, ReconcileOutcome};
use crate::workload::WorkloadSnapshot;

/// Output format, shared by every subcommand.
#[derive(Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

fn colored_final_state(state: FinalState) -> String {
    match state {
        FinalState::Healthy => state.as_str().green().to_string(),
        FinalState::Degraded => state.as_str().yellow().to_string(),
        FinalState::Failed => state.as_str().red().to_string(),
    }
}

fn colored_health(state: HealthState) -> String {
    match state {
        HealthState::Healthy => state.as_str().green().to_string(),
        HealthState::Failed => state.as_str().red().to_string(),
        _ => state.as_str().yellow().to_string(),
    }
}

/// Render a finished run, including the full ordered remediation log.
pub fn render_outcome(outcome: &ReconcileOutcome, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(outcome).context("failed to serialize outcome")
        }
        OutputFormat::Text => {
            let mut out = String::new();
            out.push_str(&format!(
                "reconciliation {} for {} ({})\n",
                outcome.run_id,
                outcome.workload.selector.bold(),
                outcome.workload.namespace
            ));
            out.push_str(&format!(
                "  final state:   {}\n",
                colored_final_state(outcome.final_state)
            ));
            out.push_str(&format!("  attempts used: {}\n", outcome.attempts_used));
            if outcome.records.is_empty() {
                out.push_str("  remediations:  none\n");
            } else {
                out.push_str("  remediations:\n");
                for record in &outcome.records {
                    let after = record
                        .state_after
                        .map_or_else(|| "?".to_string(), |s| s.as_str().to_string());
                    let outcome_note = match &record.outcome {
                        Some(ActionOutcome::Applied { detail }) => detail.clone(),
                        Some(ActionOutcome::Failed { error }) => {
                            format!("{} {error}", "failed:".red())
                        }
                        None => "interrupted".to_string(),
                    };
                    out.push_str(&format!(
                        "    [attempt {}] {} ({} -> {}): {}\n",
                        record.attempt,
                        record.action.to_string().bold(),
                        record.state_before,
                        after,
                        outcome_note
                    ));
                }
            }
            Ok(out)
        }
    }
}

/// Render a single observation for `mend status`.
pub fn render_status(
    snapshot: &WorkloadSnapshot,
    state: HealthState,
    format: OutputFormat,
) -> Result<String> {
    match format {
        OutputFormat::Json => {
            let value = serde_json::json!({
                "state": state,
                "pods": snapshot.pods,
                "workloads": snapshot.workloads,
            });
            serde_json::to_string_pretty(&value).context("failed to serialize status")
        }
        OutputFormat::Text => {
            let mut out = String::new();
            out.push_str(&format!("state: {}\n", colored_health(state)));
            out.push_str(&format!(
                "desired replicas: {}\n",
                snapshot.desired_replicas()
            ));
            if snapshot.pods.is_empty() {
                out.push_str("pods: none\n");
            } else {
                out.push_str("pods:\n");
                for pod in &snapshot.pods {
                    let readiness = if pod.ready { "ready" } else { "not ready" };
                    let reason = pod
                        .reason
                        .as_deref()
                        .map_or(String::new(), |r| format!(" ({r})"));
                    out.push_str(&format!(
                        "  {} {} {}{}\n",
                        pod.name,
                        pod.phase.as_str(),
                        readiness,
                        reason
                    ));
                }
            }
            Ok(out)
        }
    }
}

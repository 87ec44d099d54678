//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ConfigHasher, ValidationResult};
use crate::planner::{DiffAction, ExecutionPlan, NodeStatus, PlanStatus, StepAction};
use crate::reconciler::{ApplyResult, Drift, DriftReport, RefreshReport};
use crate::state::{ActualStateRecord, LockInfo, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan step row for table display.
#[derive(Tabled)]
struct PlanStepRow {
    #[tabled(rename = "Batch")]
    batch: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Changes")]
    changes: String,
}

/// Record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
    #[tabled(rename = "Modified")]
    modified: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats an execution plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &ExecutionPlan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &ExecutionPlan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nExecution Plan\n");
        let _ = write!(
            output,
            "   Config hash: {}\n\n",
            ConfigHasher::new().short_hash(&plan.config_hash)
        );

        let rows: Vec<PlanStepRow> = plan
            .batches
            .iter()
            .enumerate()
            .flat_map(|(index, batch)| batch.iter().map(move |id| (index, id)))
            .filter_map(|(index, id)| plan.step(id).map(|step| (index, step)))
            .map(|(index, step)| PlanStepRow {
                batch: index + 1,
                action: Self::format_step_action(step.action),
                resource: step.id.address.clone(),
                changes: Self::truncate(
                    &step
                        .changes
                        .iter()
                        .map(|c| c.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                    40,
                ),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nChanges:\n");
            for entry in plan.diff.actionable() {
                let _ = writeln!(output, "   {} {}", Self::format_diff_action(entry.action), entry.address);
                for change in &entry.changes {
                    let _ = writeln!(output, "       {change}");
                }
                if !entry.deposed.is_empty() {
                    let _ = writeln!(output, "       deposed: {}", entry.deposed.join(", "));
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy.\n",
            plan.diff.creates().to_string().green(),
            plan.diff.updates().to_string().yellow(),
            plan.diff.replaces().to_string().magenta(),
            plan.diff.destroys().to_string().red()
        );

        output
    }

    /// Formats the result of an apply or destroy run.
    #[must_use]
    pub fn format_apply(&self, result: &ApplyResult) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(result).unwrap_or_default(),
            OutputFormat::Text => {
                let status = match result.report.status {
                    PlanStatus::Succeeded => format!("{} Apply complete", "✓".green()),
                    PlanStatus::Failed => format!("{} Apply finished with errors", "✗".red()),
                    PlanStatus::Cancelled => format!("{} Apply cancelled", "⚠".yellow()),
                };

                let mut output = format!("{status}\n\n");
                let _ = writeln!(output, "   Created: {}", result.created);
                let _ = writeln!(output, "   Updated: {}", result.updated);
                let _ = writeln!(output, "   Replaced: {}", result.replaced);
                let _ = writeln!(output, "   Destroyed: {}", result.destroyed);
                let _ = writeln!(output, "   Unchanged: {}", result.unchanged);
                let _ = writeln!(
                    output,
                    "   Duration: {:.1}s",
                    result.report.duration.as_secs_f64()
                );

                let problems: Vec<_> = result
                    .report
                    .outcomes
                    .iter()
                    .filter(|(_, o)| o.status != NodeStatus::Succeeded)
                    .collect();
                if !problems.is_empty() {
                    let _ = write!(output, "\n{} Not applied:\n", "⚠".yellow());
                    for (id, outcome) in problems {
                        let _ = writeln!(
                            output,
                            "   - {id} [{}] {}",
                            outcome.status,
                            outcome.error.as_deref().unwrap_or("")
                        );
                    }
                }

                for message in &result.output_errors {
                    let _ = writeln!(output, "{} {message}", "⚠".yellow());
                }

                if !result.outputs.is_empty() {
                    output.push_str("\nOutputs:\n");
                    output.push_str(&Self::format_outputs_text(&result.outputs));
                }

                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!(
                        "{} No drift detected - {} resources match their providers.\n",
                        "✓".green(),
                        report.checked
                    );
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for (address, drift) in &report.drifted {
                    match drift {
                        Drift::Missing => {
                            let _ = writeln!(output, "   - {address}: {}", "missing".red());
                        }
                        Drift::Changed { changes } => {
                            let _ = writeln!(output, "   - {address}:");
                            for change in changes {
                                let _ = writeln!(output, "       {change}");
                            }
                        }
                    }
                }
                for (address, message) in &report.errors {
                    let _ = writeln!(output, "   {} {address}: {message}", "✗".red());
                }
                let _ = write!(
                    output,
                    "\n{}/{} resources have drifted.\n",
                    report.drifted.len(),
                    report.checked
                );
                output
            }
        }
    }

    /// Formats a refresh report.
    #[must_use]
    pub fn format_refresh(&self, report: &RefreshReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = format!("{} Refresh complete\n\n", "✓".green());
                for address in &report.updated {
                    let _ = writeln!(output, "   ~ {address} updated");
                }
                for address in &report.removed {
                    let _ = writeln!(output, "   - {address} no longer exists, record dropped");
                }
                for (address, message) in &report.errors {
                    let _ = writeln!(output, "   {} {address}: {message}", "✗".red());
                }
                let _ = writeln!(output, "\n   Unchanged: {}", report.unchanged.len());
                output
            }
        }
    }

    /// Formats output values, or a single one.
    #[must_use]
    pub fn format_outputs(&self, outputs: &BTreeMap<String, Value>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(outputs).unwrap_or_default(),
            OutputFormat::Text => Self::format_outputs_text(outputs),
        }
    }

    fn format_outputs_text(outputs: &BTreeMap<String, Value>) -> String {
        let mut output = String::new();
        for (name, value) in outputs {
            let _ = writeln!(output, "   {} = {}", name.bold(), Self::display_value(value));
        }
        output
    }

    /// Renders a value without quotes around plain strings.
    #[must_use]
    pub fn display_value(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Formats the state snapshot summary.
    #[must_use]
    pub fn format_state(&self, state: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Lineage: {}", state.lineage);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.records.len());
                let _ = writeln!(output, "   Outputs: {}", state.outputs.len());

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({} resources)",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.len()
                        );
                        if let Some(error) = &entry.error {
                            let _ = writeln!(output, "         {}", Self::truncate(error, 80));
                        }
                    }
                }

                output
            }
        }
    }

    /// Formats recorded resources as a table.
    #[must_use]
    pub fn format_records(&self, records: &BTreeMap<String, ActualStateRecord>) -> String {
        match self.format {
            OutputFormat::Json => {
                let list: Vec<&ActualStateRecord> = records.values().collect();
                serde_json::to_string_pretty(&list).unwrap_or_default()
            }
            OutputFormat::Text => {
                if records.is_empty() {
                    return String::from("   No resources recorded.\n");
                }
                let rows: Vec<RecordRow> = records
                    .values()
                    .map(|r| RecordRow {
                        address: r.address.clone(),
                        id: Self::truncate(&r.id, 24),
                        dependencies: r.dependencies.iter().cloned().collect::<Vec<_>>().join(", "),
                        modified: r.last_modified.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                let mut output = Table::new(rows).to_string();
                output.push('\n');
                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(lock).unwrap_or_default(),
            OutputFormat::Text => format!(
                "State locked by {} for {} (lock {}, expires in {}s)\n",
                lock.holder,
                lock.operation,
                lock.lock_id,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.is_valid(),
                    "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "warnings": result.warnings,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Configuration is valid!\n", "✓".green())
                } else {
                    format!("{} Configuration is invalid:\n", "✗".red())
                };
                for error in &result.errors {
                    let _ = writeln!(output, "   - {error}");
                }
                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats a step action with color.
    fn format_step_action(action: StepAction) -> String {
        match action {
            StepAction::Create => "+create".green().to_string(),
            StepAction::Update => "~update".yellow().to_string(),
            StepAction::Destroy => "-destroy".red().to_string(),
            StepAction::CreateReplacement => "+create (replace)".magenta().to_string(),
            StepAction::DestroyForReplace => "-destroy (replace)".magenta().to_string(),
            StepAction::DestroyDeposed => "-destroy deposed".red().to_string(),
        }
    }

    /// Formats a diff action with color.
    fn format_diff_action(action: DiffAction) -> String {
        match action {
            DiffAction::Create => "+".green().to_string(),
            DiffAction::Update => "~".yellow().to_string(),
            DiffAction::Replace => "-/+".magenta().to_string(),
            DiffAction::Destroy => "-".red().to_string(),
            DiffAction::NoOp => " ".to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &format!("{} {message}", "✓".green()), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.message("error", &format!("{} {message}", "✗".red()), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", &format!("{} {message}", "⚠".yellow()), message)
    }

    fn message(&self, status: &str, text: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "status": status, "message": message });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => text.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("abcdefghijkl", 8), "abcde...");
        assert_eq!(OutputFormatter::truncate("ééééééé", 5), "éé...");
    }

    #[test]
    fn test_outputs_json_and_text() {
        let outputs = BTreeMap::from([
            (String::from("ip"), json!("1.2.3.4")),
            (String::from("ports"), json!([22, 80])),
        ]);

        let json_text = OutputFormatter::new(OutputFormat::Json).format_outputs(&outputs);
        let parsed: Value = serde_json::from_str(&json_text).expect("valid json");
        assert_eq!(parsed["ip"], json!("1.2.3.4"));

        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_outputs(&outputs);
        assert!(text.contains("ip = 1.2.3.4"));
        assert!(text.contains("ports = [22,80]"));
    }

    #[test]
    fn test_json_messages() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let parsed: Value = serde_json::from_str(&formatter.error("boom")).expect("valid json");
        assert_eq!(parsed["status"], "error");
        assert_eq!(parsed["message"], "boom");
    }
}

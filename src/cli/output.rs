//! CLI output formatting (JSON, YAML, table).
//!
//! All CLI output supports structured formats for machine consumption.

use crate::core::error::{ErrorCategory, ExitCode, TasklogError};
use crate::core::workspace::{IssueRow, StatusReport, TaskRow};
use comfy_table::{Cell, Table};
use serde::Serialize;

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// Machine-readable JSON format.
    Json,
    /// YAML output format.
    Yaml,
}

/// Structured CLI response.
#[derive(Debug, Serialize)]
pub struct CliResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorOutput>,
}

/// Structured error output.
#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub category: String,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl From<&TasklogError> for ErrorOutput {
    fn from(err: &TasklogError) -> Self {
        Self {
            category: err.category.to_string(),
            code: err.code.clone(),
            message: err.message.clone(),
            hint: err.recovery_hint.clone(),
        }
    }
}

impl<T: Serialize> CliResponse<T> {
    /// Creates a successful response with data.
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Creates an error response.
    pub fn error(err: &TasklogError) -> CliResponse<()> {
        CliResponse {
            success: false,
            data: None,
            error: Some(ErrorOutput::from(err)),
        }
    }
}

/// Outputs data in the specified format.
pub fn output<T: Serialize>(data: T, format: OutputFormat) -> std::io::Result<()> {
    match format {
        OutputFormat::Json => {
            let response = CliResponse::success(data);
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        OutputFormat::Table => {
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        OutputFormat::Yaml => {
            let response = CliResponse::success(data);
            if let Ok(yaml) = serde_yaml::to_string(&response) {
                print!("{yaml}");
            }
        }
    }
    Ok(())
}

/// Outputs an error in the specified format.
pub fn output_error(err: &TasklogError, format: OutputFormat) -> ExitCode {
    match format {
        OutputFormat::Json => {
            let response = CliResponse::<()>::error(err);
            if let Ok(json) = serde_json::to_string_pretty(&response) {
                eprintln!("{json}");
            }
        }
        OutputFormat::Yaml => {
            let response = CliResponse::<()>::error(err);
            if let Ok(yaml) = serde_yaml::to_string(&response) {
                eprint!("{yaml}");
            }
        }
        OutputFormat::Table => {
            eprintln!("Error: {err}");
            if let Some(hint) = &err.recovery_hint {
                eprintln!("Hint: {hint}");
            }
        }
    }
    error_to_exit_code(err)
}

/// Maps error codes to exit codes per CLI operational semantics.
fn error_to_exit_code(err: &TasklogError) -> ExitCode {
    if err.category == ErrorCategory::Verification {
        return ExitCode::VerifyFailed;
    }
    match err.code.as_str() {
        c if c.contains("not_found") => ExitCode::NotFound,
        c if c.contains("conflict") || c.contains("duplicate") => ExitCode::Conflict,
        "init_blocked" | "writer_locked" => ExitCode::Conflict,
        _ => ExitCode::Error,
    }
}

/// Helper to create a table with headers.
#[must_use]
pub fn create_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_header(headers.iter().map(|h| Cell::new(*h)));
    table
}

/// Trait for types that can be displayed as a table row.
pub trait TableRow {
    fn to_row(&self) -> Vec<String>;
}

impl TableRow for TaskRow {
    fn to_row(&self) -> Vec<String> {
        vec![
            self.task_id.clone(),
            self.task_kind.to_string(),
            self.status.to_string(),
            self.assigned_to.clone().unwrap_or_else(|| "-".to_string()),
            self.attempts.to_string(),
            self.blocked_by.clone().unwrap_or_else(|| "-".to_string()),
            self.title.clone(),
        ]
    }
}

impl TableRow for IssueRow {
    fn to_row(&self) -> Vec<String> {
        vec![
            self.issue_id.clone(),
            self.severity.as_str().to_string(),
            self.task_id.clone().unwrap_or_else(|| "-".to_string()),
            self.title.clone(),
        ]
    }
}

/// Renders `status` for terminals: a run line, the task table and, when
/// present, the open issues.
#[must_use]
pub fn render_status(report: &StatusReport) -> String {
    let mut out = format!(
        "run {} ({}) verify={} seq={} hash={}\n",
        report.run_id.as_deref().unwrap_or("-"),
        report.run_status.as_str(),
        report.verify_status,
        report.last_event_seq,
        report.projection_hash_sha256.get(..12).unwrap_or("-"),
    );
    let mut tasks = create_table(&[
        "TASK", "KIND", "STATUS", "ASSIGNEE", "ATTEMPTS", "BLOCKED BY", "TITLE",
    ]);
    for row in &report.tasks {
        tasks.add_row(row.to_row());
    }
    out.push_str(&tasks.to_string());
    if !report.open_issues.is_empty() {
        let mut issues = create_table(&["ISSUE", "SEVERITY", "TASK", "TITLE"]);
        for row in &report.open_issues {
            issues.add_row(row.to_row());
        }
        out.push_str("\n\nOpen issues\n");
        out.push_str(&issues.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct TestData {
        name: String,
        value: i32,
    }

    #[test]
    fn cli_response_success_serialization() {
        let data = TestData {
            name: "test".to_string(),
            value: 42,
        };
        let response = CliResponse::success(data);
        let json = serde_json::to_string(&response).unwrap();

        assert!(json.contains("\"success\":true"));
        assert!(json.contains("\"name\":\"test\""));
    }

    #[test]
    fn cli_response_error_serialization() {
        let err =
            TasklogError::user("invalid", "Invalid input", "cli:test").with_hint("Try again");
        let response = CliResponse::<()>::error(&err);
        let json = serde_json::to_string(&response).unwrap();

        assert!(json.contains("\"success\":false"));
        assert!(json.contains("\"code\":\"invalid\""));
    }

    #[test]
    fn exit_codes_follow_error_codes() {
        let code = |err: TasklogError| error_to_exit_code(&err);
        assert_eq!(
            code(TasklogError::user("event_not_found", "x", "t")),
            ExitCode::NotFound
        );
        assert_eq!(
            code(TasklogError::user("init_blocked", "x", "t")),
            ExitCode::Conflict
        );
        assert_eq!(
            code(TasklogError::user("task_conflict", "x", "t")),
            ExitCode::Conflict
        );
        assert_eq!(
            code(TasklogError::verification("jsonl_invalid", "x", "t")),
            ExitCode::VerifyFailed
        );
        assert_eq!(
            code(TasklogError::user("dependency_cycle", "x", "t")),
            ExitCode::Error
        );
    }
}

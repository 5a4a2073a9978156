//! Per-resource outcomes of an orchestration run.

use std::fmt;

use colored::Colorize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Project,
    Network,
    Vm,
    Access,
    File,
    Snapshot,
    /// The container hosting libvirt.
    Runtime,
    Template,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Project => "project",
            Self::Network => "network",
            Self::Vm => "vm",
            Self::Access => "access",
            Self::File => "file",
            Self::Snapshot => "snapshot",
            Self::Runtime => "runtime",
            Self::Template => "template",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Created,
    Updated,
    Skipped,
    Removed,
    Degraded,
    Failed,
}

impl Outcome {
    fn label(self) -> colored::ColoredString {
        match self {
            Self::Created => "created".green(),
            Self::Updated => "updated".cyan(),
            Self::Skipped => "skipped".dimmed(),
            Self::Removed => "removed".blue(),
            Self::Degraded => "degraded".yellow().bold(),
            Self::Failed => "failed".red().bold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceReport {
    pub kind: ResourceKind,
    pub name: String,
    pub outcome: Outcome,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Degraded,
    Failed,
}

impl RunStatus {
    /// 0 success, 1 failed, 2 degraded only.
    #[must_use]
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failed => 1,
            Self::Degraded => 2,
        }
    }
}

/// Every resource touched by a run, in the order it was handled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub resources: Vec<ResourceReport>,
}

impl RunReport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        kind: ResourceKind,
        name: impl Into<String>,
        outcome: Outcome,
        detail: Option<String>,
    ) {
        self.resources.push(ResourceReport {
            kind,
            name: name.into(),
            outcome,
            detail,
        });
    }

    pub fn ok(&mut self, kind: ResourceKind, name: impl Into<String>, outcome: Outcome) {
        self.record(kind, name, outcome, None);
    }

    pub fn failed(&mut self, kind: ResourceKind, name: impl Into<String>, error: impl fmt::Display) {
        self.record(kind, name, Outcome::Failed, Some(error.to_string()));
    }

    pub fn degraded(
        &mut self,
        kind: ResourceKind,
        name: impl Into<String>,
        reason: impl fmt::Display,
    ) {
        self.record(kind, name, Outcome::Degraded, Some(reason.to_string()));
    }

    /// Resources with the given outcome.
    pub fn with_outcome(&self, outcome: Outcome) -> impl Iterator<Item = &ResourceReport> {
        self.resources.iter().filter(move |r| r.outcome == outcome)
    }

    #[must_use]
    pub fn failures(&self) -> Vec<&ResourceReport> {
        self.with_outcome(Outcome::Failed).collect()
    }

    /// Outcome of the last entry recorded for `name`.
    #[must_use]
    pub fn outcome_of(&self, kind: ResourceKind, name: &str) -> Option<Outcome> {
        self.resources
            .iter()
            .rev()
            .find(|r| r.kind == kind && r.name == name)
            .map(|r| r.outcome)
    }

    #[must_use]
    pub fn status(&self) -> RunStatus {
        if self.with_outcome(Outcome::Failed).next().is_some() {
            RunStatus::Failed
        } else if self.with_outcome(Outcome::Degraded).next().is_some() {
            RunStatus::Degraded
        } else {
            RunStatus::Success
        }
    }

    #[must_use]
    pub fn exit_code(&self) -> u8 {
        self.status().exit_code()
    }

    /// Print one line per resource and an overall status line.
    pub fn print_summary(&self, title: &str) {
        println!("\n{}", title.bold());
        let width = self
            .resources
            .iter()
            .map(|r| r.name.len())
            .max()
            .unwrap_or(0);
        for r in &self.resources {
            let detail = r.detail.as_deref().map(|d| format!("  {d}")).unwrap_or_default();
            println!(
                "  {:<8} {:<width$}  {}{}",
                r.kind.to_string(),
                r.name,
                r.outcome.label(),
                detail.dimmed(),
            );
        }
        let status = match self.status() {
            RunStatus::Success => "success".green().bold(),
            RunStatus::Degraded => "degraded".yellow().bold(),
            RunStatus::Failed => "failed".red().bold(),
        };
        println!("\nResult: {status}");
    }
}

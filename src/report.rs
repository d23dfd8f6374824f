use std::fmt::Write as _;

use colored::Colorize;
use indicatif::HumanBytes;
use serde::{Deserialize, Serialize};

use crate::catalog::ModelSpec;

/// Per-artifact result of a fetch session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ArtifactStatus {
    AlreadySatisfied,
    Completed,
    Failed { reason: String },
}

impl ArtifactStatus {
    pub fn is_ok(&self) -> bool {
        !matches!(self, ArtifactStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReport {
    pub name: String,
    pub url: String,
    #[serde(flatten)]
    pub status: ArtifactStatus,
    /// Download attempts made; zero when the file was already present.
    pub attempts: u32,
    /// Final file size in bytes, zero on failure.
    pub size: u64,
}

impl ArtifactReport {
    pub fn new(spec: &ModelSpec, status: ArtifactStatus, attempts: u32, size: u64) -> Self {
        Self { name: spec.name.clone(), url: spec.source_url.clone(), status, attempts, size }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    pub artifacts: Vec<ArtifactReport>,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.artifacts.iter().all(|a| a.status.is_ok())
    }

    pub fn failed_names(&self) -> Vec<&str> {
        self.artifacts
            .iter()
            .filter(|a| !a.status.is_ok())
            .map(|a| a.name.as_str())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&ArtifactReport> {
        self.artifacts.iter().find(|a| a.name == name)
    }

    /// Human-readable summary, one line per artifact plus a verdict.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for a in &self.artifacts {
            let line = match &a.status {
                ArtifactStatus::AlreadySatisfied => {
                    format!("{} {} ({}, already present)", "=".dimmed(), a.name, HumanBytes(a.size))
                }
                ArtifactStatus::Completed => format!(
                    "{} {} ({}, {} attempt{})",
                    "✓".green(),
                    a.name,
                    HumanBytes(a.size),
                    a.attempts,
                    if a.attempts == 1 { "" } else { "s" }
                ),
                ArtifactStatus::Failed { reason } => {
                    format!("{} {} after {} attempts: {}", "✗".red(), a.name, a.attempts, reason)
                }
            };
            let _ = writeln!(out, "{line}");
        }
        let failed = self.failed_names();
        if failed.is_empty() {
            let _ = writeln!(out, "{}", format!("all {} models ready", self.artifacts.len()).green().bold());
        } else {
            let _ = writeln!(out, "{} {}", "failed:".red().bold(), failed.join(", "));
        }
        out
    }
}

/// Local presence of an artifact, checked without network access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum LocalState {
    Present { size: u64 },
    Missing,
}

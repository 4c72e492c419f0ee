// src/ingest.rs
//! The per-source ingest collaborator. Parsing/transforming a state's file lives
//! behind this trait; the engine only sees all-or-nothing `IngestStats`.

use anyhow::{anyhow, bail, Context, Result};
use std::process::Stdio;
use tokio::process::Command;

use crate::model::IngestStats;

#[async_trait::async_trait]
pub trait Ingestor: Send + Sync {
    async fn ingest(&self, source_id: &str) -> Result<IngestStats>;
}

/// Runs an external importer as `<program> <args..> <source_id>` and reads an
/// `IngestStats` JSON object from its stdout. Non-zero exit is a failed ingest.
#[derive(Debug, Clone)]
pub struct CommandIngestor {
    program: String,
    args: Vec<String>,
}

impl CommandIngestor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait::async_trait]
impl Ingestor for CommandIngestor {
    async fn ingest(&self, source_id: &str) -> Result<IngestStats> {
        let out = Command::new(&self.program)
            .args(&self.args)
            .arg(source_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawning importer {:?}", self.program))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let stderr = stderr.trim();
            // keep the last 500 chars
            let start = stderr
                .char_indices()
                .rev()
                .nth(499)
                .map(|(i, _)| i)
                .unwrap_or(0);
            bail!("importer exited with {}: {}", out.status, &stderr[start..]);
        }

        let stdout = String::from_utf8_lossy(&out.stdout);
        // Importers may log before the summary; the last non-empty line is the JSON.
        let line = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| anyhow!("importer produced no output"))?;
        let stats: IngestStats = serde_json::from_str(line)
            .with_context(|| format!("parsing importer summary: {line}"))?;
        Ok(stats)
    }
}

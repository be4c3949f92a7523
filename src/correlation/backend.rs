//! External correlation collaborator.
//!
//! The statistics themselves are computed out of process. The
//! [`SubprocessCorrelator`] writes both vectors as JSON arrays on two
//! lines of the child's stdin and reads `"<coefficient> <p-value>"` from
//! the last line of its stdout.

use crate::config::CorrelationConfig;
use crate::error::CorrelationError;
use async_trait::async_trait;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Computes a Pearson correlation of two equal-length vectors.
#[async_trait]
pub trait Correlator: Send + Sync {
    /// Returns `(coefficient, p_value)`.
    async fn pearson(&self, left: &[f64], right: &[f64]) -> Result<(f64, f64), CorrelationError>;
}

/// Runs a configured program once per correlation.
pub struct SubprocessCorrelator {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl SubprocessCorrelator {
    pub fn new(config: &CorrelationConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    async fn run(&self, input: String) -> Result<Output, CorrelationError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CorrelationError::Failed(format!("cannot start {}: {}", self.command, e))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CorrelationError::Failed("child has no stdin".to_string()))?;
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| CorrelationError::Failed(format!("writing input: {}", e)))?;
        // Closing stdin signals end of input.
        drop(stdin);

        child
            .wait_with_output()
            .await
            .map_err(|e| CorrelationError::Failed(format!("waiting for {}: {}", self.command, e)))
    }
}

#[async_trait]
impl Correlator for SubprocessCorrelator {
    async fn pearson(&self, left: &[f64], right: &[f64]) -> Result<(f64, f64), CorrelationError> {
        let encode = |values: &[f64]| {
            serde_json::to_string(values).map_err(|e| CorrelationError::Failed(e.to_string()))
        };
        let input = format!("{}\n{}\n", encode(left)?, encode(right)?);

        debug!("Running {} on {} pairs", self.command, left.len());
        let output = tokio::time::timeout(self.timeout, self.run(input))
            .await
            .map_err(|_| CorrelationError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CorrelationError::Failed(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        parse_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse `"<coefficient> <p-value>"` from the last non-empty line.
pub fn parse_output(stdout: &str) -> Result<(f64, f64), CorrelationError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .ok_or_else(|| CorrelationError::Parse(stdout.to_string()))?;

    let mut fields = line.split_whitespace().map(str::parse::<f64>);
    match (fields.next(), fields.next(), fields.next()) {
        (Some(Ok(coefficient)), Some(Ok(p_value)), None) => Ok((coefficient, p_value)),
        _ => Err(CorrelationError::Parse(line.to_string())),
    }
}

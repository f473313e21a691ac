//! Ordered validation gates run inside the sandbox.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::sandbox::{CommandExecutor, Outcome, Quota};

/// Number of trailing characters of each stream kept in a [`GateResult`].
pub const OUTPUT_TAIL_CHARS: usize = 4000;

/// Exit code recorded when a gate's command cannot be started.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// A named validation command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSpec {
    /// Gate name (e.g. "lint").
    pub name: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
}

impl GateSpec {
    /// Creates a gate from a name and command words.
    pub fn new<I, S>(name: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            command: command.into_iter().map(Into::into).collect(),
        }
    }

    /// The canonical lint → types → tests → build pipeline for npm projects.
    pub fn default_pipeline() -> Vec<GateSpec> {
        vec![
            GateSpec::new("lint", ["npm", "run", "-s", "lint"]),
            GateSpec::new("types", ["npm", "run", "-s", "typecheck"]),
            GateSpec::new("tests", ["npm", "test", "-s", "--", "--watch=false"]),
            GateSpec::new("build", ["npm", "run", "-s", "build"]),
        ]
    }
}

/// Outcome of one gate in one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    /// Gate name.
    pub name: String,
    /// Whether the gate passed.
    pub ok: bool,
    /// Exit code of the gate command.
    pub exit_code: i32,
    /// Last [`OUTPUT_TAIL_CHARS`] characters of stdout.
    pub stdout_tail: String,
    /// Last [`OUTPUT_TAIL_CHARS`] characters of stderr.
    pub stderr_tail: String,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// How the sandboxed command ended, if it started.
    pub outcome: Option<Outcome>,
}

/// Results of running a gate list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    /// True if every gate ran and passed.
    pub all_ok: bool,
    /// Results in gate order. In short-circuit mode gates after the first
    /// failure are absent, meaning "not attempted".
    pub results: Vec<GateResult>,
    /// Index of the first failed gate.
    pub failed_at: Option<usize>,
}

impl GateReport {
    /// Name of the first failed gate.
    pub fn failed_gate(&self) -> Option<&str> {
        self.failed_at
            .and_then(|i| self.results.get(i))
            .map(|r| r.name.as_str())
    }
}

/// Runs gates sequentially through a [`CommandExecutor`].
#[derive(Clone)]
pub struct GateRunner {
    executor: Arc<dyn CommandExecutor>,
}

impl GateRunner {
    /// Creates a runner over `executor`.
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Runs gates in order and stops at the first failure.
    pub async fn run_gates(&self, gates: &[GateSpec], workdir: &Path, quota: &Quota) -> GateReport {
        self.run(gates, workdir, quota, true).await
    }

    /// Runs every gate regardless of earlier failures.
    ///
    /// Produces one result per gate so reports are comparable across candidates.
    pub async fn run_all(&self, gates: &[GateSpec], workdir: &Path, quota: &Quota) -> GateReport {
        self.run(gates, workdir, quota, false).await
    }

    async fn run(
        &self,
        gates: &[GateSpec],
        workdir: &Path,
        quota: &Quota,
        short_circuit: bool,
    ) -> GateReport {
        let mut results = Vec::with_capacity(gates.len());
        let mut failed_at = None;

        for (index, gate) in gates.iter().enumerate() {
            tracing::info!(gate = %gate.name, index, "running gate");
            let result = self.run_one(gate, workdir, quota).await;

            if result.ok {
                tracing::info!(gate = %gate.name, duration_ms = result.duration_ms, "gate passed");
            } else {
                tracing::warn!(
                    gate = %gate.name,
                    exit_code = result.exit_code,
                    outcome = ?result.outcome,
                    "gate failed"
                );
                failed_at.get_or_insert(index);
            }

            let stop = short_circuit && !result.ok;
            results.push(result);
            if stop {
                break;
            }
        }

        GateReport {
            all_ok: failed_at.is_none() && results.len() == gates.len(),
            results,
            failed_at,
        }
    }

    async fn run_one(&self, gate: &GateSpec, workdir: &Path, quota: &Quota) -> GateResult {
        match self.executor.run(&gate.command, workdir, quota).await {
            Ok(out) => GateResult {
                name: gate.name.clone(),
                ok: out.success(),
                exit_code: out.exit_code,
                stdout_tail: tail(&out.stdout, OUTPUT_TAIL_CHARS),
                stderr_tail: tail(&out.stderr, OUTPUT_TAIL_CHARS),
                duration_ms: out.duration_ms,
                outcome: Some(out.outcome),
            },
            Err(e) => GateResult {
                name: gate.name.clone(),
                ok: false,
                exit_code: SPAWN_FAILURE_EXIT_CODE,
                stdout_tail: String::new(),
                stderr_tail: format!("failed to start gate command: {}", e),
                duration_ms: 0,
                outcome: None,
            },
        }
    }
}

/// Last `max` characters of `s`.
fn tail(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    s.chars().skip(count - max).collect()
}

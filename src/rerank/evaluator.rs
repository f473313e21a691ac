//! Candidate evaluation in disposable workspaces.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::config::FortressConfig;
use crate::diff;
use crate::gates::{GateRunner, GateSpec};
use crate::git;
use crate::sandbox::{CommandExecutor, Quota, Workspace, WorkspaceProvider, WorktreeProvider};
use crate::secrets;

use super::candidate::Candidate;
use super::report::{EvaluationReport, GateCheck};

/// Judges one candidate without touching the shared repository.
#[async_trait]
pub trait CandidateEvaluator: Send + Sync {
    /// Evaluates `candidate`, the `index`-th generator's output.
    ///
    /// Failures are recorded in the report rather than returned.
    async fn evaluate(&self, index: usize, candidate: &Candidate) -> EvaluationReport;

    /// Names of the gates every report contains.
    fn gate_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Applies each candidate to a fresh workspace and runs every gate.
pub struct WorkspaceEvaluator<P: WorkspaceProvider> {
    provider: Arc<P>,
    gates: Vec<GateSpec>,
    quota: Quota,
    runner: GateRunner,
}

impl<P: WorkspaceProvider> WorkspaceEvaluator<P> {
    /// Creates an evaluator over `provider`'s workspaces.
    pub fn new(
        provider: P,
        gates: Vec<GateSpec>,
        quota: Quota,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            provider: Arc::new(provider),
            gates,
            quota,
            runner: GateRunner::new(executor),
        }
    }
}

impl WorkspaceEvaluator<WorktreeProvider> {
    /// Evaluator using detached worktrees of `repo` and the configured gates.
    pub fn for_repo(
        repo: impl Into<PathBuf>,
        config: &FortressConfig,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self::new(
            WorktreeProvider::new(repo.into(), None).with_excluded(config.control_dir.clone()),
            config.gates.clone(),
            config.quota,
            executor,
        )
    }
}

#[async_trait]
impl<P: WorkspaceProvider + 'static> CandidateEvaluator for WorkspaceEvaluator<P> {
    async fn evaluate(&self, index: usize, candidate: &Candidate) -> EvaluationReport {
        let started = Instant::now();
        let mut report = EvaluationReport::new(index, &candidate.name, &self.gate_names())
            .with_diff_line_count(diff::stats(&candidate.diff).line_count());

        report.violations = secrets::scan(&candidate.diff);
        report.secrets_ok = report.violations.is_empty();

        let provider = Arc::clone(&self.provider);
        let workspace = match git::unblock(move || provider.create()).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::error!(candidate = %candidate.name, error = %e, "failed to create workspace");
                report.error = Some(e.to_string());
                report.rescore();
                report.duration_ms = started.elapsed().as_millis() as u64;
                return report;
            }
        };

        let diff_text = candidate.diff.clone();
        let (mut workspace, applied) = match git::unblock(move || {
            let applied = git::apply(workspace.path(), &diff_text);
            Ok((workspace, applied))
        })
        .await
        {
            Ok(pair) => pair,
            Err(e) => {
                report.error = Some(e.to_string());
                report.rescore();
                report.duration_ms = started.elapsed().as_millis() as u64;
                return report;
            }
        };

        match applied {
            Ok(()) => report.apply_ok = true,
            Err(e) => {
                tracing::info!(candidate = %candidate.name, error = %e, "candidate does not apply");
                report.error = Some(e.to_string());
            }
        }

        if report.apply_ok && report.secrets_ok {
            let gates = self
                .runner
                .run_all(&self.gates, workspace.path(), &self.quota)
                .await;
            report.gates = gates.results.iter().map(GateCheck::from).collect();
        } else if !report.secrets_ok {
            tracing::warn!(
                candidate = %candidate.name,
                violations = report.violations.len(),
                "secrets detected, gates skipped"
            );
        }

        let cleaned = git::unblock(move || workspace.cleanup()).await;
        if let Err(e) = cleaned {
            tracing::warn!(candidate = %candidate.name, error = %e, "failed to remove workspace");
        }

        report.rescore();
        report.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            candidate = %candidate.name,
            index,
            score = report.score,
            max_score = report.max_score,
            lines = report.diff_line_count,
            "candidate evaluated"
        );
        report
    }

    fn gate_names(&self) -> Vec<String> {
        self.gates.iter().map(|g| g.name.clone()).collect()
    }
}

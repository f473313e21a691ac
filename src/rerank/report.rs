//! Per-candidate evaluation reports and their ranking order.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::gates::GateResult;
use crate::secrets::Violation;

/// Pass/fail of one gate for one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateCheck {
    /// Gate name.
    pub name: String,
    /// Whether the gate passed. False when it was not run.
    pub ok: bool,
    /// Exit code, if the gate ran.
    pub exit_code: Option<i32>,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

impl GateCheck {
    /// A gate that was never run.
    pub fn not_run(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: false,
            exit_code: None,
            duration_ms: 0,
        }
    }
}

impl From<&GateResult> for GateCheck {
    fn from(result: &GateResult) -> Self {
        Self {
            name: result.name.clone(),
            ok: result.ok,
            exit_code: Some(result.exit_code),
            duration_ms: result.duration_ms,
        }
    }
}

/// Outcome of evaluating one candidate. Never mutated once returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Position of the candidate's generator in the input list.
    pub index: usize,
    /// Candidate name.
    pub name: String,
    /// Whether the diff applied to a fresh workspace.
    pub apply_ok: bool,
    /// Whether the diff is free of secrets.
    pub secrets_ok: bool,
    /// One entry per configured gate, in gate order.
    pub gates: Vec<GateCheck>,
    /// Number of true checks among apply, secrets and gates.
    pub score: usize,
    /// Highest possible score.
    pub max_score: usize,
    /// Added plus removed lines.
    pub diff_line_count: usize,
    /// Secret findings (redacted).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
    /// Why the candidate could not be fully evaluated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration of the evaluation.
    pub duration_ms: u64,
}

impl EvaluationReport {
    /// All-false report with one unrun check per gate.
    pub fn new(index: usize, name: impl Into<String>, gate_names: &[String]) -> Self {
        let mut report = Self {
            index,
            name: name.into(),
            apply_ok: false,
            secrets_ok: false,
            gates: gate_names.iter().map(GateCheck::not_run).collect(),
            score: 0,
            max_score: 0,
            diff_line_count: 0,
            violations: Vec::new(),
            error: None,
            duration_ms: 0,
        };
        report.rescore();
        report
    }

    /// Records why evaluation stopped early.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Sets the diff line count.
    pub fn with_diff_line_count(mut self, lines: usize) -> Self {
        self.diff_line_count = lines;
        self
    }

    /// Recomputes `score` and `max_score` from the check flags.
    pub fn rescore(&mut self) {
        self.max_score = 2 + self.gates.len();
        self.score = usize::from(self.apply_ok)
            + usize::from(self.secrets_ok)
            + self.gates.iter().filter(|g| g.ok).count();
    }

    /// True if every check passed.
    pub fn is_green(&self) -> bool {
        self.score == self.max_score
    }
}

/// Ranking order: higher score, then fewer diff lines, then earlier input.
pub fn compare(a: &EvaluationReport, b: &EvaluationReport) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| a.diff_line_count.cmp(&b.diff_line_count))
        .then_with(|| a.index.cmp(&b.index))
}

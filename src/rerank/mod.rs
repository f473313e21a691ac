//! Execution-based reranking of competing patches.
//!
//! Every candidate is applied to its own disposable workspace and run
//! through every gate. Reports are ranked by score, then by diff size, then
//! by input position; the ranking never depends on completion order.

mod candidate;
mod evaluator;
mod report;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::diff;
use crate::error::{Error, Result};

pub use candidate::{fixed, Candidate, CandidateGenerator};
pub use evaluator::{CandidateEvaluator, WorkspaceEvaluator};
pub use report::{compare, EvaluationReport, GateCheck};

/// Reranker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RerankConfig {
    /// Maximum evaluations running at once.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Only the first `k` generators are used.
    #[serde(default)]
    pub max_candidates: Option<usize>,

    /// Diffs with more added plus removed lines are invalid candidates.
    #[serde(default)]
    pub max_diff_lines: Option<usize>,
}

fn default_parallelism() -> usize {
    2
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            max_candidates: None,
            max_diff_lines: None,
        }
    }
}

/// Ranked evaluation of all candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankResult {
    /// Best report under [`compare`].
    pub winner: EvaluationReport,
    /// True only if the winner passed every check.
    pub ok: bool,
    /// All reports, best first.
    pub candidates: Vec<EvaluationReport>,
}

/// Evaluates candidates concurrently and picks a deterministic winner.
#[derive(Debug, Clone, Default)]
pub struct Reranker {
    config: RerankConfig,
}

impl Reranker {
    /// Creates a reranker.
    pub fn new(config: RerankConfig) -> Self {
        Self { config }
    }

    /// Returns the settings.
    pub fn config(&self) -> &RerankConfig {
        &self.config
    }

    /// Invokes each generator once, evaluates every candidate and ranks them.
    ///
    /// Generator failures and invalid diffs become all-false reports.
    /// Fails only when there are no generators at all.
    pub async fn rerank(
        &self,
        generators: &[Box<dyn CandidateGenerator>],
        evaluator: Arc<dyn CandidateEvaluator>,
    ) -> Result<RerankResult> {
        let limit = self.config.max_candidates.unwrap_or(usize::MAX);
        let generators = &generators[..generators.len().min(limit)];
        if generators.is_empty() {
            return Err(Error::InvalidCandidate("no candidate generators".to_string()));
        }

        let gate_names = evaluator.gate_names();
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let mut slots: Vec<Option<EvaluationReport>> = vec![None; generators.len()];
        let mut tasks = JoinSet::new();

        for (index, generator) in generators.iter().enumerate() {
            let candidate = match generator.generate() {
                Ok(candidate) => candidate,
                Err(e) => {
                    tracing::warn!(index, error = %e, "candidate generator failed");
                    let name = format!("candidate-{}", index);
                    slots[index] = Some(invalid_report(index, name, &gate_names, &e));
                    continue;
                }
            };
            if let Err(e) = self.validate(&candidate) {
                tracing::warn!(index, candidate = %candidate.name, error = %e, "candidate rejected");
                slots[index] = Some(invalid_report(index, candidate.name, &gate_names, &e));
                continue;
            }

            let evaluator = Arc::clone(&evaluator);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let report = evaluator.evaluate(index, &candidate).await;
                (index, report)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, report)) => slots[index] = Some(report),
                Err(e) => tracing::error!(error = %e, "evaluation task failed"),
            }
        }

        let mut candidates: Vec<EvaluationReport> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    EvaluationReport::new(index, format!("candidate-{}", index), &gate_names)
                        .with_error("evaluation did not complete")
                })
            })
            .collect();
        candidates.sort_by(compare);

        let winner = candidates[0].clone();
        let ok = winner.is_green();
        tracing::info!(
            winner = %winner.name,
            index = winner.index,
            score = winner.score,
            max_score = winner.max_score,
            ok,
            "rerank winner selected"
        );

        Ok(RerankResult {
            winner,
            ok,
            candidates,
        })
    }

    fn validate(&self, candidate: &Candidate) -> Result<()> {
        if candidate.diff.trim().is_empty() {
            return Err(Error::InvalidCandidate(format!("{}: empty diff", candidate.name)));
        }
        if !diff::is_unified_diff(&candidate.diff) {
            return Err(Error::InvalidCandidate(format!(
                "{}: not a unified diff",
                candidate.name
            )));
        }
        if let Some(max) = self.config.max_diff_lines {
            let lines = diff::stats(&candidate.diff).line_count();
            if lines > max {
                return Err(Error::InvalidCandidate(format!(
                    "{}: diff has {} lines, limit is {}",
                    candidate.name, lines, max
                )));
            }
        }
        Ok(())
    }
}

/// Report for a candidate that never reached evaluation.
fn invalid_report(
    index: usize,
    name: String,
    gate_names: &[String],
    error: &Error,
) -> EvaluationReport {
    EvaluationReport::new(index, name, gate_names).with_error(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const GATES: &[&str] = &["lint", "types", "tests", "build"];

    /// Scripted verdicts per candidate name, with optional per-index delays
    /// to scramble completion order.
    struct ScriptedEvaluator {
        verdicts: HashMap<String, (bool, bool, Vec<bool>)>,
        delays_ms: Vec<u64>,
        calls: AtomicUsize,
    }

    impl ScriptedEvaluator {
        fn new(verdicts: &[(&str, bool, bool, [bool; 4])]) -> Self {
            Self {
                verdicts: verdicts
                    .iter()
                    .map(|(name, apply, secrets, gates)| {
                        (name.to_string(), (*apply, *secrets, gates.to_vec()))
                    })
                    .collect(),
                delays_ms: Vec::new(),
                calls: AtomicUsize::new(0),
            }
        }

        fn with_delays(mut self, delays_ms: &[u64]) -> Self {
            self.delays_ms = delays_ms.to_vec();
            self
        }
    }

    #[async_trait]
    impl CandidateEvaluator for ScriptedEvaluator {
        async fn evaluate(&self, index: usize, candidate: &Candidate) -> EvaluationReport {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(ms) = self.delays_ms.get(index) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }

            let names = self.gate_names();
            let mut report = EvaluationReport::new(index, &candidate.name, &names)
                .with_diff_line_count(diff::stats(&candidate.diff).line_count());
            if let Some((apply, secrets, gates)) = self.verdicts.get(&candidate.name) {
                report.apply_ok = *apply;
                report.secrets_ok = *secrets;
                for (check, ok) in report.gates.iter_mut().zip(gates) {
                    check.ok = *ok;
                }
            }
            report.rescore();
            report
        }

        fn gate_names(&self) -> Vec<String> {
            GATES.iter().map(|s| s.to_string()).collect()
        }
    }

    fn diff_with_lines(lines: usize) -> String {
        let mut diff = String::from("--- a/f.txt\n+++ b/f.txt\n@@ -1 +1 @@\n");
        for i in 0..lines {
            diff.push_str(&format!("+line {}\n", i));
        }
        diff
    }

    fn gens(candidates: &[(&str, usize)]) -> Vec<Box<dyn CandidateGenerator>> {
        candidates
            .iter()
            .map(|(name, lines)| fixed(Candidate::new(*name, diff_with_lines(*lines))))
            .collect()
    }

    const ALL: [bool; 4] = [true, true, true, true];

    #[tokio::test]
    async fn single_green_candidate_always_wins() {
        let verdicts = [
            ("a", true, true, [true, false, true, true]),
            ("b", true, true, ALL),
            ("c", false, true, [false; 4]),
        ];

        for (parallelism, delays) in [(1, vec![]), (3, vec![30, 10, 0]), (3, vec![0, 40, 5])] {
            let evaluator = Arc::new(ScriptedEvaluator::new(&verdicts).with_delays(&delays));
            let reranker = Reranker::new(RerankConfig {
                parallelism,
                ..RerankConfig::default()
            });

            let result = reranker
                .rerank(&gens(&[("a", 1), ("b", 50), ("c", 1)]), evaluator)
                .await
                .unwrap();

            assert_eq!(result.winner.name, "b");
            assert!(result.ok);
            let order: Vec<_> = result.candidates.iter().map(|c| c.name.as_str()).collect();
            assert_eq!(order, vec!["b", "a", "c"]);
        }
    }

    #[tokio::test]
    async fn smaller_diff_wins_among_green() {
        let verdicts = [("big", true, true, ALL), ("small", true, true, ALL)];
        let result = Reranker::default()
            .rerank(
                &gens(&[("big", 22), ("small", 4)]),
                Arc::new(ScriptedEvaluator::new(&verdicts)),
            )
            .await
            .unwrap();

        assert_eq!(result.winner.name, "small");
        assert_eq!(result.winner.diff_line_count, 4);
        assert_eq!(result.candidates[1].diff_line_count, 22);
    }

    #[tokio::test]
    async fn earliest_input_wins_full_ties() {
        let verdicts = [("first", true, true, ALL), ("second", true, true, ALL)];
        let result = Reranker::default()
            .rerank(
                &gens(&[("first", 4), ("second", 4)]),
                Arc::new(ScriptedEvaluator::new(&verdicts).with_delays(&[50, 0])),
            )
            .await
            .unwrap();

        assert_eq!(result.winner.name, "first");
        assert_eq!(result.winner.index, 0);
    }

    #[tokio::test]
    async fn best_partial_candidate_is_not_ok() {
        let verdicts = [
            ("meh", true, true, [true, false, false, true]),
            ("better", true, true, [true, true, false, true]),
        ];
        let result = Reranker::default()
            .rerank(
                &gens(&[("meh", 2), ("better", 9)]),
                Arc::new(ScriptedEvaluator::new(&verdicts)),
            )
            .await
            .unwrap();

        assert_eq!(result.winner.name, "better");
        assert!(!result.ok);
        assert_eq!(result.winner.score, 5);
        assert_eq!(result.winner.max_score, 6);
    }

    #[tokio::test]
    async fn generator_errors_become_zero_reports() {
        let verdicts = [("good", true, true, ALL)];
        let evaluator = Arc::new(ScriptedEvaluator::new(&verdicts));
        let generators: Vec<Box<dyn CandidateGenerator>> = vec![
            Box::new(|| -> Result<Candidate> { Err(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom"))) }),
            fixed(Candidate::new("good", diff_with_lines(3))),
            fixed(Candidate::new("prose", "please fix the bug")),
        ];

        let result = Reranker::default()
            .rerank(&generators, evaluator.clone())
            .await
            .unwrap();

        assert_eq!(result.winner.name, "good");
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.candidates.len(), 3);

        let failed = result.candidates.iter().find(|c| c.index == 0).unwrap();
        assert_eq!(failed.score, 0);
        assert_eq!(failed.gates.len(), 4);
        assert!(failed.error.as_deref().unwrap().contains("boom"));

        let prose = result.candidates.iter().find(|c| c.index == 2).unwrap();
        assert_eq!(prose.name, "prose");
        assert!(prose.error.as_deref().unwrap().contains("invalid candidate"));
    }

    #[tokio::test]
    async fn max_candidates_limits_generator_calls() {
        let called = Arc::new(AtomicUsize::new(0));
        let generators: Vec<Box<dyn CandidateGenerator>> = (0..5)
            .map(|i| {
                let called = Arc::clone(&called);
                Box::new(move || -> Result<Candidate> {
                    called.fetch_add(1, Ordering::SeqCst);
                    Ok(Candidate::new(format!("c{}", i), diff_with_lines(1)))
                }) as Box<dyn CandidateGenerator>
            })
            .collect();

        let reranker = Reranker::new(RerankConfig {
            max_candidates: Some(2),
            ..RerankConfig::default()
        });
        let result = reranker
            .rerank(&generators, Arc::new(ScriptedEvaluator::new(&[])))
            .await
            .unwrap();

        assert_eq!(called.load(Ordering::SeqCst), 2);
        assert_eq!(result.candidates.len(), 2);
    }

    #[tokio::test]
    async fn oversized_diffs_are_invalid() {
        let verdicts = [("huge", true, true, ALL), ("tiny", true, false, ALL)];
        let reranker = Reranker::new(RerankConfig {
            max_diff_lines: Some(10),
            ..RerankConfig::default()
        });

        let result = reranker
            .rerank(
                &gens(&[("huge", 11), ("tiny", 2)]),
                Arc::new(ScriptedEvaluator::new(&verdicts)),
            )
            .await
            .unwrap();

        assert_eq!(result.winner.name, "tiny");
        let huge = &result.candidates[1];
        assert_eq!(huge.score, 0);
        assert!(huge.error.as_deref().unwrap().contains("limit is 10"));
    }

    #[tokio::test]
    async fn no_generators_is_an_error() {
        let result = Reranker::default()
            .rerank(&[], Arc::new(ScriptedEvaluator::new(&[])))
            .await;
        assert!(matches!(result, Err(Error::InvalidCandidate(_))));
    }
}

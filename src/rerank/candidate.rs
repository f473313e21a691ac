//! Candidate patches and their generators.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One proposed patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Tag identifying the proposal.
    pub name: String,
    /// Unified diff text.
    pub diff: String,
}

impl Candidate {
    /// Creates a candidate.
    pub fn new(name: impl Into<String>, diff: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            diff: diff.into(),
        }
    }
}

/// Produces exactly one candidate per call.
///
/// The reranker calls each generator once, in input order.
pub trait CandidateGenerator: Send + Sync {
    /// Produces the candidate.
    fn generate(&self) -> Result<Candidate>;
}

impl<F> CandidateGenerator for F
where
    F: Fn() -> Result<Candidate> + Send + Sync,
{
    fn generate(&self) -> Result<Candidate> {
        self()
    }
}

/// Boxes a fixed candidate as a generator.
pub fn fixed(candidate: Candidate) -> Box<dyn CandidateGenerator> {
    Box::new(move || -> Result<Candidate> { Ok(candidate.clone()) })
}

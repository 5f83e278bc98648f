//! Failure taxonomy for run execution.
//!
//! Step-level failures are always recovered locally: they become a failed
//! `StepResult` whose reason is the error's display text, and execution
//! continues with the next step. Run-level failures (missing credentials,
//! missing test case, persistence errors) abort only the current run; the
//! scheduler keeps polling. An ambiguous judge verdict is a step *failure*,
//! not an error; see `judge::parse_verdict`.

use crate::providers::llm::ProviderError;
use thiserror::Error;

/// Why a single step failed without producing a judged-success result.
#[derive(Debug, Error)]
pub enum StepError {
    /// No credential configured for the provider(s) a run needs. Detected
    /// up front and short-circuits the whole run: no provider is called.
    #[error("missing credential for provider(s): {}", providers.join(", "))]
    MissingCredential { providers: Vec<String> },

    /// The step's model has no catalog entry.
    #[error("model not supported: {model}")]
    UnsupportedModel { model: String },

    /// The step input could not be canonicalized into a message list.
    #[error("malformed input: {detail}")]
    MalformedInput { detail: String },

    /// The provider call itself failed (network, rate limit, API error).
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The judge call failed before producing any verdict text.
    #[error("judge call failed: {0}")]
    Judge(String),
}

//! Error returned by the orchestrator

use std::time::Duration;

use relaygate_common::{EngineError, ErrorClassification, ErrorKind};
use thiserror::Error;

use crate::scope::Scope;

/// An [`EngineError`] enriched with the call it came from
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{operation} on {scope} failed after {attempts} attempt(s) in {elapsed:?}: {source}")]
pub struct CallError {
    /// Scope the call ran under
    pub scope: Scope,
    /// Operation name from the call context
    pub operation: String,
    /// Attempts started, including one cut short by a timeout
    pub attempts: u32,
    /// Time from submission to failure
    pub elapsed: Duration,
    #[source]
    pub source: EngineError,
}

impl CallError {
    /// Kind of the underlying error
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    /// Whether the underlying error is classified retryable
    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }

    /// Whether the call hit its overall deadline
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// Drop the call metadata
    pub fn into_inner(self) -> EngineError {
        self.source
    }
}

impl From<CallError> for EngineError {
    fn from(err: CallError) -> Self {
        err.source
    }
}

//! Error taxonomy for a reconciliation run.
//!
//! Errors are split by blast radius: [`RunError`] ends the whole run for a site,
//! while [`BalanceError`] only fails the tracked balance it was raised for.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session artifact {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize session payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("no numeric content in {0:?}")]
    NoNumericContent(String),
    #[error("number {0:?} is out of range")]
    OutOfRange(String),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger query for {account} failed: {reason}")]
    QueryFailed { account: String, reason: String },
    #[error("no balance found in ledger output for {account}")]
    NoBalanceFound { account: String },
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no value appeared within {waited:?}{}", last_error_suffix(.last_error))]
    Timeout {
        waited: Duration,
        last_error: Option<String>,
    },
    #[error("navigation before sampling failed: {0:#}")]
    Navigation(anyhow::Error),
}

/// Failure of a single tracked balance. Recorded in the report, never coerced to zero.
#[derive(Debug, Error)]
pub enum BalanceError {
    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),
    #[error("normalization failed: {0}")]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("authentication could not be established: {0}")]
    Authentication(String),
    #[error("surface failed during {stage}: {error:#}")]
    Surface {
        stage: &'static str,
        error: anyhow::Error,
    },
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(error) => format!(" (last error: {error})"),
        None => String::new(),
    }
}

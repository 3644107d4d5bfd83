// SPDX-License-Identifier: GPL-2.0
//! Error types for the race detector

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for analysis operations
pub type Result<T> = core::result::Result<T, AnalysisError>;

/// Errors that can occur while building or analyzing a program.
///
/// Budget exhaustion and unmatched thread joins are not errors: they degrade
/// precision and are recorded in the diagnostics log instead.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("analysis not initialized: {0}")]
    NotInitialized(&'static str),

    #[error("unknown function {0}")]
    UnknownFunction(String),

    #[error("unknown instruction {0}")]
    UnknownInstruction(u32),

    #[error("unknown value {0}")]
    UnknownValue(u32),

    #[error("malformed program: {0}")]
    MalformedProgram(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("pair file {}: {source}", path.display())]
    PairFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed pair file line {line}: {content:?}")]
    PairFormat { line: usize, content: String },
}

impl AnalysisError {
    /// Whether the error comes from malformed input rather than a misuse of
    /// the analysis API.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            AnalysisError::MalformedProgram(_)
                | AnalysisError::PairFile { .. }
                | AnalysisError::PairFormat { .. }
        )
    }

    /// Shorthand for a [`AnalysisError::MalformedProgram`] error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        AnalysisError::MalformedProgram(msg.into())
    }
}

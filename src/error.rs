use thiserror::Error;

/// Failures raised by the weekly analysis pipeline.
///
/// Transport, format and empty-response errors belong to a single chat and are
/// contained inside the worker pool. Configuration and persistence errors are
/// infrastructure failures and reach the caller.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid window: start {start} is not before end {end}")]
    InvalidWindow { start: String, end: String },

    #[error("scoring transport error: {0}")]
    Transport(String),

    #[error("scoring output is not valid JSON: {0}")]
    ScoringFormat(String),

    #[error("scoring returned an empty response")]
    EmptyResponse,

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("cancellation requested")]
    Cancelled,
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;

impl AnalysisError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::ScoringFormat(msg.into())
    }

    /// True for errors that only cost one chat its result.
    pub fn is_per_chat(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::ScoringFormat(_) | Self::EmptyResponse
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoring_failures_are_per_chat() {
        assert!(AnalysisError::transport("429").is_per_chat());
        assert!(AnalysisError::format("eof").is_per_chat());
        assert!(AnalysisError::EmptyResponse.is_per_chat());
    }

    #[test]
    fn infrastructure_failures_are_not_per_chat() {
        assert!(!AnalysisError::configuration("tz").is_per_chat());
        assert!(!AnalysisError::Persistence(sqlx::Error::PoolClosed).is_per_chat());
        assert!(!AnalysisError::Cancelled.is_per_chat());
    }
}

use std::fmt;
use std::time::Duration;

/// Core error types for chatrace.
#[derive(Debug, thiserror::Error)]
pub enum ChatraceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Race error: {0}")]
    Race(#[from] RaceError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failure of a single provider attempt. Always local to that attempt.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream rejected request ({status}): {message}")]
    UpstreamRejected { status: u16, message: String },

    #[error("upstream stream error: {0}")]
    UpstreamStream(String),

    #[error("stream closed without meaningful output")]
    NoMeaningfulOutput,

    #[error("no meaningful output before the race deadline")]
    TimedOut,

    #[error("attempt cancelled")]
    Cancelled,
}

impl ProviderError {
    /// HTTP status reported by the upstream, if it got that far.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::UpstreamRejected { status, .. } => Some(*status),
            ProviderError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// One provider's failure reason inside an aggregated race error.
#[derive(Debug)]
pub struct AttemptFailure {
    pub provider: String,
    pub error: ProviderError,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.provider, self.error)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RaceError {
    #[error("no upstream providers configured")]
    ConfigurationMissing,

    #[error("all providers failed: {}", summarize(.failures))]
    AllProvidersFailed { failures: Vec<AttemptFailure> },

    #[error("race timed out after {deadline:?}: {}", summarize(.failures))]
    Timeout {
        deadline: Duration,
        failures: Vec<AttemptFailure>,
    },

    #[error("race cancelled by caller")]
    Cancelled,

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<RaceError> },
}

impl RaceError {
    /// Per-provider failures of the (last) race, empty for non-aggregate variants.
    pub fn failures(&self) -> &[AttemptFailure] {
        match self {
            RaceError::AllProvidersFailed { failures } | RaceError::Timeout { failures, .. } => {
                failures
            }
            RaceError::Exhausted { last, .. } => last.failures(),
            _ => &[],
        }
    }

    /// First upstream HTTP status found among the failures.
    pub fn upstream_status(&self) -> Option<u16> {
        self.failures().iter().find_map(|f| f.error.status())
    }

    /// Whether another independent race may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaceError::AllProvidersFailed { .. } | RaceError::Timeout { .. }
        )
    }
}

fn summarize(failures: &[AttemptFailure]) -> String {
    if failures.is_empty() {
        return "no attempts recorded".to_string();
    }
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

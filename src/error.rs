use thiserror::Error;

/// Errors surfaced by the wargaming engine.
///
/// Per-iteration arithmetic faults never reach this type unless every
/// iteration of a run failed; otherwise they are counted on the
/// `SimulationResult` and the run continues.
#[derive(Debug, Error)]
pub enum WargameError {
    /// Malformed distribution parameters, scenario or run parameters.
    #[error("validation error: {0}")]
    Validation(String),

    /// Formula references an unbound name or an unsupported construct.
    #[error("formula error at position {position}: {message}")]
    Evaluation { position: usize, message: String },

    /// No iteration produced a usable outcome.
    #[error("numeric failure: all {invalid} of {total} iterations were invalid")]
    NumericFailure { invalid: usize, total: usize },

    /// Malformed decision tree.
    #[error("decision tree structure error: {0}")]
    Structure(String),

    /// The run exceeded its deadline and was discarded.
    #[error("simulation incomplete: deadline exceeded after {completed} of {total} chunks")]
    IncompleteSimulation { completed: usize, total: usize },

    /// Unreadable configuration or scenario file.
    #[error("config error: {0}")]
    Config(String),

    /// Failed to write an export table.
    #[error("export error: {0}")]
    Export(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WargameError {
    pub fn validation(msg: impl Into<String>) -> Self {
        WargameError::Validation(msg.into())
    }

    pub fn structure(msg: impl Into<String>) -> Self {
        WargameError::Structure(msg.into())
    }

    pub fn evaluation(position: usize, msg: impl Into<String>) -> Self {
        WargameError::Evaluation {
            position,
            message: msg.into(),
        }
    }
}

impl From<serde_json::Error> for WargameError {
    fn from(e: serde_json::Error) -> Self {
        WargameError::Config(e.to_string())
    }
}

impl From<toml::de::Error> for WargameError {
    fn from(e: toml::de::Error) -> Self {
        WargameError::Config(e.to_string())
    }
}

impl From<csv::Error> for WargameError {
    fn from(e: csv::Error) -> Self {
        WargameError::Export(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WargameError>;

//! Error taxonomy for the engine and its artifact store.

use std::io;

use thiserror::Error;

/// Failures the engine distinguishes when deciding whether to reject a single
/// sample, skip a stimulus, or unwind the whole command back to `Idle`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("sensor '{sensor}' is not connected")]
    SensorUnavailable { sensor: String },

    #[error("invalid sample: {reason}")]
    InvalidSample { reason: String },

    #[error("stimulus '{stimulus}' has less than {required} data points ({available} available)")]
    InsufficientData {
        stimulus: String,
        required: usize,
        available: usize,
    },

    #[error("no usable model for stimulus '{stimulus}'")]
    ModelUnavailable { stimulus: String },

    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] StoreError),

    #[error("stop requested")]
    StopRequested,

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("target program error: {0}")]
    Program(String),

    #[error("training backend error: {0}")]
    Training(String),
}

impl EngineError {
    /// Errors that end the current command instead of being resolved locally.
    pub fn aborts_command(&self) -> bool {
        matches!(
            self,
            EngineError::SensorUnavailable { .. }
                | EngineError::InsufficientData { .. }
                | EngineError::StopRequested
                | EngineError::Catalog(_)
                | EngineError::Program(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("bad magic in {0}")]
    BadMagic(String),

    #[error("unsupported artifact version {0}")]
    UnsupportedVersion(u32),

    #[error("corrupt artifact: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data_message_names_the_threshold() {
        let e = EngineError::InsufficientData {
            stimulus: "keyword:rain".to_string(),
            required: 10,
            available: 0,
        };
        assert!(e.to_string().contains("less than 10 data points"));
        assert!(e.aborts_command());
    }

    #[test]
    fn local_errors_do_not_abort() {
        assert!(!EngineError::InvalidSample {
            reason: "nan".to_string()
        }
        .aborts_command());
        assert!(!EngineError::ModelUnavailable {
            stimulus: "picture:a".to_string()
        }
        .aborts_command());
    }
}

//! Error kinds shared by every tidal crate.
//!
//! Errors are `Clone` because a runtime failure is cached on the request
//! handle and handed back to every caller that retrieves its result.

/// Errors raised while setting up or executing a streamed model.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TidalError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("unsupported input: {0}")]
    UnsupportedInput(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("stage {stage} failed: {msg}")]
    Compute { stage: usize, msg: String },

    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("scheduler shut down before the request resolved")]
    SchedulerClosed,
}

impl TidalError {
    /// Shorthand for a compute failure at `stage`.
    pub fn compute(stage: usize, msg: impl Into<String>) -> Self {
        TidalError::Compute { stage, msg: msg.into() }
    }

    /// Whether the error was raised synchronously at setup time.
    pub fn is_setup(&self) -> bool {
        matches!(self, TidalError::Configuration(_) | TidalError::UnsupportedInput(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = TidalError::compute(3, "nan in activations");
        assert_eq!(e.to_string(), "stage 3 failed: nan in activations");
        assert_eq!(
            TidalError::Transfer("slot 1 busy".into()).to_string(),
            "transfer failed: slot 1 busy"
        );
    }

    #[test]
    fn test_setup_classification() {
        assert!(TidalError::Configuration("x".into()).is_setup());
        assert!(TidalError::UnsupportedInput("x".into()).is_setup());
        assert!(!TidalError::ResourceExhaustion("x".into()).is_setup());
        assert!(!TidalError::SchedulerClosed.is_setup());
    }
}

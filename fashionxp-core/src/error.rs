use burn::record::RecorderError;
use thiserror::Error;

/// Failure modes of predictor construction and the forward paths.
///
/// None of these are retried anywhere; they propagate to the caller and,
/// in the CLI, abort the run with a non-zero exit status.
#[derive(Debug, Error)]
pub enum Error {
    /// The build-spec names an unknown sub-component variant or carries
    /// an invalid value. Surfaced at construction time.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A tensor-shaped input disagrees with what the configured
    /// sub-components require. Fatal for the call that supplied it.
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        actual: String,
    },

    /// Landmarks supplied to a predictor built without a roi_pool, or
    /// omitted for one built with it.
    #[error("inconsistent call: {0}")]
    Consistency(String),

    /// Checkpoint parameter names or shapes do not match the
    /// constructed model.
    #[error("checkpoint load failed: {0}")]
    CheckpointLoad(#[from] RecorderError),
}

impl Error {
    pub(crate) fn unknown_variant(component: &'static str, kind: &str) -> Self {
        Self::Configuration(format!("unknown {component} variant `{kind}`"))
    }

    pub(crate) fn shape(
        what: &'static str,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::ShapeMismatch {
            what,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

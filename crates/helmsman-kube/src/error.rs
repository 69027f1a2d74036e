//! Error types for helmsman-kube

use thiserror::Error;

/// Result type for helmsman-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors raised while observing, deciding or executing
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Desired state error bubbled up from loading or validation
    #[error(transparent)]
    Core(#[from] helmsman_core::CoreError),

    /// A required tool or plugin is missing or unsuitable
    #[error("environment check failed: {0}")]
    Environment(String),

    /// `helm list` or another observation command failed
    #[error("failed to observe cluster state: {0}")]
    Observation(String),

    /// The release key is owned by another managing context
    #[error("release '{release}' in namespace '{namespace}' is managed by context '{owner}', not '{current}'\nHint: Use --context-override or remove the release from this DSF")]
    Conflict {
        release: String,
        namespace: String,
        current: String,
        owner: String,
    },

    /// A planned or preparatory command exited non-zero
    #[error("command failed: {description} (exit code {code})\n{stderr}")]
    CommandFailed {
        description: String,
        code: i32,
        stderr: String,
    },

    /// No chart version satisfies the requested version
    #[error("cannot resolve chart '{chart}' version '{version}': {message}")]
    ChartResolution {
        chart: String,
        version: String,
        message: String,
    },

    /// The release stayed in a pending status
    #[error("release '{name}' in namespace '{namespace}' is stuck in status '{status}'\nHint: Use --skip-pending to ignore pending releases")]
    PendingRelease {
        name: String,
        namespace: String,
        status: String,
    },

    /// Secret decryption failed
    #[error("failed to decrypt '{path}': {message}")]
    Decryption { path: String, message: String },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

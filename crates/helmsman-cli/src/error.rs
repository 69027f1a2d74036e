//! CLI error type
//!
//! Library errors are sorted into the kinds a user acts on differently, each
//! with its own diagnostic code and hint. All of them exit with status 1.

use helmsman_core::CoreError;
use helmsman_kube::KubeError;
use miette::Diagnostic;
use thiserror::Error;

use crate::exit_codes;

#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    /// DSF parsing, substitution or validation failed
    #[error("Configuration error: {message}")]
    #[diagnostic(code(helmsman::config))]
    Config {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// helm, kubectl or a plugin is missing or unsuitable
    #[error("Environment error: {message}")]
    #[diagnostic(
        code(helmsman::environment),
        help("Check that helm v3, kubectl and the required plugins are on PATH")
    )]
    Environment { message: String },

    /// The cluster state could not be read or conflicts with this DSF
    #[error("Cluster error: {message}")]
    #[diagnostic(code(helmsman::cluster))]
    Cluster { message: String },

    /// A planned command failed
    #[error("Execution failed: {message}")]
    #[diagnostic(
        code(helmsman::execution),
        help("Commands that already succeeded are not rolled back")
    )]
    Execution { message: String },

    #[error("IO error: {message}")]
    #[diagnostic(code(helmsman::io))]
    Io { message: String },
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        exit_codes::ERROR
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }

    pub fn config_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: Some(help.into()),
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Io(e) => e.into(),
            CoreError::Validation { .. } => CliError::config_with_help(
                err.to_string(),
                "Fix the desired state file or rerun with --skip-validation",
            ),
            CoreError::UnsetVariable { .. } => CliError::config_with_help(
                err.to_string(),
                "Set the variable, add it to an env file (-e) or disable substitution with --no-env-subst",
            ),
            other => CliError::config(other.to_string()),
        }
    }
}

impl From<KubeError> for CliError {
    fn from(err: KubeError) -> Self {
        match err {
            KubeError::Core(core) => core.into(),
            KubeError::Environment(message) => CliError::Environment { message },
            KubeError::CommandFailed { .. } | KubeError::Decryption { .. } => CliError::Execution {
                message: err.to_string(),
            },
            KubeError::Io(e) => e.into(),
            other => CliError::Cluster {
                message: other.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CliError>;

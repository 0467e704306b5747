//! Error types for host network bootstrapping.

use thiserror::Error;

use crate::bootstrap::Step;

/// Failure reported by a [`SystemConfigurator`](crate::system::SystemConfigurator).
#[derive(Error, Debug)]
pub enum SystemError {
    #[error("permission denied (run as root)")]
    PermissionDenied,

    #[error("interface {0} not found")]
    InterfaceNotFound(String),

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("rule rejected: {command} - {message}")]
    RuleRejected { command: String, message: String },

    #[error("command failed: {command} - {message}")]
    CommandFailed { command: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum TapnatError {
    #[error("{step} failed: {source}")]
    StepFailed {
        step: Step,
        #[source]
        source: SystemError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Coarse classification of a [`TapnatError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PermissionDenied,
    InterfaceNotFound,
    RuleInsertion,
    UnsupportedPlatform,
    Config,
}

impl TapnatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TapnatError::StepFailed { step, source } => match source {
                SystemError::PermissionDenied => ErrorKind::PermissionDenied,
                SystemError::InterfaceNotFound(_) => ErrorKind::InterfaceNotFound,
                SystemError::UnsupportedPlatform(_) => ErrorKind::UnsupportedPlatform,
                _ if step.touches_forwarding() => ErrorKind::UnsupportedPlatform,
                _ => ErrorKind::RuleInsertion,
            },
            TapnatError::Config(_) => ErrorKind::Config,
        }
    }

    /// The step that failed, if the error came from a step.
    pub fn step(&self) -> Option<Step> {
        match self {
            TapnatError::StepFailed { step, .. } => Some(*step),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TapnatError>;

use std::time::Duration;
use thiserror::Error;

/// Terminal conditions of an experiment round loop.
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("an experiment is already running")]
    AlreadyRunning,
    #[error("boot beacon not received within {0:?}")]
    BootTimeout(Duration),
    #[error("experiment aborted")]
    Aborted,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("provisioning failure: {0}")]
    ProvisioningFailure(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type RunResult<T> = Result<T, ExperimentError>;

impl ExperimentError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        ExperimentError::ProtocolViolation(msg.into())
    }

    /// Whether the sibling roles must be told to unwind.
    pub fn broadcasts_abort(&self) -> bool {
        !matches!(
            self,
            ExperimentError::Aborted | ExperimentError::AlreadyRunning
        )
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, ExperimentError::Aborted)
    }

    /// Short label stored in the persisted measurement bundle.
    pub fn kind(&self) -> &'static str {
        match self {
            ExperimentError::AlreadyRunning => "already_running",
            ExperimentError::BootTimeout(_) => "boot_timeout",
            ExperimentError::Aborted => "aborted",
            ExperimentError::ProtocolViolation(_) => "protocol_violation",
            ExperimentError::ProvisioningFailure(_) => "provisioning_failure",
            ExperimentError::Io(_) => "io",
            ExperimentError::Other(_) => "other",
        }
    }
}

/// Raised by the validating message constructor.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("unknown service type {0:?}")]
    UnknownServiceType(String),
    #[error("malformed {service_type} message: {source}")]
    Malformed {
        service_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid {service_type} message: {reason}")]
    Invalid {
        service_type: String,
        reason: String,
    },
}

use thiserror::Error;

/// Backend error surfaced to higher layers.
///
/// Allocation and registration failures are always returned as values; callers decide whether to
/// retry elsewhere (for example falling back to host memory). Out-of-range device ordinals are not
/// represented here: they are programming errors and panic at the call site.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("device {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    #[error("failed to allocate {size} bytes from buffer type {buffer_type}: {reason}")]
    AllocationFailure {
        buffer_type: String,
        size: usize,
        reason: String,
    },

    #[error("host buffer registration failed: {reason}")]
    RegistrationFailure { reason: String },

    #[error("{op} is not supported: {reason}")]
    UnsupportedOperation { op: String, reason: String },

    #[error("extra buffer type {provider} claimed {op} but produced no tensor traits")]
    ProviderContract { provider: String, op: String },

    #[error("extra buffer types {first} and {second} both claim {op}")]
    ProviderOverlap {
        first: String,
        second: String,
        op: String,
    },

    #[error("extra buffer type {0} is already registered")]
    DuplicateProvider(String),

    #[error("backend family {0} is already registered")]
    DuplicateFamily(String),

    #[error("invalid tensor split: {reason}")]
    InvalidSplit { reason: String },

    #[error("backend execution failure: {message}")]
    Execution { message: String },
}

impl BackendError {
    pub fn device_unavailable(device: impl ToString, reason: impl Into<String>) -> Self {
        BackendError::DeviceUnavailable {
            device: device.to_string(),
            reason: reason.into(),
        }
    }

    pub fn allocation(
        buffer_type: impl Into<String>,
        size: usize,
        reason: impl Into<String>,
    ) -> Self {
        BackendError::AllocationFailure {
            buffer_type: buffer_type.into(),
            size,
            reason: reason.into(),
        }
    }

    pub fn registration(reason: impl Into<String>) -> Self {
        BackendError::RegistrationFailure {
            reason: reason.into(),
        }
    }

    pub fn unsupported(op: impl ToString, reason: impl Into<String>) -> Self {
        BackendError::UnsupportedOperation {
            op: op.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_split(reason: impl Into<String>) -> Self {
        BackendError::InvalidSplit {
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }

    /// Returns `true` for failures a caller can recover from by choosing another device, a
    /// smaller allocation or the slow transfer path.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BackendError::DeviceUnavailable { .. }
                | BackendError::AllocationFailure { .. }
                | BackendError::RegistrationFailure { .. }
        )
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

use crate::backend::RegisterFault;

/// Errors reported synchronously by configure, start, stop and read.
///
/// Interrupt-time problems never surface here. They are counted in the
/// session statistics instead.
#[derive(Debug, thiserror::Error)]
pub enum SamplingError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("device busy: {0}")]
    DeviceBusy(&'static str),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("hardware anomaly: {0}")]
    HardwareAnomaly(#[from] RegisterFault),
}

impl SamplingError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Numeric status code used by the device facade.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidParameter(_) => -22,
            Self::DeviceBusy(_) => -16,
            Self::NotSupported(_) => -95,
            Self::ResourceExhausted(_) => -12,
            Self::HardwareAnomaly(_) => -5,
        }
    }
}

pub type Result<T> = std::result::Result<T, SamplingError>;

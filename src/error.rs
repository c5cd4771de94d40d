//! Error taxonomy shared by every dispatch operation.
//!
//! Each variant maps onto a stable negative integer (see [`BpuError::code`])
//! so results can be handed across a C boundary without translation.

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, BpuError>;

/// Failure of a dispatch, task, map or device operation.
///
/// A task that fails on the accelerator is *not* reported here; it ends in
/// [`TaskStatus::Err`](crate::task::TaskStatus::Err) and is observed through
/// the chosen completion mechanism.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BpuError {
    /// The core mask selects no installed device.
    #[error("no accelerator core selected by mask {mask:#x}")]
    NoCore { mask: u32 },

    /// Bad parameter or forbidden state transition.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Allocation or device-side translation resources exhausted.
    #[error("out of memory: {0}")]
    NoMemory(String),

    /// A wait exceeded the caller's bound.
    #[error("timed out waiting for completion")]
    Timeout,

    /// Nothing available for a non-blocking query.
    #[error("no data available")]
    NoData,

    /// The referenced group has no proportion record.
    #[error("group {0} is not initialized")]
    NoGroup(u32),

    /// Requested combination is not supported by the firmware.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Caller lacks rights for the operation.
    #[error("permission denied: {0}")]
    NoPermission(String),

    /// Queue or resource at capacity; retry with backoff.
    #[error("core busy: {0}")]
    Busy(String),

    /// The task was cancelled, or cancellation was refused after start.
    #[error("task cancelled: {0}")]
    Cancelled(String),

    /// Opaque lower-layer failure.
    #[error("unknown error: {0}")]
    Unknown(String),

    /// The device boundary rejected the request.
    #[error("driver error: {0}")]
    Driver(String),
}

impl BpuError {
    /// Stable integer code for this error. Success is `0` and never produced here.
    pub fn code(&self) -> i32 {
        match self {
            BpuError::NoCore { .. } => -1,
            BpuError::Invalid(_) => -2,
            BpuError::NoMemory(_) => -3,
            BpuError::Timeout => -4,
            BpuError::NoData => -5,
            BpuError::NoGroup(_) => -6,
            BpuError::NotSupported(_) => -7,
            BpuError::NoPermission(_) => -8,
            BpuError::Busy(_) => -9,
            BpuError::Cancelled(_) => -10,
            BpuError::Unknown(_) => -11,
            BpuError::Driver(_) => -12,
        }
    }

    /// Whether a caller should retry the same operation later.
    ///
    /// Only capacity (`Busy`) and wait bounds (`Timeout`) are transient; every
    /// other error indicates a programming error or a hard device failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BpuError::Busy(_) | BpuError::Timeout)
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        BpuError::Invalid(msg.into())
    }
}

/// Convert an operation result into the integer code used at a C boundary.
pub fn result_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(BpuError::NoCore { mask: 0 }.code(), -1);
        assert_eq!(BpuError::invalid("x").code(), -2);
        assert_eq!(BpuError::Timeout.code(), -4);
        assert_eq!(BpuError::NoGroup(3).code(), -6);
        assert_eq!(BpuError::Busy("full".into()).code(), -9);
        assert_eq!(BpuError::Cancelled("c".into()).code(), -10);
        assert_eq!(BpuError::Driver("ioctl".into()).code(), -12);
    }

    #[test]
    fn test_only_busy_and_timeout_retry() {
        assert!(BpuError::Busy("full".into()).is_retryable());
        assert!(BpuError::Timeout.is_retryable());
        assert!(!BpuError::invalid("state").is_retryable());
        assert!(!BpuError::NoCore { mask: 4 }.is_retryable());
        assert!(!BpuError::NoGroup(1).is_retryable());
    }

    #[test]
    fn test_result_code() {
        let ok: Result<u32> = Ok(7);
        let err: Result<u32> = Err(BpuError::NoData);
        assert_eq!(result_code(&ok), 0);
        assert_eq!(result_code(&err), -5);
    }

    #[test]
    fn test_display_includes_mask() {
        let msg = BpuError::NoCore { mask: 0x8 }.to_string();
        assert!(msg.contains("0x8"));
    }
}

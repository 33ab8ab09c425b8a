//! Internal error type and its translation to the syscall-visible `BfStatus`.

use mk_abi::status;

/// Every fallible operation inside the microkernel returns this. Only the syscall dispatcher
/// translates it into a `BfStatus` written to rAX; nothing else should look at raw status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MkError {
    /// A `BF_INVALID_ID` or out-of-range ID was passed in argument register `n`.
    InvalidId(u8),
    /// The handle didn't match the extension's issued handle.
    InvalidHandle,
    /// The calling extension doesn't have permission to perform this operation.
    PermissionDenied,
    /// The requested field/operation doesn't exist on this microarchitecture.
    Unsupported,
    /// A pool ran out of free slots/frames.
    ResourceExhausted,
    /// An object is in a lifecycle state that forbids the requested transition (e.g.
    /// `deallocate` while active).
    InvalidState,
    /// Catch-all for conditions with no more specific status.
    Unknown,
}

impl MkError {
    pub const fn to_status(self) -> u64 {
        match self {
            MkError::InvalidId(0) => status::BF_STATUS_INVALID_INPUT_REG0,
            MkError::InvalidId(1) => status::BF_STATUS_INVALID_INPUT_REG1,
            MkError::InvalidId(2) => status::BF_STATUS_INVALID_INPUT_REG2,
            MkError::InvalidId(3) => status::BF_STATUS_INVALID_INPUT_REG3,
            MkError::InvalidId(4) => status::BF_STATUS_INVALID_INPUT_REG4,
            MkError::InvalidId(_) => status::BF_STATUS_INVALID_INPUT_REG5,
            MkError::InvalidHandle => status::BF_STATUS_INVALID_HANDLE,
            MkError::PermissionDenied => status::BF_STATUS_FAILURE_INVALID_PERM,
            MkError::Unsupported | MkError::ResourceExhausted | MkError::InvalidState => {
                status::BF_STATUS_FAILURE_UNKNOWN
            }
            MkError::Unknown => status::BF_STATUS_FAILURE_UNKNOWN,
        }
    }
}

pub type MkResult<T> = Result<T, MkError>;

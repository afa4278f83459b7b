use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Error codes visible at module boundaries.
///
/// The numeric values are part of the external ABI (success is `0` and has no
/// variant here - fallible operations return `Result<_, CommError>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum CommError {
    #[error("invalid argument or structurally invalid input")]
    Invalid = -1,
    #[error("destination buffer or queue capacity exhausted")]
    NoMem = -2,
    #[error("operation timed out")]
    Timeout = -3,
    #[error("checksum mismatch")]
    Crc = -4,
    #[error("window overflow")]
    Overflow = -5,
    #[error("platform level failure")]
    Platform = -6,
}

impl CommError {
    /// The numeric code of a successful operation.
    pub const OK: i32 = 0;

    pub fn code(self) -> i32 {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::invalid(CommError::Invalid, -1)]
    #[case::nomem(CommError::NoMem, -2)]
    #[case::timeout(CommError::Timeout, -3)]
    #[case::crc(CommError::Crc, -4)]
    #[case::overflow(CommError::Overflow, -5)]
    #[case::platform(CommError::Platform, -6)]
    fn test_codes_are_stable(#[case] error: CommError, #[case] expected: i32) {
        assert_eq!(error.code(), expected);
        assert_eq!(CommError::try_from(expected).unwrap(), error);
    }

    #[test]
    fn test_unknown_code_is_rejected() {
        assert!(CommError::try_from(-7).is_err());
        assert!(CommError::try_from(0).is_err());
    }
}

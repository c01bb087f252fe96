//! Runtime error kinds
//!
//! Every fallible operation in the runtime surfaces one of the six error
//! kinds defined here, synchronously at the originating call. Each kind
//! carries a stable errno-style code; bytecode helpers report failures to
//! programs as the negated code in R0.

use std::fmt;

/// Result alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the runtime's public operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// Null/empty required input, out-of-range enum or index, verifier
    /// rejection, or malformed attribute
    InvalidArgument,
    /// Map key absent, or iteration past the last key
    NotFound,
    /// Key already present under NOEXIST, or map slot already bound
    AlreadyExists,
    /// Update would exceed the map's max_entries
    Busy,
    /// Backing allocation failure
    OutOfMemory,
    /// Reserved; not produced by the core
    PermissionDenied,
}

impl Error {
    /// The errno-style code for this kind.
    ///
    /// Helper functions return `-code` to bytecode on failure.
    pub fn code(self) -> i32 {
        match self {
            Self::InvalidArgument => 22,
            Self::NotFound => 2,
            Self::AlreadyExists => 17,
            Self::Busy => 16,
            Self::OutOfMemory => 12,
            Self::PermissionDenied => 1,
        }
    }

    /// The negated code as a 64-bit register value.
    pub(crate) fn to_reg(self) -> u64 {
        -(self.code() as i64) as u64
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "Invalid argument"),
            Self::NotFound => write!(f, "Not found"),
            Self::AlreadyExists => write!(f, "Already exists"),
            Self::Busy => write!(f, "Map is full"),
            Self::OutOfMemory => write!(f, "Out of memory"),
            Self::PermissionDenied => write!(f, "Permission denied"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(Error::InvalidArgument.code(), 22);
        assert_eq!(Error::NotFound.code(), 2);
        assert_eq!(Error::AlreadyExists.code(), 17);
        assert_eq!(Error::Busy.code(), 16);
        assert_eq!(Error::OutOfMemory.code(), 12);
        assert_eq!(Error::PermissionDenied.code(), 1);
    }

    #[test]
    fn test_reg_encoding_is_negated_code() {
        assert_eq!(Error::NotFound.to_reg(), (-2i64) as u64);
        assert_eq!(Error::AlreadyExists.to_reg(), (-17i64) as u64);
    }
}

//! Error classification shared by every subsystem.

use std::fmt;

/// Coarse category of a failure. Each subsystem error reports one through
/// its `kind()` method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidStructure,
    InvalidContext,
    DoubleSpend,
    StaleOrFutureBlock,
    StorageFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::InvalidStructure => "invalid structure",
            ErrorKind::InvalidContext => "invalid context",
            ErrorKind::DoubleSpend => "double spend",
            ErrorKind::StaleOrFutureBlock => "stale or future block",
            ErrorKind::StorageFailure => "storage failure",
        };
        f.write_str(name)
    }
}

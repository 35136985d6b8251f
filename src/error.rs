//! Recoverable kernel status codes.
//!
//! Only runtime conditions are reported here. Contract violations (stale
//! handles, wrong object kind, illegal state for a startup) panic.

use core::fmt;

/// Runtime error returned by kernel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Generic failure, e.g. suspending a thread that is not Ready/Running.
    Error,
    /// A timed wait expired.
    Timeout,
    /// A fixed-size table has no free slot.
    Full,
    /// The queried list is empty.
    Empty,
    /// The heap has no block large enough.
    NoMemory,
    /// The requested entry does not exist.
    NoSys,
    /// The resource is in use.
    Busy,
    /// The timer is not running.
    NotActive,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::Error => "operation failed",
            KernelError::Timeout => "timed out",
            KernelError::Full => "table full",
            KernelError::Empty => "list empty",
            KernelError::NoMemory => "out of memory",
            KernelError::NoSys => "no such entry",
            KernelError::Busy => "busy",
            KernelError::NotActive => "timer not active",
        };
        f.write_str(msg)
    }
}

/// Result alias used throughout the kernel API.
pub type KernelResult<T> = Result<T, KernelError>;

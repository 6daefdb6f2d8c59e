//! Unified error handling for npuforge
//!
//! This module provides a centralized error type that consolidates the
//! domain-specific errors of the crate. It implements error categorization for:
//! - Configuration errors (invalid grid, invalid problem shape)
//! - Synchronization errors (barrier misuse, poisoned rendezvous)
//! - Memory errors (scratchpad exhaustion, missing staged tiles)
//! - Verification errors (cosimulation mismatches)
//! - Internal errors (bugs, panicked execution units)
//!
//! Every error is fatal for the kernel invocation that raised it. There is no
//! retry path: configuration problems are rejected before any unit starts and
//! synchronization problems abort the whole grid.

use std::fmt;

use crate::logging::LoggingError;
use crate::staging::ScratchError;

/// Unified error type for npuforge
#[derive(Debug, thiserror::Error)]
pub enum NpuForgeError {
    // ========== Configuration Errors ==========
    /// Grid dimensions are unusable (zero cores or zero threads)
    #[error("Invalid grid: {0}")]
    InvalidGrid(String),

    /// Run configuration is inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Problem size does not satisfy a kernel precondition
    #[error("Invalid problem size: {0}")]
    InvalidProblemSize(String),

    /// Input buffer has the wrong number of elements
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Unknown kernel or backend name
    #[error("Unknown {kind}: {name}")]
    UnknownName { kind: &'static str, name: String },

    // ========== Synchronization Errors ==========
    /// Two synchronization points of one kernel share a tag
    #[error("Duplicate barrier tag {tag}: used by '{first}' and '{second}'")]
    DuplicateSyncTag {
        tag: u32,
        first: &'static str,
        second: &'static str,
    },

    /// Tag is reserved by the framework
    #[error("Barrier tag {0} is reserved")]
    ReservedSyncTag(u32),

    /// Barrier would wait for more units than exist
    #[error("Barrier {tag} expects {expected} arrivals but only {live} units are live")]
    BarrierOversubscribed {
        tag: u32,
        expected: usize,
        live: usize,
    },

    /// Arrivals on an in-flight tag disagree on the expected count
    #[error("Barrier {tag} is waiting for {expected} arrivals, got a caller expecting {actual}")]
    BarrierMismatch {
        tag: u32,
        expected: usize,
        actual: usize,
    },

    /// Another unit failed, the rendezvous will never complete
    #[error("Barrier poisoned: {0}")]
    BarrierPoisoned(String),

    /// Barrier protocol misuse (zero arrivals, phase tag used in-phase)
    #[error("Synchronization protocol violation: {0}")]
    SyncProtocol(String),

    /// Phase or sync point index outside the kernel's plan
    #[error("Unknown phase or sync point: {0}")]
    UnknownPhase(u16),

    /// Publication attempted from a unit other than core 0 / thread 0
    #[error("Unit (core {core}, thread {thread}) is not the designated publisher")]
    NotDesignatedUnit { core: usize, thread: usize },

    // ========== Memory Errors ==========
    /// Scratchpad staging failure
    #[error("Scratchpad error: {0}")]
    Scratch(#[from] ScratchError),

    /// Index outside a shared buffer
    #[error("Index {index} out of bounds for buffer of {len} elements")]
    OutOfBounds { index: usize, len: usize },

    // ========== Verification Errors ==========
    /// Reference and accelerated outputs disagree
    #[error("Output mismatch in {kernel}: {mismatches} element(s) differ")]
    OutputMismatch { kernel: String, mismatches: usize },

    // ========== I/O Errors ==========
    /// File I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Logging subscriber could not be installed
    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Lock poisoned (a unit panicked while holding barrier state)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),

    /// An execution unit thread panicked
    #[error("Execution unit panicked: {0}")]
    UnitPanicked(String),
}

impl NpuForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            NpuForgeError::InvalidGrid(_)
            | NpuForgeError::InvalidConfiguration(_)
            | NpuForgeError::InvalidProblemSize(_)
            | NpuForgeError::DimensionMismatch { .. }
            | NpuForgeError::UnknownName { .. } => ErrorCategory::Configuration,

            NpuForgeError::DuplicateSyncTag { .. }
            | NpuForgeError::ReservedSyncTag(_)
            | NpuForgeError::BarrierOversubscribed { .. }
            | NpuForgeError::BarrierMismatch { .. }
            | NpuForgeError::BarrierPoisoned(_)
            | NpuForgeError::SyncProtocol(_)
            | NpuForgeError::UnknownPhase(_)
            | NpuForgeError::NotDesignatedUnit { .. } => ErrorCategory::Synchronization,

            NpuForgeError::Scratch(_) | NpuForgeError::OutOfBounds { .. } => {
                ErrorCategory::Memory
            }

            NpuForgeError::OutputMismatch { .. } => ErrorCategory::Verification,

            NpuForgeError::IoError(_)
            | NpuForgeError::Logging(_)
            | NpuForgeError::InternalError(_)
            | NpuForgeError::LockPoisoned(_)
            | NpuForgeError::UnitPanicked(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error was raised before any unit started running
    pub fn is_configuration_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Configuration)
    }

    /// Check if this error came from barrier or phase bookkeeping
    pub fn is_synchronization_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Synchronization)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
///
/// - Configuration: fix the grid, the problem size or the config
/// - Synchronization: a kernel's barrier protocol is wrong
/// - Memory: a unit staged more than its scratchpad holds
/// - Verification: cosimulation found diverging outputs
/// - Internal: a bug or a panicked unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Synchronization,
    Memory,
    Verification,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "Configuration"),
            ErrorCategory::Synchronization => write!(f, "Synchronization"),
            ErrorCategory::Memory => write!(f, "Memory"),
            ErrorCategory::Verification => write!(f, "Verification"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

// Note: From<std::io::Error>, From<ScratchError> and From<LoggingError> come from #[from]

impl<T> From<std::sync::PoisonError<T>> for NpuForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        NpuForgeError::LockPoisoned(err.to_string())
    }
}

/// Helper type alias for Results using NpuForgeError
pub type ForgeResult<T> = std::result::Result<T, NpuForgeError>;

// ========== Helper Macros ==========

/// Create a configuration error with context
///
/// # Examples
/// ```ignore
/// return Err(config_error!("tile dim {} does not divide {}", tile, n));
/// ```
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::NpuForgeError::InvalidConfiguration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::NpuForgeError::InvalidConfiguration(format!($fmt, $($arg)*))
    };
}

/// Create an internal error with context
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::NpuForgeError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::NpuForgeError::InternalError(format!($fmt, $($arg)*))
    };
}

/// Create a synchronization protocol error with context
#[macro_export]
macro_rules! sync_error {
    ($msg:expr) => {
        $crate::error::NpuForgeError::SyncProtocol($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::NpuForgeError::SyncProtocol(format!($fmt, $($arg)*))
    };
}

/// Create a problem-size error with context
#[macro_export]
macro_rules! problem_error {
    ($msg:expr) => {
        $crate::error::NpuForgeError::InvalidProblemSize($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::NpuForgeError::InvalidProblemSize(format!($fmt, $($arg)*))
    };
}

/// Check that a slice has the expected number of elements
pub fn expect_len<T>(data: &[T], expected: usize) -> ForgeResult<()> {
    if data.len() != expected {
        return Err(NpuForgeError::DimensionMismatch {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            NpuForgeError::InvalidGrid("zero cores".to_string()).category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            NpuForgeError::BarrierMismatch {
                tag: 42,
                expected: 4,
                actual: 3
            }
            .category(),
            ErrorCategory::Synchronization
        );
        assert_eq!(
            NpuForgeError::Scratch(ScratchError::CapacityExceeded {
                requested: 128,
                available: 64
            })
            .category(),
            ErrorCategory::Memory
        );
        assert_eq!(
            NpuForgeError::OutputMismatch {
                kernel: "matmul".to_string(),
                mismatches: 1
            }
            .category(),
            ErrorCategory::Verification
        );
        assert_eq!(
            NpuForgeError::UnitPanicked("boom".to_string()).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_category_predicates() {
        assert!(NpuForgeError::InvalidProblemSize("n".into()).is_configuration_error());
        assert!(NpuForgeError::BarrierPoisoned("x".into()).is_synchronization_error());
        assert!(NpuForgeError::InternalError("bug".into()).is_internal_error());
        assert!(!NpuForgeError::InternalError("bug".into()).is_configuration_error());

        let err: NpuForgeError = LoggingError::AlreadyInstalled.into();
        assert!(err.is_internal_error());
    }

    #[test]
    fn test_error_display() {
        let err = NpuForgeError::BarrierOversubscribed {
            tag: 7,
            expected: 9,
            live: 8,
        };
        assert_eq!(
            err.to_string(),
            "Barrier 7 expects 9 arrivals but only 8 units are live"
        );

        let err = NpuForgeError::DimensionMismatch {
            expected: 16,
            actual: 15,
        };
        assert_eq!(err.to_string(), "Dimension mismatch: expected 16, got 15");
    }

    #[test]
    fn test_macros() {
        let err = config_error!("bad grid");
        assert!(matches!(err, NpuForgeError::InvalidConfiguration(_)));

        let err = problem_error!("n={} not divisible by {}", 10, 4);
        assert_eq!(
            err.to_string(),
            "Invalid problem size: n=10 not divisible by 4"
        );

        let err = sync_error!("barrier {} expects zero arrivals", 3);
        assert!(err.is_synchronization_error());

        let err = internal_error!("unreachable phase");
        assert!(err.is_internal_error());
    }

    #[test]
    fn test_expect_len() {
        assert!(expect_len(&[1, 2, 3], 3).is_ok());
        let err = expect_len(&[1, 2, 3], 4).unwrap_err();
        assert!(matches!(
            err,
            NpuForgeError::DimensionMismatch {
                expected: 4,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_poison_error_conversion() {
        use std::sync::{Arc, Mutex};

        let lock = Arc::new(Mutex::new(0u32));
        let clone = Arc::clone(&lock);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        let err: NpuForgeError = lock.lock().unwrap_err().into();
        assert!(matches!(err, NpuForgeError::LockPoisoned(_)));
    }

    #[test]
    fn test_error_category_display() {
        assert_eq!(ErrorCategory::Configuration.to_string(), "Configuration");
        assert_eq!(ErrorCategory::Synchronization.to_string(), "Synchronization");
        assert_eq!(ErrorCategory::Memory.to_string(), "Memory");
        assert_eq!(ErrorCategory::Verification.to_string(), "Verification");
        assert_eq!(ErrorCategory::Internal.to_string(), "Internal");
    }
}

//! Error types for the strand runtime
//!
//! Operation failures inside fibers follow the errno convention (the
//! wrappers translate them into `std::io::Error`); the enums here cover
//! setup-time failures only.

use core::fmt;

/// Memory-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    AllocationFailed,

    /// mprotect failed
    ProtectionFailed,

    /// Requested stack size is invalid
    InvalidSize,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "stack mapping failed"),
            MemoryError::ProtectionFailed => write!(f, "stack protection change failed"),
            MemoryError::InvalidSize => write!(f, "invalid stack size"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

//! Runtime configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration priority (highest wins)
//!
//! 1. Builder methods
//! 2. Environment variables (`STRAND_*`)
//! 3. Library defaults

use strand_core::env::env_get;
use strand_core::error::ConfigError;

use crate::memory::MIN_STACK_SIZE;

/// Library defaults.
pub mod defaults {
    /// Usable stack bytes per fiber.
    pub const STACK_SIZE: usize = 64 * 1024;
    /// Kernel events harvested per poll call.
    pub const POLL_EVENTS: usize = 256;
    /// Timer items released per loop iteration.
    pub const TIMER_BATCH: usize = 1024;
}

/// Scheduler configuration with builder pattern.
///
/// Use `from_env()` to start with library defaults and apply any
/// environment variable overrides.
#[derive(Debug, Clone)]
pub struct Config {
    /// Usable stack bytes per fiber
    pub stack_size: usize,
    /// Kernel events harvested per poll call
    pub poll_events: usize,
    /// Timer items released per loop iteration
    pub timer_batch: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Config {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `STRAND_STACK_SIZE` - usable stack bytes per fiber
    /// - `STRAND_POLL_EVENTS` - kernel events per poll call
    /// - `STRAND_TIMER_BATCH` - timer items released per iteration
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("STRAND_STACK_SIZE", defaults::STACK_SIZE),
            poll_events: env_get("STRAND_POLL_EVENTS", defaults::POLL_EVENTS),
            timer_batch: env_get("STRAND_TIMER_BATCH", defaults::TIMER_BATCH),
        }
    }

    /// Create config with library defaults only (no env override).
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            poll_events: defaults::POLL_EVENTS,
            timer_batch: defaults::TIMER_BATCH,
        }
    }

    // Builder methods

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn poll_events(mut self, n: usize) -> Self {
        self.poll_events = n;
        self
    }

    pub fn timer_batch(mut self, n: usize) -> Self {
        self.timer_batch = n;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KB"));
        }
        if self.poll_events == 0 {
            return Err(ConfigError::InvalidValue("poll_events must be > 0"));
        }
        if self.timer_batch == 0 {
            return Err(ConfigError::InvalidValue("timer_batch must be > 0"));
        }
        Ok(())
    }
}

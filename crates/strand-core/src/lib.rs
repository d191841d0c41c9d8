//! # strand-core
//!
//! Platform-independent leaf types shared by the strand fiber runtime:
//! fiber identifiers, lifecycle states, I/O event kinds, error types,
//! and environment-variable helpers.
//!
//! This crate has no dependencies; everything platform-specific lives in
//! `strand-runtime`.

pub mod env;
pub mod error;
pub mod id;
pub mod state;

pub use error::{ConfigError, MemoryError};
pub use id::FiberId;
pub use state::{FiberState, IoEvent};

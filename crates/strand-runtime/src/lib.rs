//! # strand-runtime
//!
//! Platform implementation of the strand fiber runtime.
//!
//! This crate provides:
//! - Stack memory management (mmap with a guard page)
//! - Context switching (architecture-specific assembly)
//! - The timer queue and epoll readiness poller
//! - The cooperative scheduler and its thread-entry functions
//!
//! The runtime is single-threaded by construction: one scheduler per OS
//! thread, no cross-thread fiber migration, no locks in the hot path.

pub mod arch;
pub mod config;
pub mod logging;
pub mod memory;
pub mod poll;
pub mod scheduler;
pub mod timer;
pub mod tls;

mod fiber;
mod macros;

// Re-exports
pub use config::Config;
pub use scheduler::{
    await_io_event, fiber_count, fiber_exit, io_is_watched, sleep, sleep_ms, spawn, unwatch_io,
    watch_io, yield_now, Scheduler,
};

// Platform detection: the poller is epoll-backed.
#[cfg(not(target_os = "linux"))]
compile_error!("Unsupported platform");

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}

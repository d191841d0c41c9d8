//! # strand - cooperative fiber runtime
//!
//! Userspace threading for Rust: many lightweight fibers (stackful
//! coroutines) multiplexed on a single OS thread, each with a private
//! stack and blocking-looking I/O that suspends the fiber instead of the
//! thread.
//!
//! ## Features
//!
//! - **Lightweight**: 64 KiB guard-paged stack per fiber by default,
//!   recycled when a fiber dies
//! - **Fast context switch**: hand-written assembly, callee-saved
//!   registers only
//! - **Synchronous-looking I/O**: `io::read`/`io::write`/`io::accept`/
//!   `io::connect` park the fiber until epoll reports readiness or a
//!   timeout expires
//! - **Strict FIFO scheduling**: a yielding fiber runs again only after
//!   every fiber that was ready before it
//! - **Cooperative exit**: `fiber_exit` unwinds the fiber's stack, so
//!   destructors run
//!
//! ## Quick Start
//!
//! ```ignore
//! use strand::{Runtime, spawn, yield_now};
//!
//! fn main() {
//!     let mut runtime = Runtime::new();
//!     runtime.block_on(|| {
//!         spawn(|| {
//!             println!("Hello from a fiber!");
//!             yield_now();
//!             println!("Back again!");
//!         });
//!
//!         let (r, w) = strand::io::pipe().unwrap();
//!         spawn(move || {
//!             let mut buf = [0u8; 16];
//!             let n = strand::io::read(r, &mut buf, 1000).unwrap();
//!             println!("got {} bytes", n);
//!             strand::io::close(r).unwrap();
//!         });
//!         spawn(move || {
//!             strand::io::write(w, b"hi", -1).unwrap();
//!             strand::io::close(w).unwrap();
//!         });
//!     });
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    User Code                        │
//! │      spawn(), yield_now(), sleep(), io::read()      │
//! └─────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌─────────────────────────────────────────────────────┐
//! │                    Scheduler                        │
//! │   ready/dead FIFOs, fiber arena, context switches   │
//! └─────────────────────────────────────────────────────┘
//!              │                        │
//!              ▼                        ▼
//!      ┌──────────────┐        ┌──────────────┐
//!      │  TimerQueue  │        │    IoPoll    │
//!      │  (deadlines) │        │ (epoll, ET)  │
//!      └──────────────┘        └──────────────┘
//! ```
//!
//! A fiber loses the CPU only at the suspension points; plain computation
//! and function calls never switch. One scheduler per OS thread, no
//! shared state, no locks.

// Re-export core types
pub use strand_core::{ConfigError, FiberId, FiberState, IoEvent, MemoryError};

// Re-export runtime surface
pub use strand_runtime::{
    await_io_event, fiber_count, fiber_exit, io_is_watched, logging, sleep, sleep_ms, spawn,
    unwatch_io, watch_io, yield_now, Config,
};

use strand_runtime::scheduler::Scheduler;
use strand_runtime::tls;

pub mod io;

/// Handle owning one thread's scheduler.
///
/// Not `Send`: fibers, their stacks and the poller all belong to the
/// thread that created the runtime.
pub struct Runtime {
    scheduler: Box<Scheduler>,
}

impl Runtime {
    /// Create a runtime with configuration from the environment.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Create a runtime with an explicit configuration.
    pub fn with_config(config: Config) -> Self {
        Self {
            scheduler: Box::new(Scheduler::new(config)),
        }
    }

    /// Enqueue a fiber before (or between) runs. Fibers spawned from
    /// inside a running fiber use the free function [`spawn`] instead.
    pub fn spawn<F>(&mut self, f: F) -> FiberId
    where
        F: FnOnce() + 'static,
    {
        self.scheduler.call(Box::new(f))
    }

    /// Drive the scheduler until no fibers remain.
    ///
    /// Installs the thread-local scheduler pointer on entry and clears it
    /// on return; every runtime free function is valid for exactly that
    /// window.
    pub fn run(&mut self) {
        tls::install(&mut *self.scheduler);
        self.scheduler.run();
        tls::clear();
    }

    /// Spawn `f` as the first fiber and run to completion.
    pub fn block_on<F>(&mut self, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.spawn(f);
        self.run();
    }

    /// Live fibers, including dead ones not yet reaped.
    pub fn fiber_count(&self) -> usize {
        self.scheduler.fiber_count()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

//! Architecture-specific context switching
//!
//! Each backend defines a `Context` (saved callee registers, stack pointer
//! and resume address) and four operations:
//!
//! - `switch_context(save, load, status)`: capture the current point in
//!   `save`, resume `load`; the resumed site's own switch/boot call returns
//!   `status`.
//! - `jump_context(load, status)`: resume without saving. Used when the
//!   current fiber is dead.
//! - `boot_context(save, stack_top, entry, arg)`: capture the current
//!   point, pivot to a fresh stack and call `entry(arg)`. `entry` must not
//!   return.
//! - `boot_jump_context(stack_top, entry, arg)`: pivot without saving.
//!
//! The carried status follows the runtime-wide convention: `0` is reserved
//! for "no context saved", positive means resume normally, negative means
//! resume with error code `-status`.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

/// Entry function invoked atop a freshly booted stack. Receives the opaque
/// argument passed to `boot_context`/`boot_jump_context` and must never
/// return through normal control flow.
pub type EntryFn = extern "C" fn(usize) -> !;

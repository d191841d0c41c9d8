//! Per-fiber record
//!
//! The record lives in the scheduler's arena; queue membership is tracked
//! by id, so moving a fiber between the ready/dead/wait lists never touches
//! this struct.

use crate::current_arch::Context;
use crate::memory::FiberStack;

use strand_core::FiberState;

use std::os::unix::io::RawFd;

/// The unit of scheduling: a coroutine body, a private stack, and the
/// suspension bookkeeping the scheduler needs to resume it.
pub(crate) struct Fiber {
    /// Body to run; taken by the entry trampoline on first dispatch.
    pub(crate) coroutine: Option<Box<dyn FnOnce()>>,

    /// Private stack mapping, reused across recycles.
    pub(crate) stack: FiberStack,

    /// Execution point captured at the last suspension.
    pub(crate) context: Context,

    /// Resumption code: `0` means no context is saved (fresh or dead),
    /// positive resumes normally, negative resumes with errno `-status`.
    pub(crate) status: i32,

    /// The fd this fiber is awaiting, `-1` if none.
    pub(crate) fd: RawFd,

    pub(crate) state: FiberState,
}

impl Fiber {
    pub(crate) fn new(coroutine: Box<dyn FnOnce()>, stack: FiberStack) -> Self {
        Self {
            coroutine: Some(coroutine),
            stack,
            context: Context::new(),
            status: 0,
            fd: -1,
            state: FiberState::Created,
        }
    }

    /// Hand a dead fiber's record and stack to a new coroutine.
    pub(crate) fn recycle(&mut self, coroutine: Box<dyn FnOnce()>) {
        debug_assert!(self.state.is_dead());
        self.coroutine = Some(coroutine);
        self.context = Context::new();
        self.status = 0;
        self.fd = -1;
        self.state = FiberState::Created;
        self.stack.reset();
    }

    /// True when the fiber has never run (or died) and must be entered by
    /// bootstrapping its stack rather than restoring a context.
    #[inline]
    pub(crate) fn needs_boot(&self) -> bool {
        self.status == 0
    }
}

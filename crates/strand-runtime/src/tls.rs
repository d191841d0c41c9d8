//! Thread-local scheduler pointer
//!
//! One scheduler per OS thread. The pointer is installed for the duration
//! of `run` and cleared on return; every public runtime call reads it and
//! treats null as fatal misuse.

use crate::macros::fatality;
use crate::scheduler::Scheduler;

use std::cell::Cell;
use std::ptr;

thread_local! {
    static SCHEDULER: Cell<*mut Scheduler> = const { Cell::new(ptr::null_mut()) };
}

/// Install `scheduler` as this thread's scheduler.
#[inline]
pub fn install(scheduler: *mut Scheduler) {
    SCHEDULER.with(|cell| cell.set(scheduler));
}

/// Clear this thread's scheduler pointer.
#[inline]
pub fn clear() {
    SCHEDULER.with(|cell| cell.set(ptr::null_mut()));
}

/// Whether a scheduler is installed on this thread.
#[inline]
pub fn is_installed() -> bool {
    SCHEDULER.with(|cell| !cell.get().is_null())
}

/// This thread's scheduler; fatal when none is installed.
#[inline]
pub(crate) fn current() -> *mut Scheduler {
    let ptr = SCHEDULER.with(|cell| cell.get());
    if ptr.is_null() {
        fatality!("no scheduler installed on this thread");
    }
    ptr
}

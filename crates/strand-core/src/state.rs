//! Fiber state and I/O event types

use core::fmt;

/// State of a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Just created (or recycled), not yet started
    Created = 0,

    /// Ready to run, in the ready queue
    Ready = 1,

    /// Currently executing on its own stack
    Running = 2,

    /// Suspended waiting for a timer only
    TimerWaiting = 3,

    /// Suspended waiting for fd readiness (possibly with a timeout)
    IoWaiting = 4,

    /// Body returned or exited, in the dead queue awaiting reclamation
    Dead = 5,
}

impl FiberState {
    /// Check if this state allows the fiber to be dispatched
    #[inline]
    pub const fn is_runnable(&self) -> bool {
        matches!(self, FiberState::Created | FiberState::Ready)
    }

    /// Check if the fiber is suspended on an external event
    #[inline]
    pub const fn is_waiting(&self) -> bool {
        matches!(self, FiberState::TimerWaiting | FiberState::IoWaiting)
    }

    /// Check if the fiber has terminated
    #[inline]
    pub const fn is_dead(&self) -> bool {
        matches!(self, FiberState::Dead)
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberState::Created => write!(f, "created"),
            FiberState::Ready => write!(f, "ready"),
            FiberState::Running => write!(f, "running"),
            FiberState::TimerWaiting => write!(f, "timer-waiting"),
            FiberState::IoWaiting => write!(f, "io-waiting"),
            FiberState::Dead => write!(f, "dead"),
        }
    }
}

/// The readiness condition a fiber can await on a watched fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    /// The fd has data to read (or a peer to accept)
    Readability,
    /// The fd can be written without blocking
    Writability,
}

impl fmt::Display for IoEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoEvent::Readability => write!(f, "readable"),
            IoEvent::Writability => write!(f, "writable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(FiberState::Ready.is_runnable());
        assert!(FiberState::Created.is_runnable());
        assert!(!FiberState::Running.is_runnable());

        assert!(FiberState::TimerWaiting.is_waiting());
        assert!(FiberState::IoWaiting.is_waiting());
        assert!(!FiberState::Ready.is_waiting());

        assert!(FiberState::Dead.is_dead());
        assert!(!FiberState::Running.is_dead());
    }
}

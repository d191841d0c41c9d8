//! I/O readiness poller backed by epoll
//!
//! Every fd the runtime touches is registered once, edge-triggered, for
//! both directions. Fibers are linked into per-fd reader/writer FIFOs and
//! spliced out wholesale when the kernel reports the matching event.
//!
//! Edge-triggered registration is safe here because awaiting is only ever
//! entered after a syscall returned `EWOULDBLOCK`: the fd is not ready at
//! that moment, so the readiness transition the fiber needs is still ahead.

use crate::macros::fatality;

use strand_core::{FiberId, IoEvent};

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;

/// Fibers parked on one fd, split by awaited direction.
#[derive(Default)]
struct FdWaiters {
    readers: VecDeque<FiberId>,
    writers: VecDeque<FiberId>,
}

/// Kernel readiness multiplexer plus the fd → waiting-fibers map.
pub struct IoPoll {
    epoll_fd: RawFd,
    watched: HashMap<RawFd, FdWaiters>,
    /// Reusable buffer for epoll_wait results.
    events: Vec<libc::epoll_event>,
}

impl IoPoll {
    /// Create the epoll instance. `max_events` bounds how many kernel
    /// events one `wait` call can harvest.
    pub fn new(max_events: usize) -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll_fd,
            watched: HashMap::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    /// Register `fd` for edge-triggered monitoring of both directions.
    /// Idempotent per fd.
    pub fn watch(&mut self, fd: RawFd) -> io::Result<()> {
        if self.watched.contains_key(&fd) {
            return Ok(());
        }
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLRDHUP | libc::EPOLLET) as u32,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        self.watched.insert(fd, FdWaiters::default());
        Ok(())
    }

    /// Deregister `fd` and drain every fiber waiting on it into `drained`.
    /// A no-op for fds that are not watched.
    pub fn unwatch(&mut self, fd: RawFd, drained: &mut Vec<FiberId>) {
        let Some(mut waiters) = self.watched.remove(&fd) else {
            return;
        };
        drained.extend(waiters.readers.drain(..));
        drained.extend(waiters.writers.drain(..));

        let ret = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // ENOENT / EBADF are expected if the fd was already closed.
            if err.raw_os_error() != Some(libc::ENOENT)
                && err.raw_os_error() != Some(libc::EBADF)
            {
                log::warn!("epoll deregister of fd {} failed: {}", fd, err);
            }
        }
    }

    pub fn is_watched(&self, fd: RawFd) -> bool {
        self.watched.contains_key(&fd)
    }

    /// Link `id` into `fd`'s wait set for `event`. The caller has already
    /// validated that `fd` is watched.
    pub fn add_awaiter(&mut self, id: FiberId, fd: RawFd, event: IoEvent) {
        match self.watched.get_mut(&fd) {
            Some(waiters) => match event {
                IoEvent::Readability => waiters.readers.push_back(id),
                IoEvent::Writability => waiters.writers.push_back(id),
            },
            None => {
                log::error!("awaiter {} added on unwatched fd {}", id, fd);
                debug_assert!(false, "awaiter on unwatched fd");
            }
        }
    }

    /// Unlink `id` from whichever of `fd`'s wait sets holds it.
    pub fn remove_awaiter(&mut self, id: FiberId, fd: RawFd) {
        let Some(waiters) = self.watched.get_mut(&fd) else {
            return;
        };
        if let Some(pos) = waiters.readers.iter().position(|&w| w == id) {
            waiters.readers.remove(pos);
            return;
        }
        if let Some(pos) = waiters.writers.iter().position(|&w| w == id) {
            waiters.writers.remove(pos);
        }
    }

    /// Block up to `timeout_ms` (negative blocks indefinitely) and splice
    /// every fiber whose awaited event fired into `woken`.
    ///
    /// Returns `true` when at least one fiber was produced or the timeout
    /// elapsed; `false` when the call was interrupted, or readiness woke
    /// nobody, and the caller should retry with a recomputed timeout.
    pub fn wait(&mut self, timeout_ms: i32, woken: &mut Vec<FiberId>) -> bool {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return false;
            }
            fatality!("epoll_wait failed: {}", err);
        }
        if n == 0 {
            return true;
        }

        let before = woken.len();
        for i in 0..n as usize {
            let ev = self.events[i];
            let fd = ev.u64 as RawFd;
            let Some(waiters) = self.watched.get_mut(&fd) else {
                continue;
            };
            let flags = ev.events as i32;
            // Error and hangup conditions release both directions so the
            // fibers can observe the failure from their syscall.
            let failed = flags & (libc::EPOLLERR | libc::EPOLLHUP) != 0;
            if failed || flags & (libc::EPOLLIN | libc::EPOLLRDHUP) != 0 {
                woken.extend(waiters.readers.drain(..));
            }
            if failed || flags & libc::EPOLLOUT != 0 {
                woken.extend(waiters.writers.drain(..));
            }
        }
        woken.len() > before
    }
}

impl Drop for IoPoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonblocking_pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe {
            libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC)
        };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn close_pair(r: RawFd, w: RawFd) {
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_watch_is_idempotent() {
        let mut poll = IoPoll::new(8).unwrap();
        let (r, w) = nonblocking_pipe();

        assert!(!poll.is_watched(r));
        poll.watch(r).unwrap();
        poll.watch(r).unwrap();
        assert!(poll.is_watched(r));

        let mut drained = Vec::new();
        poll.unwatch(r, &mut drained);
        assert!(drained.is_empty());
        assert!(!poll.is_watched(r));

        close_pair(r, w);
    }

    #[test]
    fn test_pipe_readiness_wakes_reader() {
        let mut poll = IoPoll::new(8).unwrap();
        let (r, w) = nonblocking_pipe();
        poll.watch(r).unwrap();
        poll.add_awaiter(FiberId::new(1), r, IoEvent::Readability);

        // Make the read end readable.
        let ret = unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(ret, 1);

        let mut woken = Vec::new();
        assert!(poll.wait(1000, &mut woken));
        assert_eq!(woken, vec![FiberId::new(1)]);

        close_pair(r, w);
    }

    #[test]
    fn test_timeout_with_no_events() {
        let mut poll = IoPoll::new(8).unwrap();
        let mut woken = Vec::new();
        // Timeout elapsing counts as progress for the caller.
        assert!(poll.wait(1, &mut woken));
        assert!(woken.is_empty());
    }

    #[test]
    fn test_unwatch_drains_both_directions() {
        let mut poll = IoPoll::new(8).unwrap();
        let (r, w) = nonblocking_pipe();
        poll.watch(r).unwrap();
        poll.watch(w).unwrap();
        poll.add_awaiter(FiberId::new(1), r, IoEvent::Readability);
        poll.add_awaiter(FiberId::new(2), r, IoEvent::Writability);

        let mut drained = Vec::new();
        poll.unwatch(r, &mut drained);
        assert_eq!(drained, vec![FiberId::new(1), FiberId::new(2)]);

        close_pair(r, w);
    }

    #[test]
    fn test_remove_awaiter_unlinks() {
        let mut poll = IoPoll::new(8).unwrap();
        let (r, w) = nonblocking_pipe();
        poll.watch(r).unwrap();
        poll.add_awaiter(FiberId::new(1), r, IoEvent::Readability);
        poll.remove_awaiter(FiberId::new(1), r);

        let ret = unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(ret, 1);

        // Readiness fires but nobody is waiting: reported as no effect.
        let mut woken = Vec::new();
        assert!(!poll.wait(100, &mut woken));
        assert!(woken.is_empty());

        close_pair(r, w);
    }
}

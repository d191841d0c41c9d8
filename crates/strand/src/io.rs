//! Blocking-looking I/O over watched nonblocking fds
//!
//! Every fd is created nonblocking and registered with the poller; the
//! calling fiber parks in `await_io_event` whenever a syscall reports
//! `EWOULDBLOCK` and retries once the readiness edge arrives. `EINTR` is
//! always retried. Closing goes through [`close`] so the registration and
//! any parked waiters are cleaned up (waiters resume with `EBADF`).
//!
//! All functions here must run with a scheduler installed on the current
//! thread; the awaiting ones must run inside a fiber.

use strand_core::IoEvent;
use strand_runtime::{await_io_event, io_is_watched, unwatch_io, watch_io};

use std::ffi::CString;
use std::io;
use std::net::SocketAddr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr;

/// Watch a freshly created fd, closing it if registration fails.
fn register(fd: RawFd) -> io::Result<RawFd> {
    if let Err(e) = watch_io(fd) {
        log::warn!("watch of fd {} failed, closing: {}", fd, e);
        unsafe {
            libc::close(fd);
        }
        return Err(e);
    }
    Ok(fd)
}

fn bad_fd() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

/// Open `path` nonblocking and register it with the poller.
pub fn open<P: AsRef<Path>>(path: P, flags: libc::c_int, mode: libc::mode_t) -> io::Result<RawFd> {
    let cpath = CString::new(path.as_ref().as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let fd = loop {
        let fd = unsafe {
            libc::open(cpath.as_ptr(), flags | libc::O_NONBLOCK, mode as libc::c_uint)
        };
        if fd >= 0 {
            break fd;
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    };
    register(fd)
}

/// Create a nonblocking pipe with both ends registered. Returns
/// `(read_end, write_end)`.
pub fn pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0i32; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    if let Err(e) = watch_io(fds[0]) {
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
        return Err(e);
    }
    if let Err(e) = watch_io(fds[1]) {
        unwatch_io(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
        return Err(e);
    }
    Ok((fds[0], fds[1]))
}

/// Create a nonblocking socket and register it with the poller.
pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(domain, ty | libc::SOCK_NONBLOCK, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    register(fd)
}

/// Create a nonblocking eventfd and register it with the poller.
pub fn eventfd(initval: libc::c_uint, flags: libc::c_int) -> io::Result<RawFd> {
    let fd = unsafe { libc::eventfd(initval, flags | libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    register(fd)
}

/// Close a watched fd.
///
/// Fails with `EBADF` for fds the runtime does not know. The registration
/// is always dropped, waking every fiber parked on the fd with `EBADF`.
pub fn close(fd: RawFd) -> io::Result<()> {
    if !io_is_watched(fd) {
        return Err(bad_fd());
    }
    let result = loop {
        let result = unsafe { libc::close(fd) };
        if result >= 0 {
            break result;
        }
        if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            break result;
        }
    };
    // Capture the close error before unwatch runs its own syscalls.
    let err = if result < 0 {
        Some(io::Error::last_os_error())
    } else {
        None
    };
    unwatch_io(fd);
    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Read into `buf`, parking the fiber until the fd is readable.
///
/// `timeout_ms < 0` waits without a deadline; expiry fails with
/// `ETIMEDOUT`, a concurrent [`close`] with `EBADF`.
pub fn read(fd: RawFd, buf: &mut [u8], timeout_ms: i64) -> io::Result<usize> {
    if !io_is_watched(fd) {
        return Err(bad_fd());
    }
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                if await_io_event(fd, IoEvent::Readability, timeout_ms) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Some(libc::EINTR) => {}
            _ => return Err(err),
        }
    }
}

/// Write from `buf`, parking the fiber until the fd is writable.
///
/// Returns the number of bytes accepted by one successful syscall; short
/// writes are the caller's to continue.
pub fn write(fd: RawFd, buf: &[u8], timeout_ms: i64) -> io::Result<usize> {
    if !io_is_watched(fd) {
        return Err(bad_fd());
    }
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                if await_io_event(fd, IoEvent::Writability, timeout_ms) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Some(libc::EINTR) => {}
            _ => return Err(err),
        }
    }
}

/// Accept one connection, parking the fiber until the listener is
/// readable. The accepted fd comes back nonblocking and watched.
pub fn accept(fd: RawFd, timeout_ms: i64) -> io::Result<RawFd> {
    if !io_is_watched(fd) {
        return Err(bad_fd());
    }
    loop {
        let sub = unsafe {
            libc::accept4(fd, ptr::null_mut(), ptr::null_mut(), libc::SOCK_NONBLOCK)
        };
        if sub >= 0 {
            return register(sub);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                if await_io_event(fd, IoEvent::Readability, timeout_ms) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Some(libc::EINTR) => {}
            _ => return Err(err),
        }
    }
}

/// Connect `fd` to `addr`.
///
/// Single attempt: an in-progress connect parks the fiber until the
/// socket is writable, then reads `SO_ERROR` for the verdict.
pub fn connect(fd: RawFd, addr: &SocketAddr, timeout_ms: i64) -> io::Result<()> {
    if !io_is_watched(fd) {
        return Err(bad_fd());
    }
    let (storage, len) = sockaddr_from(addr);
    let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EINTR || code == libc::EINPROGRESS => {
                if await_io_event(fd, IoEvent::Writability, timeout_ms) < 0 {
                    return Err(io::Error::last_os_error());
                }
                let mut optval: libc::c_int = 0;
                let mut optlen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
                let ret = unsafe {
                    libc::getsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        libc::SO_ERROR,
                        &mut optval as *mut _ as *mut libc::c_void,
                        &mut optlen,
                    )
                };
                if ret < 0 {
                    return Err(io::Error::last_os_error());
                }
                if optval != 0 {
                    return Err(io::Error::from_raw_os_error(optval));
                }
            }
            _ => return Err(err),
        }
    }
    Ok(())
}

/// Create, bind and listen a watched TCP socket on `addr` with
/// `SO_REUSEADDR` set.
pub fn listen(addr: &SocketAddr, backlog: libc::c_int) -> io::Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = socket(domain, libc::SOCK_STREAM, 0)?;

    let opt: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let (storage, len) = sockaddr_from(addr);
    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        let _ = close(fd);
        return Err(err);
    }
    let ret = unsafe { libc::listen(fd, backlog) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        let _ = close(fd);
        return Err(err);
    }
    Ok(fd)
}

/// Local address of a bound socket. Handy after binding port 0.
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_into(&storage)
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

fn sockaddr_into(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Ok(SocketAddr::from((
                sin.sin_addr.s_addr.to_ne_bytes(),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::from((
                sin6.sin6_addr.s6_addr,
                u16::from_be(sin6.sin6_port),
            )))
        }
        _ => Err(io::Error::from_raw_os_error(libc::EAFNOSUPPORT)),
    }
}

// src/syscalls.rs
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

// ---- Socket Operations ----

/// Create a non-blocking, close-on-exec TCP listener bound to `addr`.
///
/// SO_REUSEADDR lets a restarted server rebind while old connections sit in
/// TIME_WAIT. SO_REUSEPORT is deliberately not set: a single process owns
/// each address and a second bind must fail loudly.
pub fn create_listen_socket(addr: &SocketAddr) -> io::Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    #[cfg(target_os = "linux")]
    let fd = unsafe {
        let raw = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        OwnedFd::from_raw_fd(raw)
    };

    #[cfg(not(target_os = "linux"))]
    let fd = unsafe {
        let raw = libc::socket(domain, libc::SOCK_STREAM, 0);
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = OwnedFd::from_raw_fd(raw);
        set_nonblocking(raw)?;
        set_cloexec(raw)?;
        fd
    };

    let one: c_int = 1;
    unsafe {
        if libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }

    if let SocketAddr::V6(_) = addr {
        // Keep `[::]:80` and `0.0.0.0:80` independent listeners.
        unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::IPPROTO_IPV6,
                libc::IPV6_V6ONLY,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            );
        }
    }

    bind_addr(fd.as_raw_fd(), addr)?;

    unsafe {
        if libc::listen(fd.as_raw_fd(), libc::SOMAXCONN) < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(TcpListener::from(fd))
}

/// Bind a socket to an address (shared between platforms).
fn bind_addr(fd: c_int, addr: &SocketAddr) -> io::Result<()> {
    unsafe {
        let res = match addr {
            SocketAddr::V4(a) => {
                let mut sin: libc::sockaddr_in = mem::zeroed();
                #[cfg(not(target_os = "linux"))]
                {
                    sin.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
                }
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = a.port().to_be();
                sin.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                };
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
            SocketAddr::V6(a) => {
                let mut sin6: libc::sockaddr_in6 = mem::zeroed();
                #[cfg(not(target_os = "linux"))]
                {
                    sin6.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
                }
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = a.port().to_be();
                sin6.sin6_flowinfo = a.flowinfo();
                sin6.sin6_addr = libc::in6_addr {
                    s6_addr: a.ip().octets(),
                };
                sin6.sin6_scope_id = a.scope_id();
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Accept one pending connection, switched to non-blocking mode.
///
/// Returns `Ok(None)` once the backlog is drained.
pub fn accept_connection(listener: &TcpListener) -> io::Result<Option<(TcpStream, SocketAddr)>> {
    match listener.accept() {
        Ok((stream, peer)) => {
            stream.set_nonblocking(true)?;
            #[cfg(target_os = "macos")]
            unsafe {
                // SO_NOSIGPIPE on accepted socket (macOS has no MSG_NOSIGNAL)
                let one: c_int = 1;
                libc::setsockopt(
                    stream.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_NOSIGPIPE,
                    &one as *const _ as *const c_void,
                    mem::size_of_val(&one) as socklen_t,
                );
            }
            Ok(Some((stream, peer)))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
        Err(e) => Err(e),
    }
}

// ---- Descriptor flags ----

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

// ---- Bounded non-blocking transfers ----
//
// All three return `Ok(None)` when the descriptor has no data / no capacity
// right now; `Ok(Some(0))` from a read means end of stream.

fn would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

pub fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<usize>> {
    let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if res < 0 {
        let err = io::Error::last_os_error();
        if would_block(&err) { Ok(None) } else { Err(err) }
    } else {
        Ok(Some(res as usize))
    }
}

pub fn write_nonblocking(fd: RawFd, buf: &[u8]) -> io::Result<Option<usize>> {
    let res = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
    if res < 0 {
        let err = io::Error::last_os_error();
        if would_block(&err) { Ok(None) } else { Err(err) }
    } else {
        Ok(Some(res as usize))
    }
}

/// Socket write that never raises SIGPIPE on a peer that went away.
pub fn send_nonblocking(fd: RawFd, buf: &[u8]) -> io::Result<Option<usize>> {
    #[cfg(target_os = "linux")]
    let flags = libc::MSG_NOSIGNAL;
    #[cfg(not(target_os = "linux"))]
    let flags = 0;

    let res = unsafe { libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), flags) };
    if res < 0 {
        let err = io::Error::last_os_error();
        if would_block(&err) { Ok(None) } else { Err(err) }
    } else {
        Ok(Some(res as usize))
    }
}

// ---- Pipes and signals ----

/// Create a non-blocking, close-on-exec Unix pipe. Returns (read, write).
pub fn create_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error());
        }
        let read = OwnedFd::from_raw_fd(fds[0]);
        let write = OwnedFd::from_raw_fd(fds[1]);
        for fd in fds {
            set_nonblocking(fd)?;
            set_cloexec(fd)?;
        }
        Ok((read, write))
    }
}

/// Ask a process to terminate. ESRCH (already gone) is not an error.
pub fn terminate(pid: u32) -> io::Result<()> {
    let res = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if res < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

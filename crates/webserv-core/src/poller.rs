// src/poller.rs
//! Readiness multiplexer over `poll(2)`.
//!
//! Every watched descriptor carries a [`Role`] and an [`Interest`] mask. The
//! poller never owns or closes a descriptor; it only borrows the raw number
//! between `register` and `unregister`. `poll(2)` is used rather than epoll
//! because regular files must be watchable too (they always report ready).

use std::collections::HashMap;
use std::io;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::time::Duration;

/// What a registered descriptor is, which decides the readiness bucket it is
/// reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Listener,
    Client,
    ReadableFile,
    WritableFile,
    /// Internal wake-up pipe used to interrupt a blocking wait on shutdown.
    Waker,
}

/// Desired events for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(0b01);
    pub const WRITE: Interest = Interest(0b10);

    #[inline(always)]
    pub fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    #[inline(always)]
    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    #[inline(always)]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn without(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    fn poll_events(self) -> libc::c_short {
        let mut events = 0;
        if self.is_readable() {
            events |= libc::POLLIN;
        }
        if self.is_writable() {
            events |= libc::POLLOUT;
        }
        events
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    role: Role,
    interest: Interest,
}

/// Descriptors whose interest was satisfied by one `wait`, partitioned by role.
#[derive(Debug, Default)]
pub struct Readiness {
    readable_listeners: Vec<RawFd>,
    readable_clients: Vec<RawFd>,
    writable_clients: Vec<RawFd>,
    readable_files: Vec<RawFd>,
    writable_files: Vec<RawFd>,
    woken: bool,
}

impl Readiness {
    pub fn readable_listeners(&self) -> &[RawFd] {
        &self.readable_listeners
    }

    pub fn readable_clients(&self) -> &[RawFd] {
        &self.readable_clients
    }

    pub fn writable_clients(&self) -> &[RawFd] {
        &self.writable_clients
    }

    pub fn readable_files(&self) -> &[RawFd] {
        &self.readable_files
    }

    pub fn writable_files(&self) -> &[RawFd] {
        &self.writable_files
    }

    /// True when the wake pipe fired.
    pub fn woken(&self) -> bool {
        self.woken
    }

    pub fn is_empty(&self) -> bool {
        !self.woken
            && self.readable_listeners.is_empty()
            && self.readable_clients.is_empty()
            && self.writable_clients.is_empty()
            && self.readable_files.is_empty()
            && self.writable_files.is_empty()
    }
}

#[derive(Default)]
pub struct Poller {
    watched: HashMap<RawFd, Entry>,
    // Reused between waits to avoid reallocating the pollfd array.
    pollfds: Vec<libc::pollfd>,
}

impl Poller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `fd` as `role`. Re-registering an fd replaces both role and
    /// interest; registering with identical values is a no-op.
    pub fn register(&mut self, fd: RawFd, role: Role, interest: Interest) {
        self.watched.insert(fd, Entry { role, interest });
    }

    /// Stop watching `fd`. Unknown descriptors are ignored.
    pub fn unregister(&mut self, fd: RawFd) {
        self.watched.remove(&fd);
    }

    pub fn set_interest(&mut self, fd: RawFd, interest: Interest) {
        if let Some(entry) = self.watched.get_mut(&fd) {
            entry.interest = interest;
        }
    }

    pub fn add_interest(&mut self, fd: RawFd, interest: Interest) {
        if let Some(entry) = self.watched.get_mut(&fd) {
            entry.interest = entry.interest | interest;
        }
    }

    pub fn remove_interest(&mut self, fd: RawFd, interest: Interest) {
        if let Some(entry) = self.watched.get_mut(&fd) {
            entry.interest = entry.interest.without(interest);
        }
    }

    pub fn role(&self, fd: RawFd) -> Option<Role> {
        self.watched.get(&fd).map(|e| e.role)
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.watched.get(&fd).map(|e| e.interest)
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.watched.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.watched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }

    /// Block until at least one watched descriptor is ready or `timeout`
    /// elapses (`None` waits indefinitely).
    ///
    /// A signal interrupting the wait yields an empty [`Readiness`] rather
    /// than an error so the caller can re-check its shutdown flag and retry.
    /// Descriptors with an empty interest mask are left out of the poll set
    /// entirely, so a hung-up peer cannot spin the loop while its connection
    /// is busy elsewhere.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Readiness> {
        self.pollfds.clear();
        for (&fd, entry) in &self.watched {
            if entry.interest.is_empty() {
                continue;
            }
            self.pollfds.push(libc::pollfd {
                fd,
                events: entry.interest.poll_events(),
                revents: 0,
            });
        }

        let timeout_ms = match timeout {
            None => -1,
            Some(d) => {
                // Round up so a 100µs deadline does not become a busy 0ms poll.
                let ms = d.as_nanos().div_ceil(1_000_000);
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
        };

        let res = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Readiness::default());
            }
            return Err(err);
        }

        let mut ready = Readiness::default();
        if res == 0 {
            return Ok(ready);
        }

        const HANGUP: libc::c_short = libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
        for pfd in &self.pollfds {
            if pfd.revents == 0 {
                continue;
            }
            let Some(entry) = self.watched.get(&pfd.fd) else {
                continue;
            };
            // Hang-up and error conditions are surfaced through the role's
            // normal bucket; the following read or write reports the cause.
            let readable = entry.interest.is_readable() && pfd.revents & (libc::POLLIN | HANGUP) != 0;
            let writable = entry.interest.is_writable() && pfd.revents & (libc::POLLOUT | HANGUP) != 0;

            match entry.role {
                Role::Listener if readable => ready.readable_listeners.push(pfd.fd),
                Role::Client => {
                    if readable {
                        ready.readable_clients.push(pfd.fd);
                    }
                    if writable {
                        ready.writable_clients.push(pfd.fd);
                    }
                }
                Role::ReadableFile if readable => ready.readable_files.push(pfd.fd),
                Role::WritableFile if writable => ready.writable_files.push(pfd.fd),
                Role::Waker if readable => ready.woken = true,
                _ => {}
            }
        }
        Ok(ready)
    }
}

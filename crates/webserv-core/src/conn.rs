// src/conn.rs
use crate::cgi;
use crate::handler::RequestHandler;
use crate::syscalls::{read_nonblocking, write_nonblocking};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Upper bound on bytes moved per descriptor per loop iteration.
pub const IO_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// One in-flight non-blocking transfer between a connection and a disk file
/// or CGI pipe. Dropping it closes the descriptor.
#[derive(Debug)]
pub struct OpenFile {
    fd: OwnedFd,
    pub direction: Direction,
    /// Bytes read so far, or the bytes still to be flushed.
    pub content: Vec<u8>,
    /// Flush cursor for writes.
    pub written: usize,
    /// Total bytes expected on a read, once known.
    pub expected: Option<usize>,
    pub finished: bool,
    pub is_cgi: bool,
    /// Failure that ended the transfer early.
    pub error: Option<io::Error>,
}

impl OpenFile {
    pub fn reader(fd: impl Into<OwnedFd>, expected: Option<usize>, is_cgi: bool) -> Self {
        Self {
            fd: fd.into(),
            direction: Direction::Read,
            content: Vec::new(),
            written: 0,
            expected,
            finished: false,
            is_cgi,
            error: None,
        }
    }

    pub fn writer(fd: impl Into<OwnedFd>, content: Vec<u8>, is_cgi: bool) -> Self {
        Self {
            fd: fd.into(),
            direction: Direction::Write,
            finished: content.is_empty(),
            content,
            written: 0,
            expected: None,
            is_cgi,
            error: None,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Move at most one chunk. Sets `finished` on EOF, on reaching the
    /// expected size, once everything is flushed, or on error.
    pub fn pump(&mut self) {
        if self.finished {
            return;
        }
        match self.direction {
            Direction::Read => self.pump_read(),
            Direction::Write => self.pump_write(),
        }
    }

    fn pump_read(&mut self) {
        let start = self.content.len();
        self.content.resize(start + IO_CHUNK, 0);
        let res = read_nonblocking(self.raw_fd(), &mut self.content[start..]);
        match res {
            Ok(Some(0)) => {
                self.content.truncate(start);
                self.finished = true;
            }
            Ok(Some(n)) => {
                self.content.truncate(start + n);
                if self.is_cgi && self.expected.is_none() {
                    self.expected = cgi::declared_length(&self.content);
                }
                if self.expected.is_some_and(|total| self.content.len() >= total) {
                    self.finished = true;
                }
            }
            Ok(None) => self.content.truncate(start),
            Err(e) => {
                self.content.truncate(start);
                self.fail(e);
            }
        }
    }

    fn pump_write(&mut self) {
        let end = self.content.len().min(self.written + IO_CHUNK);
        match write_nonblocking(self.raw_fd(), &self.content[self.written..end]) {
            Ok(Some(n)) => {
                self.written += n;
                if self.written == self.content.len() {
                    self.finished = true;
                }
            }
            Ok(None) => {}
            // The script stopped reading its input; its output still counts.
            Err(e) if self.is_cgi && e.kind() == io::ErrorKind::BrokenPipe => self.finished = true,
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, err: io::Error) {
        self.error = Some(err);
        self.finished = true;
    }
}

/// Fully encoded response and its send cursor; `sent <= bytes.len()`.
#[derive(Debug, Default)]
pub struct PendingResponse {
    pub bytes: Vec<u8>,
    pub sent: usize,
}

impl PendingResponse {
    pub fn remaining(&self) -> &[u8] {
        &self.bytes[self.sent..]
    }

    pub fn is_drained(&self) -> bool {
        self.sent >= self.bytes.len()
    }
}

/// Server and location a request was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub server: usize,
    pub location: Option<usize>,
}

pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    /// Servers sharing the listener this connection arrived on.
    pub candidates: Vec<usize>,
    /// Bytes of a request that has not been fully framed yet.
    pub inbuf: Vec<u8>,
    pub handler: Option<RequestHandler>,
    pub route: Option<Route>,
    pub pending: Option<PendingResponse>,
    pub files: HashMap<RawFd, OpenFile>,
    pub close_after_write: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, local: SocketAddr, candidates: Vec<usize>) -> Self {
        Self {
            stream,
            peer,
            local,
            candidates,
            inbuf: Vec::with_capacity(4096),
            handler: None,
            route: None,
            pending: None,
            files: HashMap::new(),
            close_after_write: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// True while a request is being handled or its response drained.
    pub fn is_busy(&self) -> bool {
        self.handler.is_some() || self.pending.is_some()
    }
}

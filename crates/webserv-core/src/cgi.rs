// src/cgi.rs
//! CGI/1.1 subprocess management.
//!
//! A script runs as a child of the server with its stdin and stdout wired to
//! non-blocking pipes. The pipes are handed back to the caller, which drives
//! them through the event loop like any other open file; this module only
//! owns the process itself.

use crate::http::{RequestData, Response};
use crate::syscalls::{self, set_nonblocking};
use memchr::memmem;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Wall-clock budget for a script, measured from spawn.
pub const CGI_TIMEOUT: Duration = Duration::from_secs(3);

pub const SERVER_SOFTWARE: &str = "webserv/0.1";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CgiOutputError {
    #[error("CGI output has no header terminator")]
    MissingHeaders,
    #[error("CGI output has an invalid header line")]
    InvalidHeader,
    #[error("CGI output has an invalid Status header")]
    InvalidStatus,
}

/// Inputs for the CGI/1.1 environment block.
pub struct CgiRequest<'a> {
    pub request: &'a RequestData,
    pub script: &'a Path,
    pub server_name: &'a str,
    pub local: SocketAddr,
    pub peer: SocketAddr,
}

impl CgiRequest<'_> {
    pub fn environment(&self) -> Vec<(String, String)> {
        let req = self.request;
        let script = self.script.to_string_lossy().into_owned();
        let content_length = if req.body.is_empty() && req.header("content-length").is_none() {
            String::new()
        } else {
            req.body.len().to_string()
        };

        let mut env = vec![
            ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
            ("SERVER_PROTOCOL".to_string(), req.version.clone()),
            ("SERVER_SOFTWARE".to_string(), SERVER_SOFTWARE.to_string()),
            ("SERVER_NAME".to_string(), self.server_name.to_string()),
            ("SERVER_PORT".to_string(), self.local.port().to_string()),
            ("REQUEST_METHOD".to_string(), req.method.as_str().to_string()),
            ("REQUEST_URI".to_string(), req.target.clone()),
            ("SCRIPT_NAME".to_string(), req.path.clone()),
            ("SCRIPT_FILENAME".to_string(), script.clone()),
            ("PATH_INFO".to_string(), req.path.clone()),
            ("PATH_TRANSLATED".to_string(), script),
            ("QUERY_STRING".to_string(), req.query.clone()),
            (
                "CONTENT_TYPE".to_string(),
                req.header("content-type").unwrap_or_default().to_string(),
            ),
            ("CONTENT_LENGTH".to_string(), content_length),
            ("REMOTE_ADDR".to_string(), self.peer.ip().to_string()),
            ("REMOTE_PORT".to_string(), self.peer.port().to_string()),
            ("REDIRECT_STATUS".to_string(), "200".to_string()),
        ];

        for (name, value) in &req.headers {
            if name == "content-type" || name == "content-length" {
                continue;
            }
            let key = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
            env.push((key, value.clone()));
        }
        env
    }
}

/// A running (or finished but not yet collected) CGI child.
#[derive(Debug)]
pub struct CgiProcess {
    child: Child,
    started: Instant,
    exit: Option<ExitStatus>,
}

/// Parent-side pipe ends of a freshly spawned script.
pub struct CgiPipes {
    /// Absent when there is no request body to send; the child then sees
    /// EOF on its stdin immediately.
    pub stdin: Option<OwnedFd>,
    pub stdout: OwnedFd,
}

impl CgiProcess {
    /// Start `interpreter script` in the script's directory with a cleared
    /// environment (only `PATH` survives) plus `env`.
    pub fn spawn(
        interpreter: &Path,
        script: &Path,
        env: Vec<(String, String)>,
        with_stdin: bool,
    ) -> io::Result<(Self, CgiPipes)> {
        let dir = script.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));

        let mut command = Command::new(interpreter);
        command
            .arg(script)
            .current_dir(dir)
            .env_clear()
            .envs(env)
            .stdin(if with_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }

        let mut child = command.spawn()?;
        let stdin = child.stdin.take().map(OwnedFd::from);
        let Some(stdout) = child.stdout.take().map(OwnedFd::from) else {
            let _ = child.kill();
            return Err(io::Error::other("CGI stdout pipe missing"));
        };

        let mut process = Self {
            child,
            started: Instant::now(),
            exit: None,
        };
        let nonblocking = set_nonblocking(stdout.as_raw_fd()).and_then(|()| match &stdin {
            Some(fd) => set_nonblocking(fd.as_raw_fd()),
            None => Ok(()),
        });
        if let Err(e) = nonblocking {
            process.terminate();
            return Err(e);
        }

        debug!(pid = process.pid(), script = %script.display(), "spawned CGI script");
        Ok((process, CgiPipes { stdin, stdout }))
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn deadline(&self) -> Instant {
        self.started + CGI_TIMEOUT
    }

    pub fn timed_out(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    /// Non-blocking exit check. Once observed the status is cached.
    pub fn poll_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait()?;
        }
        Ok(self.exit)
    }

    pub fn has_exited(&self) -> bool {
        self.exit.is_some()
    }

    /// Send SIGTERM unless the child is already known to have exited.
    pub fn terminate(&mut self) {
        if self.exit.is_some() {
            return;
        }
        if let Err(e) = syscalls::terminate(self.pid()) {
            warn!(pid = self.pid(), "failed to signal CGI child: {}", e);
        }
    }

    pub fn into_child(self) -> Child {
        self.child
    }
}

// Offset of the body and length of the separator that precedes it. Scripts
// commonly emit bare `\n` line endings, so both forms are accepted.
fn split_head(raw: &[u8]) -> Option<(usize, usize)> {
    let crlf = memmem::find(raw, b"\r\n\r\n").map(|p| (p, 4));
    let lf = memmem::find(raw, b"\n\n").map(|p| (p, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn header_lines(head: &[u8]) -> impl Iterator<Item = &str> {
    std::str::from_utf8(head)
        .unwrap_or("")
        .split('\n')
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.is_empty())
}

/// Total output size implied by a `Content-Length` in the script's header
/// block, once that block has fully arrived.
pub fn declared_length(raw: &[u8]) -> Option<usize> {
    let (pos, sep) = split_head(raw)?;
    header_lines(&raw[..pos]).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("content-length") {
            return None;
        }
        let len = value.trim().parse::<usize>().ok()?;
        Some(pos + sep + len)
    })
}

/// Turn captured script output into a response.
pub fn parse_output(raw: &[u8]) -> Result<Response, CgiOutputError> {
    let (pos, sep) = split_head(raw).ok_or(CgiOutputError::MissingHeaders)?;
    let head = std::str::from_utf8(&raw[..pos]).map_err(|_| CgiOutputError::InvalidHeader)?;

    let mut status = None;
    let mut response = Response::new(200);
    for line in head.split('\n').map(|l| l.trim_end_matches('\r')) {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or(CgiOutputError::InvalidHeader)?;
        let (name, value) = (name.trim(), value.trim());
        if name.eq_ignore_ascii_case("status") {
            let code = value
                .split_whitespace()
                .next()
                .and_then(|c| c.parse::<u16>().ok())
                .filter(|c| (100..=599).contains(c))
                .ok_or(CgiOutputError::InvalidStatus)?;
            status = Some(code);
        } else {
            response = response.header(name, value);
        }
    }

    response.status = match status {
        Some(code) => code,
        None if response.get_header("location").is_some() => 302,
        None => 200,
    };

    let mut body = &raw[pos + sep..];
    if let Some(declared) = response
        .get_header("content-length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        body = &body[..declared.min(body.len())];
    }
    response.body = body.to_vec();
    Ok(response)
}

/// Children that were abandoned (timed out or their client vanished) and
/// still need to be waited on.
#[derive(Debug, Default)]
pub struct Reaper {
    children: Vec<Child>,
}

impl Reaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal `process` and keep it until it can be collected.
    pub fn adopt(&mut self, mut process: CgiProcess) {
        process.terminate();
        if process.has_exited() {
            // Already collected by try_wait.
            return;
        }
        self.children.push(process.into_child());
    }

    /// Collect every child that has exited. Never blocks.
    pub fn reap(&mut self) {
        self.children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = child.id(), %status, "reaped CGI child");
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pid = child.id(), "waiting on CGI child failed: {}", e);
                false
            }
        });
    }

    /// SIGTERM every held child (shutdown path).
    pub fn terminate_all(&mut self) {
        for child in &self.children {
            let _ = syscalls::terminate(child.id());
        }
        self.reap();
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

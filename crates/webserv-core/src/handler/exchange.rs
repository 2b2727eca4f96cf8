use super::{HandlerCtx, Progress};
use crate::cgi::{self, CgiProcess, CgiRequest, Reaper};
use crate::conn::OpenFile;
use crate::http::{RequestData, Response};
use std::fs::File;
use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Poll interval for a script that closed its output but has not exited.
const CGI_EXIT_RECHECK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    NotStarted,
    InProgress,
    Ready,
}

/// A file being read into the response body.
struct BodyRead {
    fd: RawFd,
    status: u16,
    content_type: String,
    last_modified: Option<SystemTime>,
    /// Reading a custom error page; a failure falls back to the built-in body.
    error_page: bool,
}

struct CgiJob {
    process: CgiProcess,
    stdin: Option<RawFd>,
    stdout: RawFd,
    /// Captured stdout once the pipe reached EOF.
    output: Option<Vec<u8>>,
}

enum Awaiting {
    Nothing,
    Body(BodyRead),
    Uploads { fds: Vec<RawFd>, stored: Vec<String> },
    Cgi(CgiJob),
}

/// Request plus the progress made towards its response. Shared by every
/// handler variant; the variants differ only in how they start.
pub struct Exchange {
    pub request: RequestData,
    state: ResponseState,
    awaiting: Awaiting,
    response: Option<Response>,
}

impl Exchange {
    pub fn new(request: RequestData) -> Self {
        Self {
            request,
            state: ResponseState::NotStarted,
            awaiting: Awaiting::Nothing,
            response: None,
        }
    }

    pub fn state(&self) -> ResponseState {
        self.state
    }

    pub fn take_response(&mut self) -> Option<Response> {
        self.response.take()
    }

    /// NotStarted -> InProgress; called first by every `generate_response`.
    pub(super) fn begin(&mut self) {
        debug_assert_eq!(self.state, ResponseState::NotStarted);
        self.state = ResponseState::InProgress;
    }

    pub(super) fn finish(&mut self, response: Response) -> Progress {
        self.awaiting = Awaiting::Nothing;
        self.response = Some(response);
        self.state = ResponseState::Ready;
        Progress::Ready
    }

    /// Answer with `status`, streaming the location's custom page for it when
    /// one is configured and readable.
    pub(super) fn fail(&mut self, status: u16, ctx: &mut HandlerCtx<'_>) -> Progress {
        if let Some(page) = ctx.location.error_page(status) {
            match open_regular(&page) {
                Ok((file, len, _)) => {
                    let content_type = mime_for(&page);
                    return self.read_body(file, len, status, content_type, None, true, ctx);
                }
                Err(e) => debug!(page = %page.display(), "custom error page unavailable: {}", e),
            }
        }
        self.finish(Response::error(status))
    }

    /// Stream a regular file back with `status`.
    pub(super) fn serve_file(&mut self, path: &Path, ctx: &mut HandlerCtx<'_>) -> Progress {
        match open_regular(path) {
            Ok((file, len, modified)) => {
                let content_type = mime_for(path);
                self.read_body(file, len, 200, content_type, modified, false, ctx)
            }
            Err(e) => {
                let status = status_for_io(&e);
                self.fail(status, ctx)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read_body(
        &mut self,
        file: File,
        len: u64,
        status: u16,
        content_type: String,
        last_modified: Option<SystemTime>,
        error_page: bool,
        ctx: &mut HandlerCtx<'_>,
    ) -> Progress {
        let expected = usize::try_from(len).ok();
        let fd = ctx.files.track(OpenFile::reader(file, expected, false));
        self.awaiting = Awaiting::Body(BodyRead {
            fd,
            status,
            content_type,
            last_modified,
            error_page,
        });
        self.resume(ctx)
    }

    /// Write each `(path, bytes)` pair to disk, then answer 201.
    pub(super) fn store_uploads(
        &mut self,
        uploads: Vec<(PathBuf, String, Vec<u8>)>,
        ctx: &mut HandlerCtx<'_>,
    ) -> Progress {
        let mut fds = Vec::with_capacity(uploads.len());
        let mut created = Vec::with_capacity(uploads.len());
        let mut stored = Vec::with_capacity(uploads.len());
        for (path, uri, bytes) in uploads {
            let file = match File::create(&path) {
                Ok(file) => file,
                Err(e) => {
                    warn!(path = %path.display(), "cannot create upload: {}", e);
                    for fd in fds {
                        ctx.files.take(fd);
                    }
                    for path in created {
                        let _ = std::fs::remove_file(path);
                    }
                    return self.fail(500, ctx);
                }
            };
            fds.push(ctx.files.track(OpenFile::writer(file, bytes, false)));
            created.push(path);
            stored.push(uri);
        }
        self.awaiting = Awaiting::Uploads { fds, stored };
        self.resume(ctx)
    }

    /// Launch `script` under `interpreter` and collect its output.
    pub(super) fn start_cgi(&mut self, script: &Path, interpreter: &Path, ctx: &mut HandlerCtx<'_>) -> Progress {
        let server_name = ctx
            .server
            .server_names
            .first()
            .cloned()
            .unwrap_or_else(|| ctx.local.ip().to_string());
        let env = CgiRequest {
            request: &self.request,
            script,
            server_name: &server_name,
            local: ctx.local,
            peer: ctx.peer,
        }
        .environment();

        let body = std::mem::take(&mut self.request.body);
        let (process, pipes) = match CgiProcess::spawn(interpreter, script, env, !body.is_empty()) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(script = %script.display(), "CGI spawn failed: {}", e);
                return self.fail(500, ctx);
            }
        };

        let stdin = pipes
            .stdin
            .map(|fd| ctx.files.track(OpenFile::writer(fd, body, true)));
        let stdout = ctx.files.track(OpenFile::reader(pipes.stdout, None, true));
        self.awaiting = Awaiting::Cgi(CgiJob {
            process,
            stdin,
            stdout,
            output: None,
        });
        self.resume(ctx)
    }

    /// Re-examine whatever the request is waiting on.
    pub fn resume(&mut self, ctx: &mut HandlerCtx<'_>) -> Progress {
        match self.state {
            ResponseState::Ready => return Progress::Ready,
            ResponseState::NotStarted => return Progress::InProgress,
            ResponseState::InProgress => {}
        }

        match std::mem::replace(&mut self.awaiting, Awaiting::Nothing) {
            Awaiting::Nothing => Progress::InProgress,
            Awaiting::Body(read) => self.resume_body(read, ctx),
            Awaiting::Uploads { fds, stored } => self.resume_uploads(fds, stored, ctx),
            Awaiting::Cgi(job) => self.resume_cgi(job, ctx),
        }
    }

    fn resume_body(&mut self, read: BodyRead, ctx: &mut HandlerCtx<'_>) -> Progress {
        if !ctx.files.is_finished(read.fd) {
            self.awaiting = Awaiting::Body(read);
            return Progress::InProgress;
        }
        let Some(file) = ctx.files.take(read.fd) else {
            return self.finish(Response::error(500));
        };
        if let Some(e) = file.error {
            warn!("reading response body failed: {}", e);
            if read.error_page {
                return self.finish(Response::error(read.status));
            }
            return self.fail(500, ctx);
        }

        let mut response = Response::with_body(read.status, &read.content_type, file.content);
        if let Some(modified) = read.last_modified {
            response = response.header("Last-Modified", httpdate::fmt_http_date(modified));
        }
        self.finish(response)
    }

    fn resume_uploads(&mut self, fds: Vec<RawFd>, stored: Vec<String>, ctx: &mut HandlerCtx<'_>) -> Progress {
        if !fds.iter().all(|&fd| ctx.files.is_finished(fd)) {
            self.awaiting = Awaiting::Uploads { fds, stored };
            return Progress::InProgress;
        }

        let mut failed = false;
        for fd in fds {
            if let Some(file) = ctx.files.take(fd)
                && let Some(e) = file.error
            {
                warn!("writing upload failed: {}", e);
                failed = true;
            }
        }
        if failed {
            return self.fail(500, ctx);
        }

        let mut body = String::new();
        for uri in &stored {
            body.push_str(uri);
            body.push('\n');
        }
        let mut response = Response::with_body(201, "text/plain", body);
        if let Some(first) = stored.first() {
            response = response.header("Location", first.clone());
        }
        self.finish(response)
    }

    fn resume_cgi(&mut self, mut job: CgiJob, ctx: &mut HandlerCtx<'_>) -> Progress {
        if let Some(fd) = job.stdin
            && ctx.files.is_finished(fd)
        {
            if let Some(file) = ctx.files.take(fd)
                && let Some(e) = file.error
            {
                debug!(pid = job.process.pid(), "CGI stdin closed early: {}", e);
            }
            job.stdin = None;
        }

        if job.output.is_none() && ctx.files.is_finished(job.stdout) {
            let content = match ctx.files.take(job.stdout) {
                Some(file) => {
                    if let Some(e) = &file.error {
                        warn!(pid = job.process.pid(), "reading CGI output failed: {}", e);
                    }
                    file.content
                }
                None => Vec::new(),
            };
            job.output = Some(content);
        }

        if job.stdin.is_none() && job.output.is_some() {
            match job.process.poll_exit() {
                Ok(Some(status)) => {
                    let output = job.output.take().unwrap_or_default();
                    if !status.success() {
                        warn!(pid = job.process.pid(), %status, "CGI script failed");
                        return self.fail(500, ctx);
                    }
                    return match cgi::parse_output(&output) {
                        Ok(response) => self.finish(response),
                        Err(e) => {
                            warn!(pid = job.process.pid(), "bad CGI output: {}", e);
                            self.fail(502, ctx)
                        }
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(pid = job.process.pid(), "waiting on CGI script failed: {}", e);
                    ctx.reaper.adopt(job.process);
                    return self.fail(500, ctx);
                }
            }
        }

        if job.process.timed_out(ctx.now) {
            warn!(pid = job.process.pid(), "CGI script timed out");
            if let Some(fd) = job.stdin.take() {
                ctx.files.take(fd);
            }
            if job.output.is_none() {
                ctx.files.take(job.stdout);
            }
            ctx.reaper.adopt(job.process);
            return self.fail(504, ctx);
        }

        self.awaiting = Awaiting::Cgi(job);
        Progress::InProgress
    }

    pub(super) fn timer_wait(&self, now: Instant) -> Option<Duration> {
        let Awaiting::Cgi(job) = &self.awaiting else {
            return None;
        };
        let until_deadline = job.process.deadline().saturating_duration_since(now);
        if job.output.is_some() {
            return Some(until_deadline.min(CGI_EXIT_RECHECK));
        }
        Some(until_deadline)
    }

    pub(super) fn timer_due(&self, now: Instant) -> bool {
        match &self.awaiting {
            Awaiting::Cgi(job) => job.output.is_some() || job.process.timed_out(now),
            _ => false,
        }
    }

    pub(super) fn abort(self, reaper: &mut Reaper) {
        if let Awaiting::Cgi(job) = self.awaiting {
            debug!(pid = job.process.pid(), "abandoning CGI script");
            reaper.adopt(job.process);
        }
    }
}

fn open_regular(path: &Path) -> io::Result<(File, u64, Option<SystemTime>)> {
    let file = File::open(path)?;
    let meta = file.metadata()?;
    if !meta.is_file() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "not a regular file"));
    }
    Ok((file, meta.len(), meta.modified().ok()))
}

pub(super) fn mime_for(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

pub(super) fn status_for_io(err: &io::Error) -> u16 {
    match err.kind() {
        io::ErrorKind::NotFound => 404,
        io::ErrorKind::PermissionDenied => 403,
        _ => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{Harness, request};
    use super::super::RequestHandler;
    use crate::http::Method;

    #[test]
    fn custom_error_page_keeps_status() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("404.html"), "<h1>custom</h1>").unwrap();
        let mut harness = Harness::new(dir.path(), "error_page 404 /404.html;");

        let mut handler = RequestHandler::for_request(request(Method::Get, "/nope", &[], b""));
        let response = harness.run(&mut handler);
        assert_eq!(response.status, 404);
        assert_eq!(response.body, b"<h1>custom</h1>");
        assert_eq!(response.get_header("content-type"), Some("text/html"));
    }

    #[test]
    fn unreadable_error_page_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut harness = Harness::new(dir.path(), "error_page 404 /missing.html;");

        let mut handler = RequestHandler::for_request(request(Method::Get, "/nope", &[], b""));
        let response = harness.run(&mut handler);
        assert_eq!(response.status, 404);
        assert!(String::from_utf8(response.body).unwrap().contains("404 Not Found"));
    }

    #[test]
    fn ready_handler_ignores_resume() {
        let dir = tempfile::tempdir().unwrap();
        let mut harness = Harness::new(dir.path(), "");
        let mut handler = RequestHandler::for_request(request(Method::Get, "/nope", &[], b""));
        harness.run(&mut handler);
        assert_eq!(handler.state(), super::ResponseState::Ready);
        assert!(handler.take_response().is_none());
    }
}

//! Resumable request handlers.
//!
//! A handler is created once per request and driven by the event loop
//! through two entry points:
//!
//! - [`RequestHandler::generate_response`] runs once. It either produces the
//!   whole response on the spot (redirects, small error pages, listings) or
//!   opens files / spawns a CGI script, registers their descriptors and
//!   reports [`Progress::InProgress`].
//! - [`RequestHandler::resume`] runs whenever descriptors owned by the
//!   request finished (or a CGI timer is due). It re-examines the open files
//!   and advances until the response is [`Progress::Ready`].
//!
//! Handlers never hold references back into the connection or the poller;
//! everything they may touch arrives through [`HandlerCtx`].

mod delete;
mod error;
mod exchange;
mod get;
mod post;
mod route;

pub use delete::DeleteHandler;
pub use error::ErrorHandler;
pub use exchange::{Exchange, ResponseState};
pub use get::GetHandler;
pub use post::PostHandler;
pub use route::confine;

use crate::cgi::Reaper;
use crate::config::{Location, ServerConfig};
use crate::conn::{Direction, OpenFile};
use crate::http::{Method, RequestData, Response};
use crate::poller::{Interest, Poller, Role};
use crate::slab::ConnId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    InProgress,
    Ready,
}

/// The open files of one connection plus the registries they must be
/// entered into while in flight.
pub struct FileSet<'a> {
    pub poller: &'a mut Poller,
    /// Descriptor -> owning connection, for routing file readiness.
    pub owners: &'a mut HashMap<RawFd, ConnId>,
    pub files: &'a mut HashMap<RawFd, OpenFile>,
    pub conn: ConnId,
}

impl FileSet<'_> {
    /// Hand `file` to the connection and start watching it.
    pub fn track(&mut self, file: OpenFile) -> RawFd {
        let fd = file.raw_fd();
        if !file.finished {
            let (role, interest) = match file.direction {
                Direction::Read => (Role::ReadableFile, Interest::READ),
                Direction::Write => (Role::WritableFile, Interest::WRITE),
            };
            self.poller.register(fd, role, interest);
            self.owners.insert(fd, self.conn);
        }
        self.files.insert(fd, file);
        fd
    }

    /// Unknown descriptors count as finished.
    pub fn is_finished(&self, fd: RawFd) -> bool {
        self.files.get(&fd).is_none_or(|f| f.finished)
    }

    /// Remove a file from the connection and every registry. Dropping the
    /// returned value closes the descriptor.
    pub fn take(&mut self, fd: RawFd) -> Option<OpenFile> {
        self.poller.unregister(fd);
        self.owners.remove(&fd);
        self.files.remove(&fd)
    }
}

/// Everything a handler may use while producing a response.
pub struct HandlerCtx<'a> {
    pub server: &'a ServerConfig,
    pub location: &'a Location,
    pub files: FileSet<'a>,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub reaper: &'a mut Reaper,
    pub now: Instant,
}

pub enum RequestHandler {
    Get(GetHandler),
    Post(PostHandler),
    Delete(DeleteHandler),
    Error(ErrorHandler),
}

impl RequestHandler {
    /// Pick the handler for a parsed request: 400 for malformed input, 501
    /// for methods this server does not implement.
    pub fn for_request(request: RequestData) -> Self {
        if request.malformed {
            return Self::error(request, 400);
        }
        if !request.method.is_supported() {
            return Self::error(request, 501);
        }
        match request.method {
            Method::Post => RequestHandler::Post(PostHandler::new(request)),
            Method::Delete => RequestHandler::Delete(DeleteHandler::new(request)),
            _ => RequestHandler::Get(GetHandler::new(request)),
        }
    }

    pub fn error(request: RequestData, status: u16) -> Self {
        RequestHandler::Error(ErrorHandler::new(request, status))
    }

    pub fn generate_response(&mut self, ctx: &mut HandlerCtx<'_>) -> Progress {
        match self {
            RequestHandler::Get(h) => h.generate_response(ctx),
            RequestHandler::Post(h) => h.generate_response(ctx),
            RequestHandler::Delete(h) => h.generate_response(ctx),
            RequestHandler::Error(h) => h.generate_response(ctx),
        }
    }

    pub fn resume(&mut self, ctx: &mut HandlerCtx<'_>) -> Progress {
        self.exchange_mut().resume(ctx)
    }

    pub fn state(&self) -> ResponseState {
        self.exchange().state()
    }

    pub fn request(&self) -> &RequestData {
        &self.exchange().request
    }

    pub fn take_response(&mut self) -> Option<Response> {
        self.exchange_mut().take_response()
    }

    /// How long the loop may sleep before this handler needs a timer check.
    pub fn timer_wait(&self, now: Instant) -> Option<Duration> {
        self.exchange().timer_wait(now)
    }

    /// Whether a timer check is due without any descriptor activity.
    pub fn timer_due(&self, now: Instant) -> bool {
        self.exchange().timer_due(now)
    }

    /// Give up on the request (client vanished or shutdown). A running CGI
    /// child is signalled and handed to the reaper.
    pub fn abort(self, reaper: &mut Reaper) {
        self.into_exchange().abort(reaper);
    }

    fn exchange(&self) -> &Exchange {
        match self {
            RequestHandler::Get(h) => &h.exchange,
            RequestHandler::Post(h) => &h.exchange,
            RequestHandler::Delete(h) => &h.exchange,
            RequestHandler::Error(h) => &h.exchange,
        }
    }

    fn exchange_mut(&mut self) -> &mut Exchange {
        match self {
            RequestHandler::Get(h) => &mut h.exchange,
            RequestHandler::Post(h) => &mut h.exchange,
            RequestHandler::Delete(h) => &mut h.exchange,
            RequestHandler::Error(h) => &mut h.exchange,
        }
    }

    fn into_exchange(self) -> Exchange {
        match self {
            RequestHandler::Get(h) => h.exchange,
            RequestHandler::Post(h) => h.exchange,
            RequestHandler::Delete(h) => h.exchange,
            RequestHandler::Error(h) => h.exchange,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Minimal harness for driving a handler without a server.

    use super::*;
    use crate::config::Config;
    use std::path::Path;

    pub struct Harness {
        pub config: Config,
        pub poller: Poller,
        pub owners: HashMap<RawFd, ConnId>,
        pub files: HashMap<RawFd, OpenFile>,
        pub reaper: Reaper,
    }

    impl Harness {
        pub fn new(root: &Path, extra: &str) -> Self {
            let src = format!(
                "server {{ listen 127.0.0.1:0; root {}; {} }}",
                root.display(),
                extra
            );
            Self {
                config: Config::parse(&src).unwrap(),
                poller: Poller::new(),
                owners: HashMap::new(),
                files: HashMap::new(),
                reaper: Reaper::new(),
            }
        }

        /// Run the handler to completion, pumping its files in between.
        pub fn run(&mut self, handler: &mut RequestHandler) -> Response {
            let server = &self.config.servers[0];
            let location = server.location(server.match_location(&handler.request().path));
            let mut progress = None;

            for _ in 0..10_000 {
                let mut ctx = HandlerCtx {
                    server,
                    location,
                    files: FileSet {
                        poller: &mut self.poller,
                        owners: &mut self.owners,
                        files: &mut self.files,
                        conn: 0,
                    },
                    peer: "127.0.0.1:40000".parse().unwrap(),
                    local: "127.0.0.1:8080".parse().unwrap(),
                    reaper: &mut self.reaper,
                    now: Instant::now(),
                };
                let step = match progress {
                    None => handler.generate_response(&mut ctx),
                    Some(_) => handler.resume(&mut ctx),
                };
                if step == Progress::Ready {
                    return handler.take_response().unwrap();
                }
                progress = Some(step);

                for file in self.files.values_mut() {
                    file.pump();
                    if file.finished {
                        self.poller.unregister(file.raw_fd());
                        self.owners.remove(&file.raw_fd());
                    }
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            panic!("handler did not complete");
        }
    }

    pub fn request(method: Method, target: &str, headers: &[(&str, &str)], body: &[u8]) -> RequestData {
        let raw = format!("{} {} HTTP/1.1\r\n", method.as_str(), target);
        let mut raw = raw.into_bytes();
        for (k, v) in headers {
            raw.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
        }
        raw.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
        raw.extend_from_slice(body);
        crate::parser::parse_request(&raw).unwrap().0
    }
}

#[cfg(test)]
mod tests {
    use super::testing::request;
    use super::*;

    #[test]
    fn dispatch_by_method() {
        assert!(matches!(
            RequestHandler::for_request(request(Method::Get, "/", &[], b"")),
            RequestHandler::Get(_)
        ));
        assert!(matches!(
            RequestHandler::for_request(request(Method::Delete, "/", &[], b"")),
            RequestHandler::Delete(_)
        ));
        for method in [Method::Put, Method::Options, Method::Unknown] {
            let handler = RequestHandler::for_request(request(method, "/", &[], b""));
            assert!(matches!(&handler, RequestHandler::Error(h) if h.status() == 501));
        }
        let handler = RequestHandler::for_request(RequestData::malformed());
        assert!(matches!(&handler, RequestHandler::Error(h) if h.status() == 400));
        assert_eq!(handler.state(), ResponseState::NotStarted);
    }
}

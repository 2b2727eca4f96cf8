// src/worker.rs
use crate::cgi::Reaper;
use crate::config::Config;
use crate::conn::{Connection, PendingResponse, Route};
use crate::error::ServeResult;
use crate::handler::{FileSet, HandlerCtx, Progress, RequestHandler};
use crate::http::{RequestData, Response};
use crate::parser::{self, BodyFraming, ParseError};
use crate::poller::{Interest, Poller, Role};
use crate::server::Shutdown;
use crate::slab::{ConnId, ConnectionSlab};
use crate::syscalls::{self, read_nonblocking, send_nonblocking};
use std::collections::HashMap;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Connections held at once; further accepts are closed immediately.
pub const MAX_CONNECTIONS: usize = 1024;
/// Bytes read from a client socket per readiness event.
const READ_CHUNK: usize = 16 * 1024;
/// Pipelined bytes buffered while a request is still being answered.
const PIPELINE_LIMIT: usize = 64 * 1024;
/// Poll interval while abandoned CGI children wait to be collected.
const REAP_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) struct Listener {
    pub listener: TcpListener,
    /// Servers that declared this address, in configuration order.
    pub candidates: Vec<usize>,
}

/// The single-threaded event loop and every piece of state it owns.
pub(crate) struct Worker {
    config: Config,
    poller: Poller,
    listeners: HashMap<RawFd, Listener>,
    wake: OwnedFd,
    conns: ConnectionSlab<Connection>,
    /// Client socket -> connection.
    clients: HashMap<RawFd, ConnId>,
    /// In-flight file or pipe -> owning connection.
    owners: HashMap<RawFd, ConnId>,
    reaper: Reaper,
}

impl Worker {
    pub fn new(config: Config, poller: Poller, listeners: HashMap<RawFd, Listener>, wake: OwnedFd) -> Self {
        Self {
            config,
            poller,
            listeners,
            wake,
            conns: ConnectionSlab::new(MAX_CONNECTIONS),
            clients: HashMap::new(),
            owners: HashMap::new(),
            reaper: Reaper::new(),
        }
    }

    pub fn run(&mut self, shutdown: &Shutdown) -> ServeResult<()> {
        let result = self.event_loop(shutdown);

        for id in self.conns.ids() {
            self.close(id);
        }
        self.reaper.terminate_all();
        if !self.reaper.is_empty() {
            debug!("{} CGI child(ren) still exiting", self.reaper.len());
        }
        result
    }

    fn event_loop(&mut self, shutdown: &Shutdown) -> ServeResult<()> {
        while !shutdown.is_triggered() {
            let timeout = self.next_timeout(Instant::now());
            let ready = self.poller.wait(timeout)?;

            if ready.woken() {
                self.drain_wake_pipe();
            }
            if shutdown.is_triggered() {
                break;
            }

            for &fd in ready.readable_listeners() {
                self.accept_all(fd);
            }
            for &fd in ready.readable_clients() {
                self.on_readable(fd);
            }

            let mut resume: Vec<ConnId> = Vec::new();
            for &fd in ready.readable_files().iter().chain(ready.writable_files()) {
                if let Some(id) = self.pump_file(fd) {
                    resume.push(id);
                }
            }
            let now = Instant::now();
            for (id, conn) in self.conns.iter() {
                if conn.handler.as_ref().is_some_and(|h| h.timer_due(now)) {
                    resume.push(id);
                }
            }
            resume.sort_unstable();
            resume.dedup();
            for id in resume {
                self.drive(id, false);
            }

            for &fd in ready.writable_clients() {
                self.on_writable(fd);
            }

            self.reaper.reap();
        }
        Ok(())
    }

    /// Sleep until the nearest CGI timer, or indefinitely when nothing is
    /// time-bound.
    fn next_timeout(&self, now: Instant) -> Option<Duration> {
        let mut timeout = (!self.reaper.is_empty()).then_some(REAP_INTERVAL);
        for (_, conn) in self.conns.iter() {
            if let Some(wait) = conn.handler.as_ref().and_then(|h| h.timer_wait(now)) {
                timeout = Some(timeout.map_or(wait, |t| t.min(wait)));
            }
        }
        timeout
    }

    fn drain_wake_pipe(&mut self) {
        let mut buf = [0u8; 64];
        while let Ok(Some(n)) = read_nonblocking(self.wake.as_raw_fd(), &mut buf) {
            if n == 0 {
                break;
            }
        }
    }

    fn accept_all(&mut self, fd: RawFd) {
        let Some(entry) = self.listeners.get(&fd) else {
            return;
        };
        loop {
            let (stream, peer) = match syscalls::accept_connection(&entry.listener) {
                Ok(Some(accepted)) => accepted,
                Ok(None) => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            };
            let local = match stream.local_addr() {
                Ok(local) => local,
                Err(e) => {
                    warn!(%peer, "cannot read local address: {}", e);
                    continue;
                }
            };
            let client_fd = stream.as_raw_fd();
            let conn = Connection::new(stream, peer, local, entry.candidates.clone());
            match self.conns.allocate(conn) {
                Ok(id) => {
                    self.clients.insert(client_fd, id);
                    self.poller.register(client_fd, Role::Client, Interest::READ);
                    debug!(%peer, id, "accepted connection");
                }
                Err(_) => warn!(%peer, "connection table full, dropping client"),
            }
        }
    }

    fn on_readable(&mut self, fd: RawFd) {
        let Some(&id) = self.clients.get(&fd) else {
            return;
        };
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };

        let start = conn.inbuf.len();
        conn.inbuf.resize(start + READ_CHUNK, 0);
        let res = read_nonblocking(fd, &mut conn.inbuf[start..]);
        match res {
            Ok(Some(0)) => {
                conn.inbuf.truncate(start);
                debug!(peer = %conn.peer, "client closed connection");
                self.close(id);
                return;
            }
            Ok(Some(n)) => conn.inbuf.truncate(start + n),
            Ok(None) => {
                conn.inbuf.truncate(start);
                return;
            }
            Err(e) => {
                conn.inbuf.truncate(start);
                debug!(peer = %conn.peer, "read failed: {}", e);
                self.close(id);
                return;
            }
        }

        if conn.is_busy() {
            // Pipelined bytes wait until the current response drains.
            if conn.inbuf.len() > PIPELINE_LIMIT {
                self.poller.remove_interest(fd, Interest::READ);
            }
            return;
        }
        self.dispatch(id);
    }

    /// Frame the next request in the connection's buffer and start its
    /// handler. Does nothing until a whole request has arrived.
    fn dispatch(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        if conn.inbuf.is_empty() {
            return;
        }

        let head = match parser::parse_head(&conn.inbuf) {
            Ok(head) => head,
            Err(ParseError::Incomplete) => return,
            Err(e) => {
                debug!(peer = %conn.peer, "rejecting request: {}", e);
                return self.reject(id);
            }
        };
        let route = route_for(&self.config, &conn.candidates, head.host(), &head.path);

        // Refuse an oversized body as soon as its size is announced.
        let announced = match parser::body_framing(&head) {
            Ok(BodyFraming::Length(n)) => Some(n),
            Ok(BodyFraming::Chunked) => parser::scan_chunked(&conn.inbuf[head.len..])
                .ok()
                .map(|scan| scan.declared_len),
            _ => None,
        };
        let location = self
            .config
            .server(route.server)
            .map(|server| server.location(route.location));
        if let (Some(len), Some(location)) = (announced, location)
            && location.body_too_large(len as u64)
        {
            debug!(peer = %conn.peer, len, "request body over limit");
            conn.inbuf.clear();
            let request = head.into_request(Vec::new());
            return self.start(id, RequestHandler::error(request, 413), route, true);
        }

        match parser::parse_request(&conn.inbuf) {
            Ok((request, consumed)) => {
                conn.inbuf.drain(..consumed);
                let close = request.wants_close();
                debug!(
                    peer = %conn.peer,
                    method = request.method.as_str(),
                    target = %request.target,
                    "request"
                );
                self.start(id, RequestHandler::for_request(request), route, close);
            }
            Err(ParseError::Incomplete) => {}
            Err(e) => {
                debug!(peer = %conn.peer, "rejecting request: {}", e);
                self.reject(id);
            }
        }
    }

    /// Answer unparseable input with 400 and close afterwards; the rest of
    /// the buffer cannot be framed.
    fn reject(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        conn.inbuf.clear();
        let route = route_for(&self.config, &conn.candidates, None, "/");
        self.start(id, RequestHandler::for_request(RequestData::malformed()), route, true);
    }

    fn start(&mut self, id: ConnId, handler: RequestHandler, route: Route, close: bool) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        conn.handler = Some(handler);
        conn.route = Some(route);
        conn.close_after_write = close;
        self.drive(id, true);
    }

    /// Run the connection's handler once: the first call generates the
    /// response, later calls resume it.
    fn drive(&mut self, id: ConnId, first: bool) {
        let Worker {
            config,
            poller,
            conns,
            owners,
            reaper,
            ..
        } = self;
        let config: &Config = config;
        let Some(conn) = conns.get_mut(id) else {
            return;
        };
        let Some(mut handler) = conn.handler.take() else {
            return;
        };
        let route = conn.route.unwrap_or_else(|| route_for(config, &conn.candidates, None, "/"));
        let Some(server) = config.server(route.server) else {
            warn!(server = route.server, "request routed to unknown server");
            handler.abort(reaper);
            let bytes = Response::error(500).encode(true);
            conn.close_after_write = true;
            conn.pending = Some(PendingResponse { bytes, sent: 0 });
            poller.add_interest(conn.fd(), Interest::WRITE);
            return;
        };

        let mut ctx = HandlerCtx {
            server,
            location: server.location(route.location),
            files: FileSet {
                poller: &mut *poller,
                owners,
                files: &mut conn.files,
                conn: id,
            },
            peer: conn.peer,
            local: conn.local,
            reaper,
            now: Instant::now(),
        };
        let progress = if first {
            handler.generate_response(&mut ctx)
        } else {
            handler.resume(&mut ctx)
        };

        if progress == Progress::InProgress {
            conn.handler = Some(handler);
            return;
        }

        let response = handler.take_response().unwrap_or_else(|| Response::error(500));
        debug!(
            peer = %conn.peer,
            method = handler.request().method.as_str(),
            path = %handler.request().path,
            status = response.status,
            "response ready"
        );
        conn.pending = Some(PendingResponse {
            bytes: response.encode(conn.close_after_write),
            sent: 0,
        });
        poller.add_interest(conn.fd(), Interest::WRITE);
    }

    /// Move one chunk for a file. Returns the owner when the file just
    /// finished and its handler should be resumed.
    fn pump_file(&mut self, fd: RawFd) -> Option<ConnId> {
        let id = *self.owners.get(&fd)?;
        let file = self.conns.get_mut(id)?.files.get_mut(&fd)?;
        file.pump();
        if !file.finished {
            return None;
        }
        self.poller.unregister(fd);
        self.owners.remove(&fd);
        Some(id)
    }

    fn on_writable(&mut self, fd: RawFd) {
        let Some(&id) = self.clients.get(&fd) else {
            return;
        };
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        let Some(pending) = conn.pending.as_mut() else {
            self.poller.remove_interest(fd, Interest::WRITE);
            return;
        };

        match send_nonblocking(fd, pending.remaining()) {
            Ok(Some(n)) => pending.sent += n,
            Ok(None) => return,
            Err(e) => {
                debug!(peer = %conn.peer, "write failed: {}", e);
                self.close(id);
                return;
            }
        }
        if !pending.is_drained() {
            return;
        }

        conn.pending = None;
        conn.route = None;
        if conn.close_after_write {
            self.close(id);
            return;
        }
        self.poller.set_interest(fd, Interest::READ);
        self.dispatch(id);
    }

    /// Tear a connection down: stop watching its socket and files, abandon
    /// its handler and close every descriptor it owns.
    fn close(&mut self, id: ConnId) {
        let Some(mut conn) = self.conns.free(id) else {
            return;
        };
        let fd = conn.fd();
        self.poller.unregister(fd);
        self.clients.remove(&fd);
        for file_fd in conn.files.keys() {
            self.poller.unregister(*file_fd);
            self.owners.remove(file_fd);
        }
        if let Some(handler) = conn.handler.take() {
            handler.abort(&mut self.reaper);
        }
        debug!(peer = %conn.peer, id, "connection closed");
    }
}

fn route_for(config: &Config, candidates: &[usize], host: Option<&str>, path: &str) -> Route {
    let server = config.select_server(candidates, host);
    let location = config.server(server).and_then(|s| s.match_location(path));
    Route { server, location }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_prefers_matching_host() {
        let config = Config::parse(
            "server { listen 127.0.0.1:0; server_name a.test; }
             server { listen 127.0.0.1:0; server_name b.test; location /api { } }",
        )
        .unwrap();
        let candidates = [0, 1];

        let route = route_for(&config, &candidates, Some("b.test"), "/api/x");
        assert_eq!(route, Route { server: 1, location: Some(0) });

        let route = route_for(&config, &candidates, Some("other"), "/api/x");
        assert_eq!(route, Route { server: 0, location: None });

        let route = route_for(&config, &candidates, None, "/");
        assert_eq!(route.server, 0);
    }

    #[test]
    fn idle_loop_has_no_timeout() {
        let config = Config::parse("server { listen 127.0.0.1:0; }").unwrap();
        let (rx, _tx) = syscalls::create_pipe().unwrap();
        let worker = Worker::new(config, Poller::new(), HashMap::new(), rx);
        assert_eq!(worker.next_timeout(Instant::now()), None);
    }
}

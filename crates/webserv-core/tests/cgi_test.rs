use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use webserv_core::{Config, ServeResult, Server, Shutdown};

const ECHO: &str = "printf 'Content-Type: text/plain\\r\\n\\r\\n'\n\
printf 'method=%s query=%s\\n' \"$REQUEST_METHOD\" \"$QUERY_STRING\"\n\
cat\n";

struct CgiServer {
    addr: SocketAddr,
    shutdown: Shutdown,
    handle: Option<JoinHandle<ServeResult<()>>>,
    root: tempfile::TempDir,
}

impl CgiServer {
    fn start(scripts: &[(&str, &str)]) -> Self {
        let root = tempfile::tempdir().unwrap();
        for (name, body) in scripts {
            std::fs::write(root.path().join(name), body).unwrap();
        }
        let src = format!(
            "server {{ listen 127.0.0.1:0; root {}; cgi_handler .sh /bin/sh; }}",
            root.path().display()
        );
        let server = Server::bind(Config::parse(&src).unwrap()).unwrap();
        let addr = server.local_addrs()[0];
        let shutdown = server.shutdown_handle();
        let handle = thread::spawn(move || server.run());
        Self {
            addr,
            shutdown,
            handle: Some(handle),
            root,
        }
    }

    fn root(&self) -> &Path {
        self.root.path()
    }

    fn send(&self, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(15))).unwrap();
        stream.write_all(raw).unwrap();
        let mut res = Vec::new();
        stream.read_to_end(&mut res).unwrap();
        String::from_utf8_lossy(&res).into_owned()
    }
}

impl Drop for CgiServer {
    fn drop(&mut self) {
        self.shutdown.trigger();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn status(res: &str) -> u16 {
    res.split(' ').nth(1).and_then(|s| s.parse().ok()).unwrap_or(0)
}

fn body(res: &str) -> &str {
    res.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}

#[test]
fn get_runs_script_with_query() {
    let server = CgiServer::start(&[("echo.sh", ECHO)]);

    let res = server.send(b"GET /echo.sh?x=1 HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert_eq!(status(&res), 200);
    assert!(res.contains("Content-Type: text/plain\r\n"));
    assert_eq!(body(&res), "method=GET query=x=1\n");
}

#[test]
fn post_body_reaches_stdin() {
    let server = CgiServer::start(&[("echo.sh", ECHO)]);

    let res = server.send(
        b"POST /echo.sh HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nConnection: close\r\n\r\nping",
    );
    assert_eq!(status(&res), 200);
    assert_eq!(body(&res), "method=POST query=\nping");
    // CGI requests are not stored as uploads.
    assert!(!server.root().join("uploads").exists());
}

#[test]
fn status_header_sets_response_code() {
    let script = "printf 'Status: 418 Teapot\\r\\nContent-Type: text/plain\\r\\n\\r\\nshort'\n";
    let server = CgiServer::start(&[("tea.sh", script)]);

    let res = server.send(b"GET /tea.sh HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert_eq!(status(&res), 418);
    assert_eq!(body(&res), "short");
}

#[test]
fn failing_script_is_500() {
    let server = CgiServer::start(&[("fail.sh", "exit 3\n")]);

    let res = server.send(b"GET /fail.sh HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert_eq!(status(&res), 500);
}

#[test]
fn headerless_output_is_502() {
    let server = CgiServer::start(&[("bad.sh", "echo no header block here\n")]);

    let res = server.send(b"GET /bad.sh HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert_eq!(status(&res), 502);
}

#[test]
fn missing_script_is_404() {
    let server = CgiServer::start(&[]);

    let res = server.send(b"GET /ghost.sh HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert_eq!(status(&res), 404);
}

#[test]
fn slow_script_times_out_without_blocking_others() {
    let server = CgiServer::start(&[("slow.sh", "sleep 30\n"), ("echo.sh", ECHO)]);
    let addr = server.addr;

    let started = Instant::now();
    let slow = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(15))).unwrap();
        stream
            .write_all(b"GET /slow.sh HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut res = String::new();
        stream.read_to_string(&mut res).unwrap();
        res
    });

    thread::sleep(Duration::from_millis(200));
    let res = server.send(b"GET /echo.sh HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert_eq!(status(&res), 200);
    assert!(started.elapsed() < Duration::from_secs(3));

    let res = slow.join().unwrap();
    assert_eq!(status(&res), 504);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_secs(10));
}

/// Running means the pid still exists and is not a zombie.
fn is_running(pid: &str) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(") ")
            .map(|(_, rest)| !rest.starts_with('Z'))
            .unwrap_or(false),
        Err(_) => false,
    }
}

#[test]
fn timed_out_script_is_terminated() {
    let server = CgiServer::start(&[("hang.sh", "echo $$ > hang.pid\nexec sleep 30\n")]);

    let res = server.send(b"GET /hang.sh HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert_eq!(status(&res), 504);

    let pid = std::fs::read_to_string(server.root().join("hang.pid")).unwrap();
    let pid = pid.trim().to_string();
    assert!(!pid.is_empty());

    let deadline = Instant::now() + Duration::from_secs(2);
    while is_running(&pid) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert!(!is_running(&pid), "CGI child {pid} still running after timeout");
}

//! Server configuration.
//!
//! The file format is a small nginx dialect: a global context holding one or
//! more `server { ... }` blocks, each of which may contain `location <prefix>
//! { ... }` blocks. Values flow downward: a server starts as a copy of the
//! global settings and a location as a copy of its server.
//!
//! ```text
//! client_max_body_size 10m;
//!
//! server {
//!     listen 8080;
//!     server_name example.com;
//!     root ./www;
//!     error_page 404 /errors/404.html;
//!     cgi_handler .py /usr/bin/python3;
//!
//!     location /uploads {
//!         limit_except GET POST DELETE;
//!         upload_store /uploads;
//!     }
//!
//!     location /old {
//!         return 301 /new;
//!     }
//! }
//! ```

mod parse;

use crate::http::Method;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

pub const DEFAULT_ROOT: &str = "./html";
pub const DEFAULT_INDEX: &str = "index.html";
pub const DEFAULT_CLIENT_MAX_BODY_SIZE: u64 = 1_000_000;
pub const DEFAULT_UPLOAD_STORE: &str = "/uploads";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("config defines no server block")]
    NoServers,
}

impl ConfigError {
    pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
        ConfigError::Syntax {
            line,
            message: message.into(),
        }
    }
}

/// `return <code> [target]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub status: u16,
    pub target: Option<String>,
}

/// Effective settings for one location, with server and global values
/// already folded in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub prefix: String,
    pub root: PathBuf,
    pub index: Vec<String>,
    /// Upper bound on request bodies in bytes; 0 disables the check.
    pub client_max_body_size: u64,
    pub autoindex: bool,
    /// Status code -> page URI, resolved against `root`.
    pub error_pages: HashMap<u16, String>,
    /// Extension (with leading dot) -> interpreter.
    pub cgi_handlers: HashMap<String, PathBuf>,
    pub limit_except: Vec<Method>,
    pub upload_store: String,
    pub redirect: Option<Redirect>,
}

impl Default for Location {
    fn default() -> Self {
        Self {
            prefix: String::from("/"),
            root: PathBuf::from(DEFAULT_ROOT),
            index: vec![DEFAULT_INDEX.to_string()],
            client_max_body_size: DEFAULT_CLIENT_MAX_BODY_SIZE,
            autoindex: false,
            error_pages: HashMap::new(),
            cgi_handlers: HashMap::new(),
            limit_except: Vec::new(),
            upload_store: DEFAULT_UPLOAD_STORE.to_string(),
            redirect: None,
        }
    }
}

impl Location {
    /// Method policy. Without `limit_except`, GET and POST are open and
    /// DELETE must be granted explicitly.
    pub fn allows(&self, method: Method) -> bool {
        if self.limit_except.is_empty() {
            return matches!(method, Method::Get | Method::Post);
        }
        self.limit_except.contains(&method)
    }

    pub fn body_too_large(&self, len: u64) -> bool {
        self.client_max_body_size != 0 && len > self.client_max_body_size
    }

    /// Interpreter registered for the extension of `path`, if any.
    pub fn cgi_interpreter(&self, path: &Path) -> Option<&Path> {
        let ext = path.extension()?.to_str()?;
        self.cgi_handlers
            .get(&format!(".{ext}"))
            .map(PathBuf::as_path)
    }

    /// Directory uploads are written to.
    pub fn upload_dir(&self) -> PathBuf {
        self.root.join(self.upload_store.trim_start_matches('/'))
    }

    /// Filesystem path of the custom page for `status`, if configured.
    pub fn error_page(&self, status: u16) -> Option<PathBuf> {
        self.error_pages
            .get(&status)
            .map(|uri| self.root.join(uri.trim_start_matches('/')))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: Vec<SocketAddr>,
    pub server_names: Vec<String>,
    /// Settings used when no location prefix matches.
    pub defaults: Location,
    pub locations: Vec<Location>,
}

impl ServerConfig {
    /// Index of the longest location prefix matching `path`.
    pub fn match_location(&self, path: &str) -> Option<usize> {
        self.locations
            .iter()
            .enumerate()
            .filter(|(_, loc)| path.starts_with(loc.prefix.as_str()))
            .max_by_key(|(_, loc)| loc.prefix.len())
            .map(|(i, _)| i)
    }

    pub fn location(&self, index: Option<usize>) -> &Location {
        index
            .and_then(|i| self.locations.get(i))
            .unwrap_or(&self.defaults)
    }

    pub fn answers_to(&self, host: &str) -> bool {
        self.server_names
            .iter()
            .any(|name| name.eq_ignore_ascii_case(host))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&src)
    }

    pub fn parse(src: &str) -> Result<Self, ConfigError> {
        parse::parse_config(src)
    }

    /// Distinct listen addresses in declaration order, each with the indices
    /// of the servers that declared it.
    pub fn listen_groups(&self) -> Vec<(SocketAddr, Vec<usize>)> {
        let mut groups: Vec<(SocketAddr, Vec<usize>)> = Vec::new();
        for (i, server) in self.servers.iter().enumerate() {
            for addr in &server.listen {
                match groups.iter_mut().find(|(a, _)| a == addr) {
                    Some((_, servers)) => servers.push(i),
                    None => groups.push((*addr, vec![i])),
                }
            }
        }
        groups
    }

    /// Pick the server for a request that arrived on a listener shared by
    /// `candidates`: the first whose `server_name` matches `host`, otherwise
    /// the first candidate.
    pub fn select_server(&self, candidates: &[usize], host: Option<&str>) -> usize {
        let fallback = candidates.first().copied().unwrap_or(0);
        let Some(host) = host else {
            return fallback;
        };
        candidates
            .iter()
            .copied()
            .find(|&i| self.servers.get(i).is_some_and(|s| s.answers_to(host)))
            .unwrap_or(fallback)
    }

    pub fn server(&self, index: usize) -> Option<&ServerConfig> {
        self.servers.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        # global defaults
        client_max_body_size 2k;
        error_page 404 /404.html;

        server {
            listen 127.0.0.1:0;
            server_name example.com www.example.com;
            root /srv/www;
            index home.html;

            location /upload {
                limit_except get POST delete;
                upload_store "/files";
                client_max_body_size 0;
            }

            location /upload/big {
                error_page 404 500 /oops.html;
            }

            location /old {
                return 301 /new;
            }
        }

        server {
            listen 127.0.0.1:0;
            server_name other.test;
            autoindex on;
        }
    "#;

    #[test]
    fn inheritance_flows_downward() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.servers.len(), 2);

        let first = &config.servers[0];
        assert_eq!(first.defaults.root, PathBuf::from("/srv/www"));
        assert_eq!(first.defaults.index, vec!["home.html"]);
        assert_eq!(first.defaults.client_max_body_size, 2000);
        assert_eq!(first.defaults.error_pages.get(&404).map(String::as_str), Some("/404.html"));

        let upload = &first.locations[0];
        assert_eq!(upload.prefix, "/upload");
        assert_eq!(upload.root, PathBuf::from("/srv/www"));
        assert_eq!(upload.client_max_body_size, 0);
        assert_eq!(upload.upload_store, "/files");
        assert_eq!(upload.limit_except, vec![Method::Get, Method::Post, Method::Delete]);

        let big = &first.locations[1];
        assert_eq!(big.error_pages.get(&404).map(String::as_str), Some("/oops.html"));
        assert_eq!(big.error_pages.get(&500).map(String::as_str), Some("/oops.html"));

        let old = &first.locations[2];
        assert_eq!(
            old.redirect,
            Some(Redirect {
                status: 301,
                target: Some("/new".into())
            })
        );

        let second = &config.servers[1];
        assert!(second.defaults.autoindex);
        assert_eq!(second.defaults.root, PathBuf::from(DEFAULT_ROOT));
        assert_eq!(second.defaults.index, vec![DEFAULT_INDEX]);
    }

    #[test]
    fn longest_prefix_wins() {
        let config = Config::parse(SAMPLE).unwrap();
        let server = &config.servers[0];
        assert_eq!(server.match_location("/upload/big/file"), Some(1));
        assert_eq!(server.match_location("/upload/x"), Some(0));
        assert_eq!(server.match_location("/elsewhere"), None);
        assert_eq!(server.location(None).prefix, "/");
    }

    #[test]
    fn host_selects_server() {
        let config = Config::parse(SAMPLE).unwrap();
        let groups = config.listen_groups();
        assert_eq!(groups.len(), 1);
        let candidates = &groups[0].1;
        assert_eq!(candidates, &vec![0, 1]);
        assert_eq!(config.select_server(candidates, Some("OTHER.test")), 1);
        assert_eq!(config.select_server(candidates, Some("unknown")), 0);
        assert_eq!(config.select_server(candidates, None), 0);
    }

    #[test]
    fn method_policy() {
        let mut loc = Location::default();
        assert!(loc.allows(Method::Get));
        assert!(loc.allows(Method::Post));
        assert!(!loc.allows(Method::Delete));

        loc.limit_except = vec![Method::Delete];
        assert!(!loc.allows(Method::Get));
        assert!(loc.allows(Method::Delete));
    }

    #[test]
    fn location_helpers() {
        let mut loc = Location {
            root: PathBuf::from("/srv"),
            ..Location::default()
        };
        loc.cgi_handlers.insert(".py".into(), PathBuf::from("/usr/bin/python3"));
        loc.error_pages.insert(404, "/errors/404.html".into());

        assert_eq!(loc.upload_dir(), PathBuf::from("/srv/uploads"));
        assert_eq!(loc.error_page(404), Some(PathBuf::from("/srv/errors/404.html")));
        assert_eq!(
            loc.cgi_interpreter(Path::new("/srv/cgi/a.py")),
            Some(Path::new("/usr/bin/python3"))
        );
        assert_eq!(loc.cgi_interpreter(Path::new("/srv/a.txt")), None);
        assert!(loc.body_too_large(DEFAULT_CLIENT_MAX_BODY_SIZE + 1));
        loc.client_max_body_size = 0;
        assert!(!loc.body_too_large(u64::MAX));
    }
}

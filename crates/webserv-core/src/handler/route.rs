use super::exchange::Exchange;
use super::{HandlerCtx, Progress};
use crate::http::{Method, Response, minimal_error_body};
use crate::listing;
use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Filesystem target that survived the shared routing steps.
pub(super) struct Target {
    pub path: PathBuf,
    /// `None` when nothing exists at `path`.
    pub meta: Option<Metadata>,
}

/// Join `request_path` onto `root` lexically. Returns `None` when `..`
/// segments would climb above `root`.
pub fn confine(root: &Path, request_path: &str) -> Option<PathBuf> {
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(request_path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    let mut path = root.to_path_buf();
    path.extend(parts);
    Some(path)
}

impl Exchange {
    /// Routing steps shared by every method, in order: method policy, body
    /// limit, configured redirect, path confinement, directory index (GET),
    /// CGI hand-off. `Err` carries the progress of a response that was
    /// already decided.
    pub(super) fn route(&mut self, ctx: &mut HandlerCtx<'_>) -> Result<Target, Progress> {
        let method = self.request.method;

        if !ctx.location.allows(method) {
            return Err(self.fail(405, ctx));
        }
        if ctx.location.body_too_large(self.request.body.len() as u64) {
            return Err(self.fail(413, ctx));
        }
        if let Some(redirect) = &ctx.location.redirect {
            let response = redirect_response(redirect.status, redirect.target.as_deref());
            return Err(self.finish(response));
        }

        let Some(mut path) = confine(&ctx.location.root, &self.request.path) else {
            warn!(path = %self.request.path, peer = %ctx.peer, "path escapes root");
            return Err(self.fail(403, ctx));
        };
        let mut meta = std::fs::metadata(&path).ok();

        if method == Method::Get && meta.as_ref().is_some_and(Metadata::is_dir) {
            let index = ctx.location.index.iter().find_map(|name| {
                let candidate = path.join(name);
                let m = std::fs::metadata(&candidate).ok()?;
                m.is_file().then_some((candidate, m))
            });
            match index {
                Some((candidate, m)) => {
                    path = candidate;
                    meta = Some(m);
                }
                None if ctx.location.autoindex => {
                    return Err(match listing::render(&path, &self.request.path) {
                        Ok(html) => self.finish(Response::with_body(200, "text/html", html)),
                        Err(e) => {
                            warn!(dir = %path.display(), "directory listing failed: {}", e);
                            self.fail(500, ctx)
                        }
                    });
                }
                None => return Err(self.fail(404, ctx)),
            }
        }

        if let Some(interpreter) = ctx.location.cgi_interpreter(&path) {
            let interpreter = interpreter.to_path_buf();
            if !meta.as_ref().is_some_and(Metadata::is_file) {
                return Err(self.fail(404, ctx));
            }
            let script = std::fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
            return Err(self.start_cgi(&script, &interpreter, ctx));
        }

        Ok(Target { path, meta })
    }
}

fn redirect_response(status: u16, target: Option<&str>) -> Response {
    match (status, target) {
        (300..=399, Some(location)) => Response::with_body(status, "text/html", minimal_error_body(status))
            .header("Location", location),
        (_, Some(text)) => Response::with_body(status, "text/plain", text.to_string()),
        (400.., None) => Response::error(status),
        (_, None) => Response::new(status),
    }
}

#[cfg(test)]
mod tests {
    use super::super::RequestHandler;
    use super::super::testing::{Harness, request};
    use super::*;

    #[test]
    fn confine_blocks_traversal() {
        let root = Path::new("/srv/www");
        assert_eq!(confine(root, "/a/b.txt"), Some(PathBuf::from("/srv/www/a/b.txt")));
        assert_eq!(confine(root, "/a/../b.txt"), Some(PathBuf::from("/srv/www/b.txt")));
        assert_eq!(confine(root, "/./a/./"), Some(PathBuf::from("/srv/www/a")));
        assert_eq!(confine(root, "/"), Some(PathBuf::from("/srv/www")));
        assert_eq!(confine(root, "/../etc/passwd"), None);
        assert_eq!(confine(root, "/a/../../etc"), None);
    }

    #[test]
    fn redirect_and_return_forms() {
        let res = redirect_response(301, Some("/new"));
        assert_eq!(res.status, 301);
        assert_eq!(res.get_header("location"), Some("/new"));

        let res = redirect_response(200, Some("hello"));
        assert_eq!(res.body, b"hello");

        assert_eq!(redirect_response(403, None).status, 403);
        assert!(redirect_response(204, None).body.is_empty());
    }

    #[test]
    fn method_policy_runs_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "x").unwrap();
        let mut harness = Harness::new(dir.path(), "");

        let mut handler = RequestHandler::for_request(request(Method::Delete, "/f.txt", &[], b""));
        assert_eq!(harness.run(&mut handler).status, 405);
        assert!(dir.path().join("f.txt").exists());
    }

    #[test]
    fn location_redirect() {
        let dir = tempfile::tempdir().unwrap();
        let mut harness = Harness::new(dir.path(), "location /old { return 301 /new; }");
        let mut handler = RequestHandler::for_request(request(Method::Get, "/old/page", &[], b""));
        let res = harness.run(&mut handler);
        assert_eq!(res.status, 301);
        assert_eq!(res.get_header("location"), Some("/new"));
    }

    #[test]
    fn traversal_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let mut harness = Harness::new(dir.path(), "");
        let mut handler = RequestHandler::for_request(request(Method::Get, "/../../etc/passwd", &[], b""));
        assert_eq!(harness.run(&mut handler).status, 403);
    }

    #[test]
    fn autoindex_lists_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("pub")).unwrap();
        std::fs::write(dir.path().join("pub/a.txt"), "x").unwrap();
        let mut harness = Harness::new(dir.path(), "location /pub { autoindex on; }");

        let mut handler = RequestHandler::for_request(request(Method::Get, "/pub/", &[], b""));
        let res = harness.run(&mut handler);
        assert_eq!(res.status, 200);
        assert!(String::from_utf8(res.body).unwrap().contains("a.txt"));

        let mut handler = RequestHandler::for_request(request(Method::Get, "/", &[], b""));
        assert_eq!(harness.run(&mut handler).status, 404);
    }

    #[test]
    fn body_limit_applies_before_anything_else() {
        let dir = tempfile::tempdir().unwrap();
        let mut harness = Harness::new(dir.path(), "client_max_body_size 4;");
        let mut handler = RequestHandler::for_request(request(Method::Post, "/up", &[], b"too long"));
        assert_eq!(harness.run(&mut handler).status, 413);
        assert!(!dir.path().join("uploads").exists());
    }
}

use super::exchange::{Exchange, status_for_io};
use super::{HandlerCtx, Progress};
use crate::http::{RequestData, Response};
use tracing::{debug, warn};

pub struct DeleteHandler {
    pub(super) exchange: Exchange,
}

impl DeleteHandler {
    pub fn new(request: RequestData) -> Self {
        Self {
            exchange: Exchange::new(request),
        }
    }

    /// Remove the routed file synchronously. Directories are never removed.
    pub fn generate_response(&mut self, ctx: &mut HandlerCtx<'_>) -> Progress {
        self.exchange.begin();
        let target = match self.exchange.route(ctx) {
            Ok(target) => target,
            Err(progress) => return progress,
        };
        match target.meta {
            None => self.exchange.fail(404, ctx),
            Some(meta) if meta.is_dir() => self.exchange.fail(403, ctx),
            Some(_) => match std::fs::remove_file(&target.path) {
                Ok(()) => {
                    debug!(path = %target.path.display(), "deleted");
                    let body = format!("Deleted {}\n", self.exchange.request.path);
                    self.exchange.finish(Response::with_body(200, "text/plain", body))
                }
                Err(e) => {
                    warn!(path = %target.path.display(), "delete failed: {}", e);
                    let status = status_for_io(&e);
                    self.exchange.fail(status, ctx)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::RequestHandler;
    use super::super::testing::{Harness, request};
    use crate::http::Method;

    const ALLOW_DELETE: &str = "location / { limit_except GET DELETE; }";

    #[test]
    fn deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gone.txt"), "x").unwrap();
        let mut harness = Harness::new(dir.path(), ALLOW_DELETE);

        let mut handler = RequestHandler::for_request(request(Method::Delete, "/gone.txt", &[], b""));
        assert_eq!(harness.run(&mut handler).status, 200);
        assert!(!dir.path().join("gone.txt").exists());

        let mut handler = RequestHandler::for_request(request(Method::Delete, "/gone.txt", &[], b""));
        assert_eq!(harness.run(&mut handler).status, 404);
    }

    #[test]
    fn refuses_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let mut harness = Harness::new(dir.path(), ALLOW_DELETE);

        let mut handler = RequestHandler::for_request(request(Method::Delete, "/sub", &[], b""));
        assert_eq!(harness.run(&mut handler).status, 403);
        assert!(dir.path().join("sub").is_dir());
    }
}

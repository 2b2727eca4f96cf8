use super::exchange::Exchange;
use super::{HandlerCtx, Progress};
use crate::http::RequestData;

pub struct GetHandler {
    pub(super) exchange: Exchange,
}

impl GetHandler {
    pub fn new(request: RequestData) -> Self {
        Self {
            exchange: Exchange::new(request),
        }
    }

    /// Serve the routed file. Directories were already resolved to an index
    /// file or a listing by the shared routing steps.
    pub fn generate_response(&mut self, ctx: &mut HandlerCtx<'_>) -> Progress {
        self.exchange.begin();
        let target = match self.exchange.route(ctx) {
            Ok(target) => target,
            Err(progress) => return progress,
        };
        match target.meta {
            Some(meta) if meta.is_file() => self.exchange.serve_file(&target.path, ctx),
            Some(_) => self.exchange.fail(403, ctx),
            None => self.exchange.fail(404, ctx),
        }
    }
}

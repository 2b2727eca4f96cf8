use super::exchange::Exchange;
use super::{HandlerCtx, Progress};
use crate::http::RequestData;

/// Answers a request that was rejected before routing: malformed input,
/// unsupported methods, or bodies refused while still arriving.
pub struct ErrorHandler {
    pub(super) exchange: Exchange,
    status: u16,
}

impl ErrorHandler {
    pub fn new(request: RequestData, status: u16) -> Self {
        Self {
            exchange: Exchange::new(request),
            status,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn generate_response(&mut self, ctx: &mut HandlerCtx<'_>) -> Progress {
        self.exchange.begin();
        self.exchange.fail(self.status, ctx)
    }
}

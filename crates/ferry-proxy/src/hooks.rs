use std::sync::Arc;

use bytes::Bytes;
use ferry_observe::FlowContext;

use crate::errors::ProxyError;
use crate::message::{HttpRequest, HttpResponse};
use crate::state::RequestState;

/// Consumes a diverted response body. `on_packet` sees every fragment in
/// order; `on_end` runs once the body is complete and may hand back a
/// replacement body, in which case the engine emits the (possibly mutated)
/// response head followed by those bytes. Returning `None` sends nothing.
pub trait ResponseBodyHandler: Send {
    fn on_packet(&mut self, data: &[u8]) -> Result<(), ProxyError>;

    fn on_end(&mut self, response: &mut HttpResponse) -> Result<Option<Bytes>, ProxyError>;
}

/// Extension surface of the pipeline. Implementations inspect and mutate
/// message heads, reroute the pipeline through the request state, or divert
/// the response body. Every method defaults to pass-through.
pub trait ProxyHooks: Send + Sync {
    fn on_receive_request(
        &self,
        _context: &FlowContext,
        _request: &mut HttpRequest,
        _state: &mut RequestState,
    ) -> Result<(), ProxyError> {
        Ok(())
    }

    fn on_receive_response(
        &self,
        _context: &FlowContext,
        _request: &HttpRequest,
        _response: &mut HttpResponse,
        _state: &mut RequestState,
    ) -> Result<(), ProxyError> {
        Ok(())
    }
}

/// Transparent pass-through.
#[derive(Debug, Default)]
pub struct NoopProxyHooks;

impl ProxyHooks for NoopProxyHooks {}

/// Decides per accepted connection whether (and with which hooks) a handler
/// runs. Returning `None` closes the connection immediately.
pub trait HandlerFactory: Send + Sync {
    fn on_new_client(&self, context: &FlowContext) -> Option<Arc<dyn ProxyHooks>>;
}

/// Factory that hands every connection the same hook object.
pub struct SharedHooksFactory {
    hooks: Arc<dyn ProxyHooks>,
}

impl SharedHooksFactory {
    pub fn new(hooks: Arc<dyn ProxyHooks>) -> Self {
        Self { hooks }
    }
}

impl HandlerFactory for SharedHooksFactory {
    fn on_new_client(&self, _context: &FlowContext) -> Option<Arc<dyn ProxyHooks>> {
        Some(Arc::clone(&self.hooks))
    }
}

use crate::hooks::ResponseBodyHandler;

/// Continuation points of the request pipeline. The engine snapshots and
/// clears the state's `next_step`, runs it, and stops once no step is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStep {
    ReadRequest,
    SendRequest,
    ReadResponse,
    SendResponse,
    Abort,
}

impl PipelineStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadRequest => "read_request",
            Self::SendRequest => "send_request",
            Self::ReadResponse => "read_response",
            Self::SendResponse => "send_response",
            Self::Abort => "abort_request",
        }
    }
}

/// Mutable state of one in-flight request. Hooks receive it to redirect the
/// pipeline, drop persistence, reject the request, or divert the response
/// body into a handler.
pub struct RequestState {
    /// Keep the client connection open for another request afterwards.
    pub persist_bp: bool,
    /// Keep the upstream connection open afterwards.
    pub persist_ps: bool,
    pub request_has_body: bool,
    pub request_chunked: bool,
    /// True until a `Proxy-Connection`/`Connection` directive pins
    /// `persist_bp`; the protocol-version default applies while set.
    pub use_default_persist_bp: bool,
    pub request_body_length: u64,
    pub(crate) error_response: Option<u16>,
    pub(crate) response_handler: Option<Box<dyn ResponseBodyHandler>>,
    pub(crate) next_step: Option<PipelineStep>,
}

impl RequestState {
    pub(crate) fn new() -> Self {
        Self {
            persist_bp: true,
            persist_ps: true,
            request_has_body: false,
            request_chunked: false,
            use_default_persist_bp: true,
            request_body_length: 0,
            error_response: None,
            response_handler: None,
            next_step: Some(PipelineStep::ReadRequest),
        }
    }

    pub fn next_step(&self) -> Option<PipelineStep> {
        self.next_step
    }

    /// Diverts the pipeline to `step` after the current one returns.
    pub fn set_next_step(&mut self, step: PipelineStep) {
        self.next_step = Some(step);
    }

    pub(crate) fn take_next_step(&mut self) -> Option<PipelineStep> {
        self.next_step.take()
    }

    /// Stops this request: the engine closes the upstream socket and drops
    /// client persistence.
    pub fn abort(&mut self) {
        self.next_step = Some(PipelineStep::Abort);
    }

    /// Aborts and answers the client with the canned error page for `code`
    /// first.
    pub fn reject(&mut self, code: u16) {
        self.error_response = Some(code);
        self.abort();
    }

    /// Diverts all response-body bytes into `handler` instead of forwarding
    /// them; the handler decides what (if anything) the client receives.
    pub fn install_response_handler(&mut self, handler: Box<dyn ResponseBodyHandler>) {
        self.response_handler = Some(handler);
    }

    pub fn has_response_handler(&self) -> bool {
        self.response_handler.is_some()
    }
}

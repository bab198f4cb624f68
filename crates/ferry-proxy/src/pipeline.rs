use std::sync::Arc;

use ferry_observe::{Event, EventSink, EventType, FlowContext};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use crate::config::RelayEndpoint;
use crate::destination::resolve_destination;
use crate::errors::ProxyError;
use crate::hooks::{ProxyHooks, ResponseBodyHandler};
use crate::message::{HttpRequest, HttpResponse};
use crate::socket::{FramedSocket, PacketSink};
use crate::state::{PipelineStep, RequestState};
use crate::tunnel;
use crate::upstream::UpstreamConnection;

/// How a pipeline iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// One exchange finished; `persist` says whether the client connection
    /// may carry another request.
    Completed { persist: bool },
    /// The client closed before sending a request line. Not a failure.
    Idle,
    /// The connection was consumed by a CONNECT tunnel.
    Tunneled,
}

enum StepFlow {
    Continue,
    Idle,
    Tunneled,
}

/// Unframed responses read opportunistically are capped at this many bytes
/// before the proxy frames them itself.
const SHORT_BODY_PROBE_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseFraming {
    NoBody,
    Chunked,
    Length(u64),
    /// No framing given but the server asked for keep-alive: probe a short
    /// body, frame it with a synthesized Content-Length, drop the upstream.
    OpportunisticShort,
    UntilClose,
}

#[derive(Default)]
struct Exchange {
    request: Option<HttpRequest>,
    response: Option<HttpResponse>,
}

/// Per-connection proxy pipeline.
///
/// Owns the client socket for the connection lifetime and the upstream
/// socket while a destination is held. `run` loops one `run_request`
/// iteration per exchange as long as the client side stays persistent.
pub struct ProxyHandler<D, H>
where
    D: AsyncRead + AsyncWrite + Unpin,
    H: ProxyHooks + ?Sized,
{
    bp: FramedSocket<D>,
    upstream: UpstreamConnection,
    relay: Option<RelayEndpoint>,
    hooks: Arc<H>,
    context: FlowContext,
    sink: Arc<dyn EventSink>,
    max_http_head_bytes: usize,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<D, H> ProxyHandler<D, H>
where
    D: AsyncRead + AsyncWrite + Unpin,
    H: ProxyHooks + ?Sized,
{
    pub fn new(
        bp: FramedSocket<D>,
        hooks: Arc<H>,
        context: FlowContext,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            bp,
            upstream: UpstreamConnection::new(),
            relay: None,
            hooks,
            context,
            sink,
            max_http_head_bytes: 64 * 1024,
            shutdown: None,
        }
    }

    pub fn with_relay(mut self, relay: Option<RelayEndpoint>) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_max_head_bytes(mut self, max_http_head_bytes: usize) -> Self {
        self.max_http_head_bytes = max_http_head_bytes;
        self
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn context(&self) -> &FlowContext {
        &self.context
    }

    /// Serves the connection until the client stops being persistent, goes
    /// idle, or is consumed by a tunnel.
    pub async fn run(&mut self) -> Result<PipelineOutcome, ProxyError> {
        loop {
            if self.shutdown.as_ref().is_some_and(|rx| *rx.borrow()) {
                return Ok(PipelineOutcome::Completed { persist: false });
            }
            if self.bp.is_dead() {
                return Ok(PipelineOutcome::Idle);
            }
            match self.run_request().await? {
                PipelineOutcome::Completed { persist: true } => continue,
                outcome => return Ok(outcome),
            }
        }
    }

    /// One pipeline iteration: repeatedly snapshot `next_step`, clear it,
    /// and run it, until no continuation is left. Any error aborts the
    /// request (upstream closed, client persistence dropped) and is handed
    /// back to the host.
    pub async fn run_request(&mut self) -> Result<PipelineOutcome, ProxyError> {
        let mut state = RequestState::new();
        let mut exchange = Exchange::default();
        while let Some(step) = state.take_next_step() {
            match self.run_step(step, &mut state, &mut exchange).await {
                Ok(StepFlow::Continue) => {}
                Ok(StepFlow::Idle) => return Ok(PipelineOutcome::Idle),
                Ok(StepFlow::Tunneled) => return Ok(PipelineOutcome::Tunneled),
                Err(error) => {
                    self.abort_request(&mut state).await;
                    return Err(error);
                }
            }
        }
        Ok(PipelineOutcome::Completed {
            persist: state.persist_bp,
        })
    }

    async fn run_step(
        &mut self,
        step: PipelineStep,
        state: &mut RequestState,
        exchange: &mut Exchange,
    ) -> Result<StepFlow, ProxyError> {
        match step {
            PipelineStep::ReadRequest => self.read_request(state, exchange).await,
            PipelineStep::SendRequest => {
                self.send_request(state, exchange).await?;
                Ok(StepFlow::Continue)
            }
            PipelineStep::ReadResponse => {
                self.read_response(state, exchange).await?;
                Ok(StepFlow::Continue)
            }
            PipelineStep::SendResponse => {
                self.send_response(state, exchange).await?;
                Ok(StepFlow::Continue)
            }
            PipelineStep::Abort => {
                if let Some(code) = state.error_response.take() {
                    let _ = self.bp.send_http_error(code).await;
                }
                self.abort_request(state).await;
                Ok(StepFlow::Continue)
            }
        }
    }

    async fn abort_request(&mut self, state: &mut RequestState) {
        self.upstream.close().await;
        state.persist_bp = false;
        state.next_step = None;
    }

    async fn read_request(
        &mut self,
        state: &mut RequestState,
        exchange: &mut Exchange,
    ) -> Result<StepFlow, ProxyError> {
        // Empty leading lines are discarded. A transport-level failure
        // before the request line arrives is an idle client, not an error.
        let request_line = loop {
            match self.bp.read_line().await {
                Ok(line) if line.is_empty() => continue,
                Ok(line) => break line,
                Err(error) if error.is_transport() => return Ok(StepFlow::Idle),
                Err(error) => return Err(error),
            }
        };
        let mut request = HttpRequest::read_after_request_line(
            &mut self.bp,
            &request_line,
            self.max_http_head_bytes,
        )
        .await?;

        state.set_next_step(PipelineStep::SendRequest);
        self.hooks
            .on_receive_request(&self.context, &mut request, state)?;

        // Honor a hook that rerouted or aborted before any upstream work.
        if state.next_step() != Some(PipelineStep::SendRequest) {
            exchange.request = Some(request);
            return Ok(StepFlow::Continue);
        }

        if request.line.is_connect() {
            self.handle_connect(&mut request, state).await?;
            exchange.request = Some(request);
            return Ok(StepFlow::Tunneled);
        }

        let destination = resolve_destination(&mut request, self.relay.is_some())?;
        self.context.server_host = destination.host.clone();
        self.context.server_port = destination.port;

        let (connect_host, connect_port) = match &self.relay {
            Some(relay) => (relay.host.clone(), relay.port),
            None => (destination.host.clone(), destination.port),
        };
        let reused = self.upstream.connect(&connect_host, connect_port).await?;
        let kind = if reused {
            EventType::UpstreamReused
        } else {
            EventType::UpstreamConnected
        };
        self.sink.emit(Event::new(kind, self.context.clone()));
        self.emit_request_event(&request);

        if request.headers.has_token("transfer-encoding", "chunked") {
            state.request_chunked = true;
            state.request_has_body = true;
        } else if let Some(length) = request.headers.content_length()? {
            if length > 0 {
                state.request_has_body = true;
                state.request_body_length = length;
            }
        }

        let proxy_tokens = request.headers.proxy_connection_tokens();
        if proxy_tokens.iter().any(|token| token == "close") {
            state.persist_bp = false;
            state.use_default_persist_bp = false;
        } else if proxy_tokens.iter().any(|token| token == "keep-alive") {
            state.persist_bp = true;
            state.use_default_persist_bp = false;
        }
        if request.headers.has_token("connection", "close") {
            state.persist_bp = false;
            state.use_default_persist_bp = false;
        }
        if state.use_default_persist_bp {
            state.persist_bp = request.line.version().persistent_by_default();
        }
        // The client's proxy directive is for us, not for the origin.
        if self.relay.is_none() {
            request.headers.set("Proxy-Connection", None);
        }

        exchange.request = Some(request);
        Ok(StepFlow::Continue)
    }

    async fn handle_connect(
        &mut self,
        request: &mut HttpRequest,
        state: &mut RequestState,
    ) -> Result<(), ProxyError> {
        let destination = resolve_destination(request, self.relay.is_some())?;
        self.context.server_host = destination.host.clone();
        self.context.server_port = destination.port;

        let (connect_host, connect_port) = match &self.relay {
            Some(relay) => (relay.host.clone(), relay.port),
            None => (destination.host.clone(), destination.port),
        };
        self.upstream.connect(&connect_host, connect_port).await?;

        if self.relay.is_some() {
            // The relay answers the CONNECT itself; its reply reaches the
            // client through the pump.
            let ps = self.upstream.socket()?;
            request.write_head(ps).await?;
        } else {
            let established = format!(
                "{} 200 Connection established\r\n\r\n",
                request.line.version()
            );
            self.bp.write_bytes(established.as_bytes()).await?;
            self.bp.flush().await?;
        }
        self.sink.emit(Event::new(
            EventType::ConnectTunnelEstablished,
            self.context.clone(),
        ));

        let ps = self.upstream.socket()?;
        tunnel::pump(&mut self.bp, ps).await?;

        self.upstream.close().await;
        state.persist_bp = false;
        state.next_step = None;
        Ok(())
    }

    async fn send_request(
        &mut self,
        state: &mut RequestState,
        exchange: &mut Exchange,
    ) -> Result<(), ProxyError> {
        let request = exchange.request.as_mut().ok_or_else(|| {
            ProxyError::runtime("send_request ran before a request was read")
        })?;
        let ps = self.upstream.socket()?;
        request.write_head(ps).await?;
        if state.request_chunked {
            self.bp.tunnel_chunked(ps).await?;
        } else if state.request_has_body {
            self.bp.tunnel_n(ps, state.request_body_length).await?;
        }
        ps.flush().await?;
        state.set_next_step(PipelineStep::ReadResponse);
        Ok(())
    }

    async fn read_response(
        &mut self,
        state: &mut RequestState,
        exchange: &mut Exchange,
    ) -> Result<(), ProxyError> {
        let max_head_bytes = self.max_http_head_bytes;
        let ps = self.upstream.socket()?;
        let mut response = HttpResponse::read_from(ps, max_head_bytes).await?;

        // The response-side Connection header governs upstream persistence;
        // without a directive the protocol version decides.
        let tokens = response.headers.connection_tokens();
        if tokens.iter().any(|token| token == "close") {
            state.persist_ps = false;
        } else if tokens.iter().any(|token| token == "keep-alive") {
            state.persist_ps = true;
        } else {
            state.persist_ps = response.line.version().persistent_by_default();
        }
        if state.persist_ps {
            ps.set_keep_alive(true);
        } else {
            state.persist_bp = false;
        }

        state.set_next_step(PipelineStep::SendResponse);
        self.emit_response_event(&response);
        let request = exchange.request.as_ref().ok_or_else(|| {
            ProxyError::runtime("read_response ran before a request was read")
        })?;
        self.hooks
            .on_receive_response(&self.context, request, &mut response, state)?;
        exchange.response = Some(response);
        Ok(())
    }

    async fn send_response(
        &mut self,
        state: &mut RequestState,
        exchange: &mut Exchange,
    ) -> Result<(), ProxyError> {
        let request = exchange.request.as_ref().ok_or_else(|| {
            ProxyError::runtime("send_response ran before a request was read")
        })?;
        let mut response = exchange.response.take().ok_or_else(|| {
            ProxyError::runtime("send_response ran before a response was read")
        })?;
        let framing = choose_response_framing(request, &response, state)?;

        if let Some(mut handler) = state.response_handler.take() {
            self.relay_response_to_handler(state, &mut response, framing, handler.as_mut())
                .await?;
        } else {
            self.relay_response_to_client(state, &mut response, framing)
                .await?;
        }

        if !state.persist_ps {
            self.upstream.close().await;
        }
        self.bp.flush().await?;
        Ok(())
    }

    async fn relay_response_to_client(
        &mut self,
        state: &mut RequestState,
        response: &mut HttpResponse,
        framing: ResponseFraming,
    ) -> Result<(), ProxyError> {
        match framing {
            ResponseFraming::NoBody => {
                response.write_head(&mut self.bp).await?;
            }
            ResponseFraming::Chunked => {
                response.write_head(&mut self.bp).await?;
                let ps = self.upstream.socket()?;
                ps.tunnel_chunked(&mut self.bp).await?;
            }
            ResponseFraming::Length(length) => {
                response.write_head(&mut self.bp).await?;
                let ps = self.upstream.socket()?;
                ps.tunnel_n(&mut self.bp, length).await?;
            }
            ResponseFraming::OpportunisticShort => {
                let ps = self.upstream.socket()?;
                let read = ps.read_binary().await?;
                let take = read.min(SHORT_BODY_PROBE_LEN);
                let body = ps.filled(take).to_vec();
                response
                    .headers
                    .set("Content-Length", Some(&take.to_string()));
                response.write_head(&mut self.bp).await?;
                self.bp.write_bytes(&body).await?;
                state.persist_ps = false;
            }
            ResponseFraming::UntilClose => {
                response.write_head(&mut self.bp).await?;
                let ps = self.upstream.socket()?;
                ps.tunnel_until_close(&mut self.bp).await?;
                // The close is the framing; neither side can be reused.
                state.persist_ps = false;
                state.persist_bp = false;
            }
        }
        Ok(())
    }

    async fn relay_response_to_handler(
        &mut self,
        state: &mut RequestState,
        response: &mut HttpResponse,
        framing: ResponseFraming,
        handler: &mut dyn ResponseBodyHandler,
    ) -> Result<(), ProxyError> {
        {
            let mut sink = HandlerSink(handler);
            match framing {
                ResponseFraming::NoBody => {}
                ResponseFraming::Chunked => {
                    let ps = self.upstream.socket()?;
                    ps.tunnel_chunked_to_sink(&mut sink).await?;
                }
                ResponseFraming::Length(length) => {
                    let ps = self.upstream.socket()?;
                    ps.tunnel_n_to_sink(&mut sink, length).await?;
                }
                ResponseFraming::OpportunisticShort => {
                    let ps = self.upstream.socket()?;
                    let read = ps.read_binary().await?;
                    let take = read.min(SHORT_BODY_PROBE_LEN);
                    sink.on_packet(ps.filled(take))?;
                    state.persist_ps = false;
                }
                ResponseFraming::UntilClose => {
                    let ps = self.upstream.socket()?;
                    ps.tunnel_until_close_to_sink(&mut sink).await?;
                    state.persist_ps = false;
                    state.persist_bp = false;
                }
            }
        }

        if let Some(body) = handler.on_end(response)? {
            response.write_head(&mut self.bp).await?;
            self.bp.write_bytes(&body).await?;
        }
        Ok(())
    }

    fn emit_request_event(&self, request: &HttpRequest) {
        self.sink.emit(
            Event::new(EventType::RequestHeaders, self.context.clone())
                .with_attribute("method", request.line.method())
                .with_attribute("target", request.line.uri())
                .with_attribute("header_count", request.headers.len().to_string()),
        );
    }

    fn emit_response_event(&self, response: &HttpResponse) {
        self.sink.emit(
            Event::new(EventType::ResponseHeaders, self.context.clone())
                .with_attribute("status_code", response.line.code().to_string())
                .with_attribute("header_count", response.headers.len().to_string()),
        );
    }
}

struct HandlerSink<'a>(&'a mut dyn ResponseBodyHandler);

impl PacketSink for HandlerSink<'_> {
    fn on_packet(&mut self, data: &[u8]) -> Result<(), ProxyError> {
        self.0.on_packet(data)
    }
}

fn choose_response_framing(
    request: &HttpRequest,
    response: &HttpResponse,
    state: &RequestState,
) -> Result<ResponseFraming, ProxyError> {
    if response.line.bodyless() || request.line.method() == "HEAD" {
        return Ok(ResponseFraming::NoBody);
    }
    let transfer_encoding = response.headers.transfer_encoding_tokens();
    if transfer_encoding.iter().any(|token| token == "chunked") {
        return Ok(ResponseFraming::Chunked);
    }
    if !transfer_encoding.is_empty() {
        // A transfer coding other than chunked leaves the length unknown;
        // RFC 7230 reads such a response to connection close.
        return Ok(ResponseFraming::UntilClose);
    }
    match response.headers.content_length()? {
        Some(0) => Ok(ResponseFraming::NoBody),
        Some(length) => Ok(ResponseFraming::Length(length)),
        None if state.persist_ps => Ok(ResponseFraming::OpportunisticShort),
        None => Ok(ResponseFraming::UntilClose),
    }
}

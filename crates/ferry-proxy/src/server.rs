use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ferry_observe::{Event, EventSink, EventType, FlowContext};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::ProxyConfig;
use crate::errors::ProxyError;
use crate::hooks::HandlerFactory;
use crate::pipeline::{PipelineOutcome, ProxyHandler};
use crate::registry::ConnectionRegistry;
use crate::socket::FramedSocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReasonCode {
    Completed,
    IdleClient,
    Tunneled,
    RejectedByFactory,
    Failed,
}

impl CloseReasonCode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::IdleClient => "idle_client",
            Self::Tunneled => "tunneled",
            Self::RejectedByFactory => "rejected_by_factory",
            Self::Failed => "failed",
        }
    }
}

/// Stops the sweeper with the accept loop, however the loop ends.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Accepts client connections and runs one pipeline task per connection.
/// Handler errors are reported through the event sink and tracing; they
/// never terminate the accept loop.
pub struct ProxyServer<F, S>
where
    F: HandlerFactory + 'static,
    S: EventSink + 'static,
{
    config: ProxyConfig,
    factory: Arc<F>,
    sink: Arc<S>,
    registry: Arc<ConnectionRegistry>,
    next_flow_id: AtomicU64,
}

impl<F, S> ProxyServer<F, S>
where
    F: HandlerFactory + 'static,
    S: EventSink + 'static,
{
    pub fn new(config: ProxyConfig, factory: F, sink: S) -> Result<Self, ProxyError> {
        config.validate()?;
        Ok(Self {
            config,
            factory: Arc::new(factory),
            sink: Arc::new(sink),
            registry: Arc::new(ConnectionRegistry::new()),
            next_flow_id: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    pub async fn bind_listener(&self) -> io::Result<TcpListener> {
        TcpListener::bind(self.config.bind_addr()).await
    }

    pub async fn run(self) -> io::Result<()> {
        let listener = self.bind_listener().await?;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        self.accept_loop(listener, shutdown_rx).await
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> io::Result<()> {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        self.accept_loop(listener, shutdown_rx).await
    }

    /// Runs until the shutdown channel flips to `true`. In-flight pipelines
    /// observe the same flag between requests and stop at the next step.
    pub async fn run_until_shutdown(
        self,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> io::Result<()> {
        if *shutdown_rx.borrow() {
            return Ok(());
        }
        let accept_rx = shutdown_rx.clone();
        tokio::select! {
            result = self.accept_loop(listener, accept_rx) => result,
            changed = shutdown_rx.changed() => {
                let _ = changed;
                Ok(())
            }
        }
    }

    async fn accept_loop(
        self,
        listener: TcpListener,
        shutdown_rx: watch::Receiver<bool>,
    ) -> io::Result<()> {
        let _sweeper = AbortOnDrop(self.spawn_sweeper());

        loop {
            let (stream, client_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::warn!(%error, "accept failed");
                    continue;
                }
            };
            let flow_id = self.next_flow_id.fetch_add(1, Ordering::Relaxed);
            let context = FlowContext {
                flow_id,
                client_addr: client_addr.to_string(),
                server_host: "<unknown>".to_string(),
                server_port: 0,
            };

            let Some(hooks) = self.factory.on_new_client(&context) else {
                drop(stream);
                self.emit_closed(context, CloseReasonCode::RejectedByFactory, None);
                continue;
            };

            let guard = self.registry.register(context.clone());
            let sink: Arc<dyn EventSink> = self.sink.clone();
            let event_sink = Arc::clone(&self.sink);
            let relay = self.config.relay.clone();
            let max_head_bytes = self.config.max_http_head_bytes;
            let shutdown = shutdown_rx.clone();

            tokio::spawn(async move {
                let _guard = guard;
                let mut handler =
                    ProxyHandler::new(FramedSocket::from_tcp(stream), hooks, context, sink)
                        .with_relay(relay)
                        .with_max_head_bytes(max_head_bytes)
                        .with_shutdown(shutdown);
                let (reason, detail) = match handler.run().await {
                    Ok(PipelineOutcome::Completed { .. }) => (CloseReasonCode::Completed, None),
                    Ok(PipelineOutcome::Idle) => (CloseReasonCode::IdleClient, None),
                    Ok(PipelineOutcome::Tunneled) => (CloseReasonCode::Tunneled, None),
                    Err(error) => {
                        tracing::warn!(%error, code = error.code(), "pipeline failed");
                        (CloseReasonCode::Failed, Some(error.to_string()))
                    }
                };
                let mut event =
                    Event::new(EventType::StreamClosed, handler.context().clone())
                        .with_attribute("reason_code", reason.as_str());
                if let Some(detail) = detail {
                    event = event.with_attribute("reason_detail", detail);
                }
                event_sink.emit(event);
            });
        }
    }

    fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let period = Duration::from_secs(self.config.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = registry.sweep();
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = registry.len(), "registry sweep");
                }
            }
        })
    }

    fn emit_closed(
        &self,
        context: FlowContext,
        reason: CloseReasonCode,
        detail: Option<String>,
    ) {
        let mut event = Event::new(EventType::StreamClosed, context)
            .with_attribute("reason_code", reason.as_str());
        if let Some(detail) = detail {
            event = event.with_attribute("reason_detail", detail);
        }
        self.sink.emit(event);
    }
}

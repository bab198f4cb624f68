//! A transparent forward proxy that logs request lines and response codes.
//!
//! Point a client at it with `http_proxy=http://127.0.0.1:3128 curl -v http://example.com/`.

use std::sync::Arc;

use ferry_observe::{Event, EventSink, EventType};
use ferry_proxy::{
    HttpRequest, HttpResponse, ListenFamily, ProxyConfig, ProxyError, ProxyHooks, ProxyServer,
    RequestState, SharedHooksFactory,
};

struct StdoutSink;

impl EventSink for StdoutSink {
    fn emit(&self, event: Event) {
        if event.kind == EventType::StreamClosed {
            println!(
                "[flow {}] closed ({})",
                event.context.flow_id,
                event
                    .attributes
                    .get("reason_code")
                    .map(String::as_str)
                    .unwrap_or("unknown")
            );
        }
    }
}

struct LoggingHooks;

impl ProxyHooks for LoggingHooks {
    fn on_receive_request(
        &self,
        context: &ferry_observe::FlowContext,
        request: &mut HttpRequest,
        _state: &mut RequestState,
    ) -> Result<(), ProxyError> {
        println!(
            "[flow {}] {} from {}",
            context.flow_id,
            request.line.text(),
            context.client_addr
        );
        Ok(())
    }

    fn on_receive_response(
        &self,
        context: &ferry_observe::FlowContext,
        _request: &HttpRequest,
        response: &mut HttpResponse,
        _state: &mut RequestState,
    ) -> Result<(), ProxyError> {
        println!(
            "[flow {}] {} from {}:{}",
            context.flow_id,
            response.line.text(),
            context.server_host,
            context.server_port
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = ProxyConfig {
        listen_family: ListenFamily::V4Loopback,
        listen_port: 3128,
        ..ProxyConfig::default()
    };
    println!("listening on {}", config.bind_addr());

    let server = ProxyServer::new(
        config,
        SharedHooksFactory::new(Arc::new(LoggingHooks)),
        StdoutSink,
    )
    .map_err(|error| std::io::Error::other(error.to_string()))?;
    server.run().await
}

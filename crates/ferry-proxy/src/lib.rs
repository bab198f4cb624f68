mod config;
mod destination;
mod errors;
mod hooks;
mod message;
mod pipeline;
mod registry;
mod server;
mod socket;
mod state;
mod tunnel;
mod upstream;

pub use config::{ListenFamily, ProxyConfig, RelayEndpoint};
pub use destination::{resolve_destination, Destination};
pub use errors::ProxyError;
pub use hooks::{
    HandlerFactory, NoopProxyHooks, ProxyHooks, ResponseBodyHandler, SharedHooksFactory,
};
pub use message::{HttpRequest, HttpResponse};
pub use pipeline::{PipelineOutcome, ProxyHandler};
pub use registry::{ConnectionGuard, ConnectionRegistry};
pub use server::ProxyServer;
pub use socket::{FramedSocket, PacketSink, RECV_BUFFER_LEN};
pub use state::{PipelineStep, RequestState};
pub use upstream::UpstreamConnection;

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use ferry_observe::VecEventSink;
use ferry_proxy::{
    HandlerFactory, NoopProxyHooks, ProxyConfig, ProxyServer, SharedHooksFactory,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub async fn start_proxy_with<F>(
    config: ProxyConfig,
    factory: F,
) -> (SocketAddr, JoinHandle<()>, VecEventSink)
where
    F: HandlerFactory + 'static,
{
    let sink = VecEventSink::default();
    let server = ProxyServer::new(config, factory, sink.clone()).expect("server config");
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind proxy listener");
    let addr = listener.local_addr().expect("proxy addr");
    let task = tokio::spawn(async move {
        let _ = server.run_with_listener(listener).await;
    });
    (addr, task, sink)
}

pub async fn start_passthrough_proxy() -> (SocketAddr, JoinHandle<()>, VecEventSink) {
    start_proxy_with(
        ProxyConfig::default(),
        SharedHooksFactory::new(Arc::new(NoopProxyHooks)),
    )
    .await
}

/// Reads one message head, byte by byte, until the blank line.
pub async fn read_head<S>(stream: &mut S) -> String
where
    S: AsyncRead + Unpin,
{
    let mut data = Vec::with_capacity(256);
    let mut byte = [0_u8; 1];
    while !data.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut byte).await.expect("read head byte");
        if read == 0 {
            break;
        }
        data.push(byte[0]);
    }
    String::from_utf8(data).expect("head was not UTF-8")
}

/// Drains a stream to EOF, tolerating a reset from an abrupt proxy close.
pub async fn read_to_end_lossy<S>(stream: &mut S) -> Vec<u8>
where
    S: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    let mut chunk = [0_u8; 4096];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(read) => out.extend_from_slice(&chunk[..read]),
        }
    }
    out
}

mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::{read_head, read_to_end_lossy, start_proxy_with};
use ferry_http::ContentCoding;
use ferry_observe::FlowContext;
use ferry_proxy::{
    HandlerFactory, HttpRequest, HttpResponse, ProxyConfig, ProxyError, ProxyHooks,
    RequestState, ResponseBodyHandler, SharedHooksFactory,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct RejectAll;

impl ProxyHooks for RejectAll {
    fn on_receive_request(
        &self,
        _context: &FlowContext,
        _request: &mut HttpRequest,
        state: &mut RequestState,
    ) -> Result<(), ProxyError> {
        state.reject(403);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejecting_hook_answers_with_the_canned_error_page() {
    let (proxy_addr, proxy_task, _sink) = start_proxy_with(
        ProxyConfig::default(),
        SharedHooksFactory::new(Arc::new(RejectAll)),
    )
    .await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    client
        .write_all(b"GET http://blocked.example/ HTTP/1.1\r\nHost: blocked.example\r\n\r\n")
        .await
        .expect("send request");

    let response = read_to_end_lossy(&mut client).await;
    let response = String::from_utf8(response).expect("utf8");
    let body = "<html>\n <body>\n  <h1>403 Forbidden</h1>\n </body>\n</html>";
    assert_eq!(
        response,
        format!(
            "HTTP/1.0 403 Forbidden\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
    );
    proxy_task.abort();
}

struct RedirectTo {
    port: u16,
}

impl ProxyHooks for RedirectTo {
    fn on_receive_request(
        &self,
        _context: &FlowContext,
        request: &mut HttpRequest,
        _state: &mut RequestState,
    ) -> Result<(), ProxyError> {
        request.change_uri(&format!("http://127.0.0.1:{}/alt", self.port))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn change_uri_redirects_the_request_and_updates_host() {
    let alt_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind alt");
    let alt_port = alt_listener.local_addr().expect("addr").port();
    let alt_task = tokio::spawn(async move {
        let (mut stream, _) = alt_listener.accept().await.expect("accept");
        let head = read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nConnection: close\r\n\r\nalt")
            .await
            .expect("write response");
        head
    });

    let (proxy_addr, proxy_task, _sink) = start_proxy_with(
        ProxyConfig::default(),
        SharedHooksFactory::new(Arc::new(RedirectTo { port: alt_port })),
    )
    .await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    client
        .write_all(b"GET http://original.example/old HTTP/1.1\r\nHost: original.example\r\n\r\n")
        .await
        .expect("send request");
    let response = read_to_end_lossy(&mut client).await;
    assert!(
        String::from_utf8(response).expect("utf8").ends_with("alt"),
        "client must see the redirected body"
    );

    let alt_head = alt_task.await.expect("alt upstream");
    assert!(alt_head.starts_with("GET /alt HTTP/1.1"), "{alt_head}");
    assert!(
        alt_head.contains(&format!("Host: 127.0.0.1:{alt_port}")),
        "{alt_head}"
    );
    proxy_task.abort();
}

#[derive(Default)]
struct UppercaseRewriter {
    collected: Vec<u8>,
}

impl ResponseBodyHandler for UppercaseRewriter {
    fn on_packet(&mut self, data: &[u8]) -> Result<(), ProxyError> {
        self.collected.extend_from_slice(data);
        Ok(())
    }

    fn on_end(&mut self, response: &mut HttpResponse) -> Result<Option<Bytes>, ProxyError> {
        let coding =
            ContentCoding::from_label(&response.headers.content_encoding().unwrap_or_default())?;
        let plain = coding.decode(&self.collected)?;
        let text = String::from_utf8(plain)
            .map_err(|_| ProxyError::runtime("response body was not UTF-8"))?;
        let encoded = coding.encode(text.to_uppercase().as_bytes())?;
        response
            .headers
            .set("Content-Length", Some(&encoded.len().to_string()));
        response.headers.set("Transfer-Encoding", None);
        Ok(Some(Bytes::from(encoded)))
    }
}

struct RewriteBodies;

impl ProxyHooks for RewriteBodies {
    fn on_receive_response(
        &self,
        _context: &FlowContext,
        _request: &HttpRequest,
        _response: &mut HttpResponse,
        state: &mut RequestState,
    ) -> Result<(), ProxyError> {
        state.install_response_handler(Box::new(UppercaseRewriter::default()));
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gzip_body_is_materialized_rewritten_and_recompressed() {
    let plain = "<html><body>hello rewrite</body></html>";
    let gzipped = ContentCoding::Gzip
        .encode(plain.as_bytes())
        .expect("gzip fixture");

    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_port = upstream_listener.local_addr().expect("addr").port();
    let gzipped_for_upstream = gzipped.clone();
    let upstream_task = tokio::spawn(async move {
        let (mut stream, _) = upstream_listener.accept().await.expect("accept");
        let _head = read_head(&mut stream).await;
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            gzipped_for_upstream.len()
        );
        stream.write_all(head.as_bytes()).await.expect("write head");
        stream
            .write_all(&gzipped_for_upstream)
            .await
            .expect("write body");
    });

    let (proxy_addr, proxy_task, _sink) = start_proxy_with(
        ProxyConfig::default(),
        SharedHooksFactory::new(Arc::new(RewriteBodies)),
    )
    .await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    let request = format!(
        "GET http://127.0.0.1:{upstream_port}/page HTTP/1.1\r\nHost: 127.0.0.1:{upstream_port}\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.expect("send request");

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"), "{head}");
    let content_length: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .expect("content length header")
        .trim()
        .parse()
        .expect("content length value");
    let mut body = vec![0_u8; content_length];
    client.read_exact(&mut body).await.expect("read body");

    let rewritten = ContentCoding::Gzip.decode(&body).expect("gunzip body");
    assert_eq!(
        String::from_utf8(rewritten).expect("utf8"),
        plain.to_uppercase()
    );

    upstream_task.await.expect("upstream task");
    proxy_task.abort();
}

struct SkipToSendResponse;

impl ProxyHooks for SkipToSendResponse {
    fn on_receive_request(
        &self,
        _context: &FlowContext,
        _request: &mut HttpRequest,
        state: &mut RequestState,
    ) -> Result<(), ProxyError> {
        // Diverting past read_response without a response is a misuse the
        // engine must surface instead of forwarding garbage.
        state.set_next_step(ferry_proxy::PipelineStep::SendResponse);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn diverting_to_send_response_without_a_response_aborts_the_request() {
    let (proxy_addr, proxy_task, sink) = start_proxy_with(
        ProxyConfig::default(),
        SharedHooksFactory::new(Arc::new(SkipToSendResponse)),
    )
    .await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    client
        .write_all(b"GET http://nowhere.example/ HTTP/1.1\r\nHost: nowhere.example\r\n\r\n")
        .await
        .expect("send request");
    let bytes = read_to_end_lossy(&mut client).await;
    assert!(bytes.is_empty(), "a misused pipeline must not answer");

    tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    let events = sink.snapshot();
    let closed = events
        .iter()
        .find(|event| event.kind == ferry_observe::EventType::StreamClosed)
        .expect("stream closed event");
    assert_eq!(
        closed.attributes.get("reason_code").map(String::as_str),
        Some("failed")
    );
    assert!(
        closed
            .attributes
            .get("reason_detail")
            .is_some_and(|detail| detail.contains("misuse")),
        "{closed:?}"
    );
    proxy_task.abort();
}

struct RefuseEveryone;

impl HandlerFactory for RefuseEveryone {
    fn on_new_client(&self, _context: &FlowContext) -> Option<Arc<dyn ProxyHooks>> {
        None
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn factory_returning_none_closes_the_connection_immediately() {
    let (proxy_addr, proxy_task, _sink) =
        start_proxy_with(ProxyConfig::default(), RefuseEveryone).await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    let bytes = read_to_end_lossy(&mut client).await;
    assert!(bytes.is_empty(), "refused connection must carry no bytes");
    proxy_task.abort();
}

struct AbortSilently;

impl ProxyHooks for AbortSilently {
    fn on_receive_request(
        &self,
        _context: &FlowContext,
        _request: &mut HttpRequest,
        state: &mut RequestState,
    ) -> Result<(), ProxyError> {
        state.abort();
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn aborting_hook_drops_the_connection_without_a_response() {
    let (proxy_addr, proxy_task, _sink) = start_proxy_with(
        ProxyConfig::default(),
        SharedHooksFactory::new(Arc::new(AbortSilently)),
    )
    .await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    client
        .write_all(b"GET http://nowhere.example/ HTTP/1.1\r\nHost: nowhere.example\r\n\r\n")
        .await
        .expect("send request");
    let bytes = read_to_end_lossy(&mut client).await;
    assert!(bytes.is_empty(), "aborted request must not be answered");
    proxy_task.abort();
}

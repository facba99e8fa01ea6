//! End-to-end tests driving a real listener with hyper's client connection API.
//!
//! Each test binds `127.0.0.1:0`, serves until its shutdown signal fires and
//! talks to the server over plain HTTP/1.1.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use trestle_core::{dispatch_fn, CleanupTask, DispatchError, ReleaseHook, ReleaseReason};
use trestle_server::{ServerBuilder, ShutdownSignal};

struct TestServer {
    addr: SocketAddr,
    shutdown: ShutdownSignal,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

async fn start(builder: ServerBuilder) -> TestServer {
    let listening = builder
        .http_addr("127.0.0.1:0")
        .shutdown_timeout(Duration::from_millis(200))
        .build()
        .unwrap()
        .bind()
        .await
        .unwrap();
    let addr = listening.local_addr();
    let shutdown = ShutdownSignal::new();
    tokio::spawn(listening.serve_with_shutdown(shutdown.clone()));
    TestServer { addr, shutdown }
}

async fn connect(addr: SocketAddr) -> SendRequest<Full<Bytes>> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (sender, conn) = http1::handshake(TokioIo::new(stream)).await.unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    sender
}

struct Reply {
    status: StatusCode,
    headers: http::HeaderMap,
    body: Result<Bytes, hyper::Error>,
}

async fn send(sender: &mut SendRequest<Full<Bytes>>, request: Request<Full<Bytes>>) -> Reply {
    sender.ready().await.unwrap();
    let response = sender.send_request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    Reply {
        status: parts.status,
        headers: parts.headers,
        body: body.collect().await.map(|collected| collected.to_bytes()),
    }
}

fn get(target: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .uri(target)
        .header("host", "api.example:8443")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn post(target: &str, body: &'static str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(Method::POST)
        .uri(target)
        .header("host", "api.example:8443")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap()
}

#[tokio::test]
async fn test_synchronous_response_with_reconstructed_uri() {
    let server = start(ServerBuilder::default().dispatcher(dispatch_fn(|request, _, response| {
        response.insert_header(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain"),
        )?;
        response.write(request.uri().to_string())?;
        Ok(())
    })))
    .await;

    let mut client = connect(server.addr).await;
    let reply = send(&mut client, get("/v1/items?x=1&y=%20")).await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers[http::header::CONTENT_TYPE], "text/plain");
    assert_eq!(reply.body.unwrap(), "http://api.example:8443/v1/items?x=1&y=%20");
}

#[tokio::test]
async fn test_missing_host_falls_back_to_local_address() {
    let server = start(ServerBuilder::default().dispatcher(dispatch_fn(|request, _, response| {
        response.write(request.uri().to_string())?;
        Ok(())
    })))
    .await;

    let mut client = connect(server.addr).await;
    let request = Request::builder().uri("/ping").body(Full::new(Bytes::new())).unwrap();
    let reply = send(&mut client, request).await;

    assert_eq!(
        reply.body.unwrap(),
        format!("http://127.0.0.1:{}/ping", server.addr.port())
    );
}

#[tokio::test]
async fn test_root_path_exposed_to_dispatcher() {
    let server = start(
        ServerBuilder::default()
            .root_path("v1/")
            .dispatcher(dispatch_fn(|request, _, response| {
                let relative = request.relative_path().unwrap_or("<outside>");
                response.write(format!("{}|{}", request.context_path(), relative))?;
                Ok(())
            })),
    )
    .await;

    let mut client = connect(server.addr).await;
    assert_eq!(send(&mut client, get("/v1/items")).await.body.unwrap(), "/v1|/items");
    assert_eq!(send(&mut client, get("/other")).await.body.unwrap(), "/v1|<outside>");
}

#[tokio::test]
async fn test_request_body_and_empty_marker() {
    let server = start(ServerBuilder::default().dispatcher(dispatch_fn(|_, body, response| {
        if body.is_empty_marker() {
            response.write("<empty>")?;
        } else {
            response.write(body.to_bytes().unwrap_or_default())?;
        }
        Ok(())
    })))
    .await;

    let mut client = connect(server.addr).await;
    assert_eq!(send(&mut client, post("/echo", "hello")).await.body.unwrap(), "hello");
    assert_eq!(send(&mut client, post("/echo", "")).await.body.unwrap(), "<empty>");
}

#[tokio::test]
async fn test_head_request_has_no_body() {
    let server = start(ServerBuilder::default().dispatcher(dispatch_fn(|_, _, response| {
        response.insert_header(http::header::CONTENT_LENGTH, http::HeaderValue::from_static("5"))?;
        response.write("hello")?;
        Ok(())
    })))
    .await;

    let mut client = connect(server.addr).await;
    let request = Request::builder()
        .method(Method::HEAD)
        .uri("/")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let reply = send(&mut client, request).await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers[http::header::CONTENT_LENGTH], "5");
    assert!(reply.body.unwrap().is_empty());
}

#[tokio::test]
async fn test_suspended_request_completes_from_another_thread() {
    let server = start(ServerBuilder::default().dispatcher(dispatch_fn(|_, body, response| {
        let resume = response.suspend();
        let payload = body.to_bytes().unwrap_or_default();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            resume.set_status(StatusCode::ACCEPTED).unwrap();
            resume.write(payload).unwrap();
            resume.complete().unwrap();
        });
        Ok(())
    })))
    .await;

    let mut client = connect(server.addr).await;
    let reply = send(&mut client, post("/jobs", "queued")).await;
    assert_eq!(reply.status, StatusCode::ACCEPTED);
    assert_eq!(reply.body.unwrap(), "queued");
}

#[tokio::test]
async fn test_declared_timeout_returns_503() {
    let server = start(ServerBuilder::default().dispatcher(dispatch_fn(|_, _, response| {
        let _ = response.suspend();
        response.set_timeout(Duration::from_millis(50));
        Ok(())
    })))
    .await;

    let mut client = connect(server.addr).await;
    let reply = send(&mut client, get("/slow")).await;
    assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(reply.body.unwrap().is_empty());
}

#[tokio::test]
async fn test_timeout_after_commit_aborts_body() {
    let server = start(ServerBuilder::default().dispatcher(dispatch_fn(|_, _, response| {
        response.write("partial")?;
        let _ = response.suspend();
        response.set_timeout(Duration::from_millis(50));
        Ok(())
    })))
    .await;

    let mut client = connect(server.addr).await;
    let reply = send(&mut client, get("/stream")).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(reply.body.is_err());
}

#[tokio::test]
async fn test_dispatch_error_runs_cleanup_then_500() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let first = Arc::clone(&order);
    let second = Arc::clone(&order);
    let server = start(
        ServerBuilder::default()
            .dispatcher(dispatch_fn(|_, _, _| Err(DispatchError::failed("boom"))))
            .cleanup_task(CleanupTask::new(move || {
                first.lock().push(1);
                Ok(())
            }))
            .cleanup_task(CleanupTask::new(move || {
                second.lock().push(2);
                Ok(())
            })),
    )
    .await;

    let mut client = connect(server.addr).await;
    let reply = send(&mut client, get("/fail")).await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(*order.lock(), vec![1, 2]);

    // The connection survives a handled failure.
    let reply = send(&mut client, get("/fail")).await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_panicking_dispatcher_returns_500() {
    let server = start(ServerBuilder::default().dispatcher(dispatch_fn(|_, _, _| panic!("bug"))))
        .await;

    let mut client = connect(server.addr).await;
    assert_eq!(send(&mut client, get("/")).await.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_release_hook_fires_once_per_request() {
    let released = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&released);
    let hook: ReleaseHook = Arc::new(move |reason: ReleaseReason, len: usize| log.lock().push((reason, len)));
    let server = start(
        ServerBuilder::default()
            .release_hook(hook)
            .dispatcher(dispatch_fn(|_, _, response| {
                response.write("ok")?;
                Ok(())
            })),
    )
    .await;

    let mut client = connect(server.addr).await;
    send(&mut client, post("/a", "abc")).await.body.unwrap();
    send(&mut client, post("/b", "")).await.body.unwrap();

    assert_eq!(
        *released.lock(),
        vec![(ReleaseReason::Completed, 3), (ReleaseReason::Completed, 0)]
    );
}

#[tokio::test]
async fn test_suspended_request_with_declared_length_completes_after_delivery() {
    let released = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&released);
    let hook: ReleaseHook = Arc::new(move |reason: ReleaseReason, len: usize| log.lock().push((reason, len)));
    let server = start(
        ServerBuilder::default()
            .release_hook(hook)
            .dispatcher(dispatch_fn(|_, _, response| {
                let resume = response.suspend();
                std::thread::spawn(move || {
                    resume
                        .insert_header(http::header::CONTENT_LENGTH, http::HeaderValue::from_static("5"))
                        .unwrap();
                    resume.write("hello").unwrap();
                    // Finish well after every declared byte is on the wire.
                    std::thread::sleep(Duration::from_millis(50));
                    resume.complete().unwrap();
                });
                Ok(())
            })),
    )
    .await;

    let mut client = connect(server.addr).await;
    let reply = send(&mut client, post("/jobs", "abc")).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body.unwrap(), "hello");

    for _ in 0..40 {
        if !released.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(*released.lock(), vec![(ReleaseReason::Completed, 3)]);

    // The connection is reusable afterwards.
    let reply = send(&mut client, post("/jobs", "de")).await;
    assert_eq!(reply.body.unwrap(), "hello");
}

#[tokio::test]
async fn test_offloaded_dispatch_serves_requests() {
    let server = start(
        ServerBuilder::default()
            .dispatch_mode(trestle_server::DispatchMode::Offload { max_concurrent: 2 })
            .dispatcher(dispatch_fn(|_, body, response| {
                std::thread::sleep(Duration::from_millis(10));
                response.write(body.to_bytes().unwrap_or_default())?;
                Ok(())
            })),
    )
    .await;

    let mut client = connect(server.addr).await;
    assert_eq!(send(&mut client, post("/", "offloaded")).await.body.unwrap(), "offloaded");
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let server = start(
        ServerBuilder::default()
            .idle_timeout(Some(Duration::from_millis(100)))
            .dispatcher(dispatch_fn(|_, _, _| Ok(()))),
    )
    .await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let mut buf = [0_u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("server should close the idle connection");
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_active_connection_is_kept_open() {
    let server = start(
        ServerBuilder::default()
            .idle_timeout(Some(Duration::from_millis(300)))
            .dispatcher(dispatch_fn(|_, _, response| {
                response.write("pong")?;
                Ok(())
            })),
    )
    .await;

    let mut client = connect(server.addr).await;
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(send(&mut client, get("/ping")).await.body.unwrap(), "pong");
    }
}

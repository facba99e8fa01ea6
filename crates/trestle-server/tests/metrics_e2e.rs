//! Request metrics recorded by a running server.
//!
//! Installs the global Prometheus recorder, so it lives in its own test
//! binary.

use std::time::Duration;

use bytes::Bytes;
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use trestle_core::dispatch_fn;
use trestle_server::{ServerBuilder, ShutdownSignal};
use trestle_telemetry::{init_metrics, render_metrics, MetricsConfig};

fn sample(rendered: &str, name: &str) -> Option<f64> {
    rendered
        .lines()
        .find_map(|line| line.strip_prefix(name)?.strip_prefix(' ')?.trim().parse().ok())
}

#[tokio::test]
async fn test_request_duration_covers_suspended_completion() {
    init_metrics(&MetricsConfig::default()).unwrap();

    let listening = ServerBuilder::default()
        .http_addr("127.0.0.1:0")
        .shutdown_timeout(Duration::from_millis(200))
        .dispatcher(dispatch_fn(|_, _, response| {
            response.flush()?;
            let resume = response.suspend();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(200));
                resume.write("late").unwrap();
                resume.complete().unwrap();
            });
            Ok(())
        }))
        .build()
        .unwrap()
        .bind()
        .await
        .unwrap();
    let addr = listening.local_addr();
    let shutdown = ShutdownSignal::new();
    tokio::spawn(listening.serve_with_shutdown(shutdown.clone()));

    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await.unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = Request::builder()
        .uri("/report")
        .header("host", "api.example")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, "late");

    let mut rendered = String::new();
    for _ in 0..40 {
        rendered = render_metrics().unwrap();
        if sample(&rendered, "trestle_request_duration_seconds_count").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert_eq!(sample(&rendered, "trestle_request_duration_seconds_count"), Some(1.0));
    let total = sample(&rendered, "trestle_request_duration_seconds_sum").unwrap();
    assert!(total >= 0.2, "duration {total}s stops before completion");
    assert!(rendered.contains("trestle_requests_total{status=\"200\"} 1"));

    shutdown.trigger();
}

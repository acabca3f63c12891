//! Tests for the probe HTTP server

use super::*;
use crate::clock::SystemClock;
use crate::config::ProbeConfig;
use crate::probe::{HostnameSource, Probe, ProbeResult};
use crate::registry::{MockLivenessStore, MockWorkRegistry};
use chrono::Utc;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const HOST: &str = "worker-host";

fn test_config(path: &str) -> ProbeConfig {
    ProbeConfig {
        host: "127.0.0.1".to_string(),
        path: path.to_string(),
        ..ProbeConfig::default()
    }
}

fn probe(liveness: MockLivenessStore, registry: MockWorkRegistry) -> Arc<Probe> {
    Arc::new(Probe::new(
        Arc::new(liveness),
        Arc::new(registry),
        Arc::new(SystemClock),
        HostnameSource::Fixed(Some(HOST.to_string())),
        Duration::from_secs(180),
    ))
}

/// Start a server on an ephemeral port and return its address
async fn spawn_server(
    server: Arc<ProbeServer>,
) -> (SocketAddr, JoinHandle<Result<(), std::io::Error>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move { server.serve(listener).await });
    (addr, handle)
}

async fn get(addr: SocketAddr, path: &str) -> (u16, String) {
    let response = reqwest::Client::new()
        .get(format!("http://{}{}", addr, path))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("Failed to connect to probe server");
    let status = response.status().as_u16();
    let body = response.text().await.expect("Failed to read body");
    (status, body)
}

#[tokio::test]
async fn test_alive_returns_200() {
    let server = Arc::new(ProbeServer::new(
        test_config("/"),
        probe(MockLivenessStore::new(true), MockWorkRegistry::new()),
    ));
    let (addr, handle) = spawn_server(server.clone()).await;

    let (status, body) = get(addr, "/").await;

    assert_eq!(status, 200);
    assert_eq!(body, "Alive!");

    server.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_other_path_is_404_in_every_state() {
    let server = Arc::new(ProbeServer::new(
        test_config("/healthz"),
        probe(MockLivenessStore::new(true), MockWorkRegistry::new()),
    ));
    let (addr, handle) = spawn_server(server.clone()).await;

    assert_eq!(get(addr, "/").await, (404, "Not found".to_string()));
    assert_eq!(get(addr, "/healthz/extra").await, (404, "Not found".to_string()));

    server.quiet();
    assert_eq!(get(addr, "/other").await, (404, "Not found".to_string()));
    assert_eq!(
        get(addr, "/healthz").await,
        (200, "Server is shutting down".to_string())
    );

    server.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_any_method_is_treated_the_same() {
    let server = Arc::new(ProbeServer::new(
        test_config("/"),
        probe(MockLivenessStore::new(true), MockWorkRegistry::new()),
    ));
    let (addr, handle) = spawn_server(server.clone()).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/", addr))
        .body("ignored")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "Alive!");

    server.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stuck_job_returns_503() {
    let registry = MockWorkRegistry::new()
        .with_process(HOST, "worker-1")
        .with_job("worker-1", "HardJob", Utc::now() - chrono::Duration::minutes(61));
    let server = Arc::new(ProbeServer::new(
        test_config("/"),
        probe(MockLivenessStore::new(true), registry),
    ));
    let (addr, handle) = spawn_server(server.clone()).await;

    assert_eq!(get(addr, "/").await, (503, "Service Unavailable".to_string()));

    server.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_missing_alive_key_returns_404() {
    let server = Arc::new(ProbeServer::new(
        test_config("/"),
        probe(MockLivenessStore::new(false), MockWorkRegistry::new()),
    ));
    let (addr, handle) = spawn_server(server.clone()).await;

    assert_eq!(
        get(addr, "/").await,
        (404, "Can't find the alive key".to_string())
    );

    server.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failures_return_500_and_server_keeps_serving() {
    let server = Arc::new(ProbeServer::new(
        test_config("/"),
        probe(MockLivenessStore::new(true), MockWorkRegistry::panicking()),
    ));
    let (addr, handle) = spawn_server(server.clone()).await;

    for _ in 0..3 {
        assert_eq!(
            get(addr, "/").await,
            (500, "Internal Server Error".to_string())
        );
    }
    assert_eq!(get(addr, "/nope").await, (404, "Not found".to_string()));

    server.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_handle_without_socket() {
    let server = ProbeServer::new(
        test_config("/alive"),
        probe(MockLivenessStore::new(true), MockWorkRegistry::new()),
    );

    assert_eq!(server.handle("/alive").await, ProbeResult::ALIVE);
    assert_eq!(server.handle("/").await, ProbeResult::NOT_FOUND);
}

#[tokio::test]
async fn test_start_binds_configured_port_and_stop_returns() {
    let config = ProbeConfig {
        port: 18433,
        ..test_config("/")
    };
    let server = Arc::new(ProbeServer::new(
        config,
        probe(MockLivenessStore::new(true), MockWorkRegistry::new()),
    ));
    let serving = server.clone();
    let handle = tokio::spawn(async move { serving.start().await });

    let addr: SocketAddr = "127.0.0.1:18433".parse().unwrap();
    let mut delay = Duration::from_millis(10);
    let mut ready = false;
    for _ in 0..10 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            ready = true;
            break;
        }
        tokio::time::sleep(delay).await;
        delay = std::cmp::min(delay * 2, Duration::from_millis(200));
    }
    assert!(ready, "Probe server never started listening");
    assert_eq!(get(addr, "/").await, (200, "Alive!".to_string()));

    server.stop();
    assert!(server.is_stopped());
    let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
    assert!(result.is_ok(), "start() should return after stop()");
}

#[tokio::test]
async fn test_bind_failure_is_returned() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = ProbeConfig {
        port: occupied.local_addr().unwrap().port(),
        ..test_config("/")
    };
    let server = ProbeServer::new(
        config,
        probe(MockLivenessStore::new(true), MockWorkRegistry::new()),
    );

    assert!(server.start().await.is_err());
}

#[tokio::test]
async fn test_stop_before_start_returns_promptly() {
    let server = Arc::new(ProbeServer::new(
        test_config("/"),
        probe(MockLivenessStore::new(true), MockWorkRegistry::new()),
    ));
    server.stop();

    let (_addr, handle) = spawn_server(server).await;
    let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
    assert!(result.is_ok());
}

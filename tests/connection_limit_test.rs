mod common;

use std::time::Duration;

use cacheproxy::{Outcome, MAX_CONNECTIONS, SERVICE_UNAVAILABLE_RESPONSE};
use common::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[test]
fn test_connection_limit_constant() {
    assert_eq!(MAX_CONNECTIONS, 1024);
}

#[tokio::test]
async fn test_connection_over_limit_gets_503() {
    let proxy = TestProxy::start(
        closed_port().await,
        ProxyOptions {
            max_connections: 1,
            ..ProxyOptions::default()
        },
    )
    .await;

    // Holds the only slot: a head that never completes.
    let mut holder = TcpStream::connect(proxy.addr).await.unwrap();
    holder.write_all(b"GET http://example.com/ HTTP/1.1\r\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut rejected = TcpStream::connect(proxy.addr).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), rejected.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, SERVICE_UNAVAILABLE_RESPONSE);

    let records = proxy.sink.wait_for(1).await;
    assert_eq!(records[0].outcome, Outcome::Rejected);
    assert_eq!(records[0].client, rejected.local_addr().unwrap());
    assert!(records[0].host.is_none());

    drop(holder);
    proxy.stop().await;
}

#[tokio::test]
async fn test_slot_is_released_after_connection_ends() {
    let origin = spawn_origin(
        vec![b"HTTP/1.1 204 No Content\r\n\r\n".to_vec()],
        Duration::ZERO,
    )
    .await;
    let proxy = TestProxy::start(
        origin.addr,
        ProxyOptions {
            max_connections: 1,
            ..ProxyOptions::default()
        },
    )
    .await;

    for i in 0..3 {
        let url = format!("http://example.com/{i}");
        let response = send(proxy.addr, &get_request(&url, "example.com")).await;
        assert_eq!(response, b"HTTP/1.1 204 No Content\r\n\r\n");
        // The permit is dropped once the worker task finishes.
        proxy.sink.wait_for(i + 1).await;
    }
    proxy.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_listener() {
    let proxy = TestProxy::start(closed_port().await, ProxyOptions::default()).await;
    let addr = proxy.addr;

    proxy.stop().await;

    assert!(TcpStream::connect(addr).await.is_err());
}

//! HTTP scrape endpoint for the metrics registry.

use std::net::SocketAddr;

use log::{error, info};
use prometheus::Registry;
use thiserror::Error;
use tokio::task::JoinHandle;
use warp::Filter;

use crate::metrics::registry::encode_text;
use crate::monitor::Shutdown;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Cannot bind metrics server to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: warp::Error,
    },
}

#[derive(Debug)]
struct EncodeFailed;

impl warp::reject::Reject for EncodeFailed {}

/// Serves `GET /metrics` in the Prometheus text format until shutdown.
pub struct MetricsServer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl MetricsServer {
    /// Binds immediately so a taken port fails at startup. Port 0 picks a
    /// free one; see [`MetricsServer::local_addr`].
    pub fn start(registry: Registry, addr: SocketAddr, mut shutdown: Shutdown) -> Result<Self, ServerError> {
        let metrics = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .and(warp::any().map(move || registry.clone()))
            .and_then(handle_metrics);
        let health = warp::path("health")
            .and(warp::get())
            .map(|| warp::reply::with_status("OK", warp::http::StatusCode::OK));

        let (addr, server) = warp::serve(metrics.or(health))
            .try_bind_with_graceful_shutdown(addr, async move { shutdown.triggered().await })
            .map_err(|source| ServerError::Bind { addr, source })?;

        info!("Serving metrics on http://{}/metrics", addr);
        let task = tokio::spawn(server);
        Ok(Self { addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Waits for the server to finish after shutdown.
    pub async fn stopped(self) -> Result<(), tokio::task::JoinError> {
        self.task.await
    }
}

async fn handle_metrics(registry: Registry) -> Result<impl warp::Reply, warp::Rejection> {
    match encode_text(&registry) {
        Ok(body) => Ok(warp::reply::with_header(body, "content-type", CONTENT_TYPE)),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            Err(warp::reject::custom(EncodeFailed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::registry::NetworkMetrics;
    use crate::monitor::shutdown_channel;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_scrape_returns_text_exposition() {
        let metrics = NetworkMetrics::new().unwrap();
        metrics.bytes_sent.inc_by(1234);
        metrics.latency.with_label_values(&["8.8.8.8"]).set(12.5);

        let (handle, shutdown) = shutdown_channel();
        let server = MetricsServer::start(metrics.registry(), ([127, 0, 0, 1], 0).into(), shutdown).unwrap();
        assert_ne!(server.local_addr().port(), 0);

        let response = get(server.local_addr(), "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(response.contains("text/plain; version=0.0.4"));
        assert!(response.contains("network_bytes_sent_total 1234"));
        assert!(response.contains("network_latency_ms{destination=\"8.8.8.8\"} 12.5"));

        // later updates are visible on the next scrape
        metrics.bytes_sent.inc_by(6);
        assert!(get(server.local_addr(), "/metrics").await.contains("network_bytes_sent_total 1240"));

        handle.trigger();
        server.stopped().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let metrics = NetworkMetrics::new().unwrap();
        let (handle, shutdown) = shutdown_channel();
        let server = MetricsServer::start(metrics.registry(), ([127, 0, 0, 1], 0).into(), shutdown).unwrap();

        let response = get(server.local_addr(), "/nope").await;
        assert!(response.starts_with("HTTP/1.1 404"), "{}", response);

        handle.trigger();
        server.stopped().await.unwrap();
    }

    #[tokio::test]
    async fn test_taken_port_fails_to_start() {
        let (_handle, shutdown) = shutdown_channel();
        let metrics = NetworkMetrics::new().unwrap();
        let first = MetricsServer::start(metrics.registry(), ([127, 0, 0, 1], 0).into(), shutdown.clone()).unwrap();

        let second = MetricsServer::start(metrics.registry(), first.local_addr(), shutdown);
        assert!(matches!(second, Err(ServerError::Bind { .. })));
    }
}

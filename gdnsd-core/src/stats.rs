// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! The read-only statistics endpoint (spec §6 "Stats endpoint": "an HTTP
//! read-only endpoint on the monitor thread, details outside the core
//! scope"). The endpoint's *existence and shape* is ambient (every daemon
//! needs basic observability, per SPEC_FULL's ambient-stack rationale);
//! its payload is modeled directly on `datadog-sidecar`'s
//! `SidecarStats` (`datadog-sidecar/src/service/sidecar_server.rs`):
//! a plain `Serialize` snapshot struct served as JSON.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use gdnsd_sttl::MonitorTable;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One monitor's current published state, as exposed over the stats
/// endpoint.
#[derive(Debug, Serialize)]
pub struct MonitorStat {
    pub index: u32,
    pub description: String,
    pub up: bool,
    pub ttl: u32,
}

/// The full process snapshot served at `GET /stats`.
#[derive(Debug, Serialize)]
pub struct DaemonStats {
    pub version: &'static str,
    pub pid: u32,
    pub num_udp_threads: usize,
    pub num_tcp_threads: usize,
    pub num_zones: usize,
    pub monitors: Vec<MonitorStat>,
}

/// Anything that can produce a fresh [`DaemonStats`] snapshot on demand;
/// the concrete closure the daemon wires up captures the monitor table,
/// thread counts, and zone handle.
pub trait StatsSource: Send + Sync {
    fn snapshot(&self) -> DaemonStats;
}

impl<F: Fn() -> DaemonStats + Send + Sync> StatsSource for F {
    fn snapshot(&self) -> DaemonStats {
        self()
    }
}

/// Builds a [`StatsSource`] closure from a monitor table plus the static
/// thread-count/zone-count facts the daemon already knows at startup.
pub fn source_from_monitors(
    monitors: Arc<MonitorTable>,
    num_udp_threads: usize,
    num_tcp_threads: usize,
    num_zones: impl Fn() -> usize + Send + Sync + 'static,
) -> impl StatsSource {
    move || {
        let snapshot = monitors.snapshot();
        let monitors_out = (0..snapshot.len())
            .map(|i| {
                let idx = gdnsd_sttl::MonitorIndex::from_raw(i as u32);
                let sttl = snapshot.get(idx);
                MonitorStat {
                    index: i as u32,
                    description: monitors.description(idx),
                    up: !sttl.is_down(),
                    ttl: sttl.ttl(),
                }
            })
            .collect();
        DaemonStats {
            version: env!("CARGO_PKG_VERSION"),
            pid: std::process::id(),
            num_udp_threads,
            num_tcp_threads,
            num_zones: num_zones(),
            monitors: monitors_out,
        }
    }
}

async fn handle(req: Request<Body>, source: Arc<dyn StatsSource>) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::GET || req.uri().path() != "/stats" {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("not found"))
            .expect("static response is well-formed"));
    }
    let stats = source.snapshot();
    let body = serde_json::to_vec(&stats).unwrap_or_else(|_| b"{}".to_vec());
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .expect("static response is well-formed"))
}

/// Serves the stats endpoint until `cancel` fires, on whatever runtime
/// polls this future (the monitor thread's, per spec §5's "owns... the
/// stats HTTP listener").
pub async fn run(addr: SocketAddr, source: Arc<dyn StatsSource>, cancel: CancellationToken) {
    let make_svc = make_service_fn(move |_conn| {
        let source = source.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(req, source.clone()))) }
    });

    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(e) => {
            warn!(error = %e, %addr, "stats endpoint failed to bind, continuing without it");
            return;
        }
    };

    info!(%addr, "stats endpoint listening");
    tokio::select! {
        _ = cancel.cancelled() => {}
        res = server => {
            if let Err(e) = res {
                warn!(error = %e, "stats endpoint server error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gdnsd_sttl::MonitorTable;

    #[tokio::test]
    async fn serves_json_stats() {
        let monitors = Arc::new(MonitorTable::new());
        monitors.register_admin("m0");
        let source: Arc<dyn StatsSource> =
            Arc::new(source_from_monitors(monitors.clone(), 2, 1, || 3));

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = std::net::TcpListener::bind(addr).unwrap();
        let bound_addr = listener.local_addr().unwrap();
        drop(listener);

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let jh = tokio::spawn(run(bound_addr, source, task_cancel));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let resp = reqwest_like_get(bound_addr).await;
        assert!(resp.contains("\"num_zones\":3"));
        assert!(resp.contains("\"num_udp_threads\":2"));

        cancel.cancel();
        jh.await.unwrap();
    }

    // a tiny hand-rolled HTTP/1.1 GET so this crate doesn't need an extra
    // http-client dependency just for one test.
    async fn reqwest_like_get(addr: SocketAddr) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /stats HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }
}

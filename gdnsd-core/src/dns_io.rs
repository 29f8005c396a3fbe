// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! DNS I/O threads (spec §5): one per configured UDP or TCP listener,
//! each its own single-threaded reactor. Packet parsing/serialization (the
//! DNS wire codec) is an excluded external collaborator (spec §1), so
//! `QueryHandler` is the seam this module calls through instead of a real
//! decoder: it receives raw query bytes and the peer address and returns
//! raw answer bytes, which is exactly the shape a real wire codec built on
//! top of the meta/geo engine (C3) would fill in.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The seam between "a thread that owns a socket" and "something that
/// turns bytes into bytes". Implementations of this are squarely the
/// excluded DNS wire codec + zone lookup + C3 invocation; this crate ships
/// only the raw structural plumbing plus a harmless default.
pub trait QueryHandler: Send + Sync {
    fn handle(&self, query: &[u8], from: SocketAddr, thread_num: usize) -> Option<Vec<u8>>;
}

/// A handler that never answers; used when no real wire codec is wired
/// in (e.g. `checkconf`, or plain structural tests of the I/O threads
/// themselves).
#[derive(Default)]
pub struct NullHandler;

impl QueryHandler for NullHandler {
    fn handle(&self, _query: &[u8], _from: SocketAddr, _thread_num: usize) -> Option<Vec<u8>> {
        None
    }
}

const MAX_UDP_PACKET: usize = 65535;

/// Runs one UDP listener's loop forever: receive a datagram, hand it to
/// the handler, send back whatever (if anything) it returns.
pub async fn run_udp(
    sock: UdpSocket,
    handler: Arc<dyn QueryHandler>,
    thread_num: usize,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_UDP_PACKET];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            res = sock.recv_from(&mut buf) => {
                match res {
                    Ok((len, from)) => {
                        if let Some(answer) = handler.handle(&buf[..len], from, thread_num) {
                            if let Err(e) = sock.send_to(&answer, from).await {
                                warn!(error = %e, %from, "udp send failed");
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "udp recv failed"),
                }
            }
        }
    }
}

/// Runs one TCP listener's accept loop; each connection is handled on its
/// own spawned task using standard two-byte-length-prefixed DNS-over-TCP
/// framing, reaped when the peer closes or the handler declines to answer.
pub async fn run_tcp(
    listener: TcpListener,
    handler: Arc<dyn QueryHandler>,
    thread_num: usize,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            res = listener.accept() => {
                match res {
                    Ok((stream, from)) => {
                        let handler = handler.clone();
                        let conn_cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_tcp_conn(stream, from, handler, thread_num, conn_cancel).await {
                                debug!(error = %e, %from, "tcp connection ended");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "tcp accept failed"),
                }
            }
        }
    }
}

async fn serve_tcp_conn(
    mut stream: TcpStream,
    from: SocketAddr,
    handler: Arc<dyn QueryHandler>,
    thread_num: usize,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = stream.read_exact(&mut len_buf) => {
                if res.is_err() {
                    return Ok(());
                }
            }
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut query = vec![0u8; len];
        stream.read_exact(&mut query).await?;

        if let Some(answer) = handler.handle(&query, from, thread_num) {
            let len_prefix = (answer.len() as u16).to_be_bytes();
            stream.write_all(&len_prefix).await?;
            stream.write_all(&answer).await?;
        } else {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct EchoHandler;
    impl QueryHandler for EchoHandler {
        fn handle(&self, query: &[u8], _from: SocketAddr, _thread_num: usize) -> Option<Vec<u8>> {
            Some(query.to_vec())
        }
    }

    #[tokio::test]
    async fn udp_echoes_and_stops_on_cancel() {
        let sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = sock.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handler: Arc<dyn QueryHandler> = Arc::new(EchoHandler);
        let task_cancel = cancel.clone();
        let jh = tokio::spawn(run_udp(sock, handler, 0, task_cancel));

        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        client.send_to(b"hello", addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        cancel.cancel();
        jh.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_length_prefixed_roundtrip() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handler: Arc<dyn QueryHandler> = Arc::new(EchoHandler);
        let task_cancel = cancel.clone();
        let jh = tokio::spawn(run_tcp(listener, handler, 0, task_cancel));

        let mut conn = TcpStream::connect(addr).await.unwrap();
        let payload = b"query-bytes";
        conn.write_all(&(payload.len() as u16).to_be_bytes()).await.unwrap();
        conn.write_all(payload).await.unwrap();

        let mut len_buf = [0u8; 2];
        conn.read_exact(&mut len_buf).await.unwrap();
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut resp = vec![0u8; len];
        conn.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, payload);

        cancel.cancel();
        jh.await.unwrap();
    }
}

//! HTTP server for the metrics and health endpoints.

use log::{error, info};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpSocket;

use super::{update_metrics, REGISTRY};
use crate::pool::get_pool;

async fn respond(stream: &mut tokio::net::TcpStream, status: &str, content_type: &str, body: &[u8]) {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    if let Err(err) = stream.write_all(header.as_bytes()).await {
        error!("failed to write HTTP response header: {err}");
        return;
    }
    if let Err(err) = stream.write_all(body).await {
        error!("failed to write HTTP response body: {err}");
        return;
    }
    let _ = stream.flush().await;
}

async fn handle_request(mut stream: tokio::net::TcpStream) {
    let mut buffer = [0u8; 1024];
    let n = match stream.read(&mut buffer).await {
        Ok(n) => n,
        Err(err) => {
            error!("failed to read HTTP request: {err}");
            return;
        }
    };
    let request = String::from_utf8_lossy(&buffer[..n]);
    let path = request
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();

    match path.as_str() {
        "/metrics" => {
            update_metrics();
            let encoder = TextEncoder::new();
            let mut body = Vec::new();
            if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut body) {
                error!("failed to encode metrics: {err}");
                return;
            }
            respond(&mut stream, "200 OK", encoder.format_type(), &body).await;
        }
        "/health" => {
            // Healthy means the backend answers a ping within two seconds.
            let healthy = matches!(
                tokio::time::timeout(Duration::from_secs(2), get_pool().ping()).await,
                Ok(Ok(()))
            );
            if healthy {
                respond(&mut stream, "200 OK", "text/plain", b"ok\n").await;
            } else {
                respond(
                    &mut stream,
                    "503 Service Unavailable",
                    "text/plain",
                    b"backend unreachable\n",
                )
                .await;
            }
        }
        _ => {
            respond(&mut stream, "404 Not Found", "text/plain", b"not found\n").await;
        }
    }
}

/// Starts the metrics/health exporter.
pub async fn start_metrics_server(host: &str, port: u16) {
    let addr: SocketAddr = match format!("{host}:{port}").parse() {
        Ok(addr) => addr,
        Err(err) => {
            panic!("failed to parse metrics address {host}:{port}: {err}");
        }
    };
    let listen_socket = if addr.is_ipv4() {
        TcpSocket::new_v4().expect("failed to create metrics socket")
    } else {
        TcpSocket::new_v6().expect("failed to create metrics socket")
    };
    listen_socket
        .set_reuseaddr(true)
        .expect("failed to set SO_REUSEADDR on metrics socket");
    listen_socket
        .bind(addr)
        .expect("failed to bind metrics socket");

    match listen_socket.listen(128) {
        Ok(listener) => {
            info!("metrics exporter listening on {addr}");
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(async move {
                            handle_request(stream).await;
                        });
                    }
                    Err(err) => {
                        error!("metrics accept failed: {err}");
                    }
                }
            }
        }
        Err(err) => {
            panic!("failed to listen on metrics address {addr}: {err}");
        }
    }
}

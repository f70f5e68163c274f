//! A deliberately thin HTTP surface: `/metrics` in Prometheus text
//! exposition format, and `/healthz` for a liveness probe. spec.md treats
//! scraping and alerting as an external collaborator's job; this module
//! only needs to exist long enough to hand a scraper the registry's
//! current state and the pipeline's liveness verdict.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, warn};
use prometheus::{Encoder, TextEncoder};

use crate::health_state::HealthState;
use crate::metrics::REGISTRY;

/// The thresholds `/healthz` checks `HealthState` against, per spec.md
/// §7: unhealthy once the tailer has been unable to read, or a partition
/// has been backing off, for longer than these.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub tailer_stall: Duration,
    pub backoff_stall: Duration,
}

/// Serve `/metrics` and `/healthz` on `addr` until the process exits.
/// Runs on its own thread; a single slow or wedged scraper blocks only
/// itself; each connection is handled serially per accept, which is
/// plenty for a scrape interval measured in seconds.
pub fn serve(addr: &str, health: Arc<HealthState>, thresholds: HealthThresholds) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr)?;
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let health = Arc::clone(&health);
                thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &health, thresholds) {
                        warn!("metrics connection error: {err}");
                    }
                });
            }
            Err(err) => error!("failed to accept metrics connection: {err}"),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    health: &HealthState,
    thresholds: HealthThresholds,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();

    // Drain the rest of the request headers without interpreting them;
    // nothing here reads a body.
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 || line == "\r\n" {
            break;
        }
    }

    match path.as_str() {
        "/metrics" => write_metrics(&mut stream),
        "/healthz" => {
            if health.is_healthy(thresholds.tailer_stall, thresholds.backoff_stall) {
                write_response(&mut stream, "200 OK", "text/plain", b"ok\n")
            } else {
                write_response(
                    &mut stream,
                    "503 Service Unavailable",
                    "text/plain",
                    b"unhealthy\n",
                )
            }
        }
        _ => write_response(&mut stream, "404 Not Found", "text/plain", b"not found\n"),
    }
}

fn write_metrics(stream: &mut TcpStream) -> std::io::Result<()> {
    let metric_families = REGISTRY.gather();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buf) {
        error!("failed to encode metrics: {err}");
        return write_response(stream, "500 Internal Server Error", "text/plain", b"encoding error\n");
    }
    write_response(stream, "200 OK", encoder.format_type(), &buf)
}

fn write_response(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()> {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)
}

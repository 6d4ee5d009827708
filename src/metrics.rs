// This file is part of qnet-arbiter.

//! Prometheus metrics exporter (ambient, §D), grounded directly on
//! `examples/cloudflare-cfnts/src/metrics.rs`: `lazy_static!` counters registered against the
//! default registry, scraped by a bare `std::net::TcpListener` on its own thread.

use lazy_static::lazy_static;
use prometheus::{opts, register_counter, register_int_counter, Encoder, IntCounter, TextEncoder};
use slog::{error, Logger};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;

lazy_static! {
    pub static ref CONNECTIONS_ACCEPTED: IntCounter =
        register_int_counter!("qnet_arbiter_connections_accepted_total", "Connections accepted").unwrap();
    pub static ref CONNECTIONS_REJECTED: IntCounter =
        register_int_counter!("qnet_arbiter_connections_rejected_total", "Connections rejected by the admission cap").unwrap();
    pub static ref MESSAGES_RECEIVED: IntCounter =
        register_int_counter!("qnet_arbiter_messages_received_total", "Frames received").unwrap();
    pub static ref MESSAGES_SKIPPED: IntCounter =
        register_int_counter!("qnet_arbiter_messages_skipped_total", "Frames skipped (oversize or unsupported type)").unwrap();
    pub static ref VOTES_ACK: IntCounter = register_int_counter!("qnet_arbiter_votes_ack_total", "Votes granted").unwrap();
    pub static ref VOTES_NACK: IntCounter = register_int_counter!("qnet_arbiter_votes_nack_total", "Votes denied").unwrap();
    pub static ref DPD_TIMEOUTS: IntCounter =
        register_int_counter!("qnet_arbiter_dpd_timeouts_total", "Dead-peer-detection timeouts").unwrap();
}

fn serve_one(mut stream: std::net::TcpStream) -> std::io::Result<()> {
    let mut discard = [0u8; 1024];
    let _ = stream.read(&mut discard);

    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        encoder.format_type(),
        buffer.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(&buffer)?;
    Ok(())
}

/// Spawn the scrape endpoint on its own thread; the readiness loop never touches it.
pub fn spawn(addr: &str, port: u16, logger: Logger) -> std::io::Result<()> {
    let listener = TcpListener::bind((addr, port))?;
    thread::Builder::new()
        .name("metrics".to_string())
        .spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        if let Err(err) = serve_one(stream) {
                            error!(logger, "metrics scrape failed"; "error" => %err);
                        }
                    }
                    Err(err) => error!(logger, "metrics accept failed"; "error" => %err),
                }
            }
        })?;
    Ok(())
}

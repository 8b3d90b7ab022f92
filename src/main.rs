//! Line-based echo server.
//!
//! Echoes every received line back to the sender, closes a connection when
//! the client sends a lone `q`, and drops connections idle for a minute.

use std::env;
use std::process;
use std::sync::Arc;

use reactor::{error, info, TcpServer};

const DEFAULT_PORT: u16 = 8080;
const WORKER_LOOPS: usize = 4;
const IDLE_TIMEOUT_TICKS: u64 = 60;

fn main() {
    let port = env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let server = TcpServer::new(port).unwrap_or_else(|err| {
        error!("failed to bind port {port}: {err}");
        process::exit(1);
    });

    server.set_connected_callback(Arc::new(|conn| {
        info!("connection {} established (fd {})", conn.id(), conn.fd());
    }));
    server.set_close_callback(Arc::new(|conn| {
        info!("connection {} closed", conn.id());
    }));
    server.set_message_callback(Arc::new(|conn, input| {
        loop {
            let line = input.read_line(true);
            if line.is_empty() {
                break;
            }
            if line.trim_end() == "q" {
                conn.shutdown();
                break;
            }
            conn.send(line.as_bytes());
        }
    }));

    server.enable_inactive_release(IDLE_TIMEOUT_TICKS);
    server.start(WORKER_LOOPS)
}

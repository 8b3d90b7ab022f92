//! Interactive client for the echo server.
//!
//! Reads lines from stdin, sends each to the server, and prints the echoed
//! reply. A lone `q` asks the server to close the connection and exits.

use std::env;
use std::io::{self, BufRead, Write};
use std::net::Ipv4Addr;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use reactor::net::Socket;
use reactor::{error, info, warn};

const DEFAULT_PORT: u16 = 8080;
const REPLY_DEADLINE: Duration = Duration::from_secs(5);

fn main() {
    let port = env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let socket = Socket::create_client(Ipv4Addr::LOCALHOST, port).unwrap_or_else(|err| {
        error!("failed to connect to 127.0.0.1:{port}: {err}");
        process::exit(1);
    });
    info!("connected to 127.0.0.1:{port}; enter lines to echo, `q` to quit");

    let stdin = io::stdin();
    let mut line = String::new();

    loop {
        print!("> ");
        let _ = io::stdout().flush();

        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                error!("failed to read stdin: {err}");
                process::exit(1);
            }
        }
        if !line.ends_with('\n') {
            line.push('\n');
        }

        if let Err(err) = socket.send(line.as_bytes()) {
            error!("failed to send: {err}");
            process::exit(1);
        }
        if line.trim_end() == "q" {
            break;
        }

        match await_reply(&socket) {
            Ok(reply) => print!("{reply}"),
            Err(err) => {
                error!("failed to receive: {err}");
                process::exit(1);
            }
        }
    }
}

/// Polls the non-blocking socket until the echo arrives or the deadline
/// passes. An empty reply past the deadline usually means the server closed
/// the connection.
fn await_reply(socket: &Socket) -> reactor::Result<String> {
    let start = Instant::now();
    let mut buf = [0u8; 1024];

    loop {
        let n = socket.recv(&mut buf)?;
        if n > 0 {
            return Ok(String::from_utf8_lossy(&buf[..n]).into_owned());
        }
        if start.elapsed() > REPLY_DEADLINE {
            warn!("no reply within {REPLY_DEADLINE:?}; the server may have closed");
            process::exit(1);
        }
        thread::sleep(Duration::from_millis(10));
    }
}

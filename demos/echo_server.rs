//! Echo Server Example - raw byte echo
//!
//! The smallest useful reactor: every receive is written straight back to the
//! client that sent it. A client in the same process sends one byte sequence,
//! waits for the echo, and then stops the server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example echo_server
//! ```

use rustmux::prelude::*;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::str::from_utf8;
use std::thread;

/// Echoes back every byte sequence it receives
struct Echo;

impl Handler for Echo {
    fn on_message_received(&mut self, ctx: &mut Context<'_>, id: ConnectionId, data: &[u8]) {
        if let Err(err) = ctx.send_to(id, data) {
            eprintln!("Echo to {id} failed: {err}");
        }
    }
}

fn main() -> Result<(), Error> {
    // Start the server in a thread
    let mut reactor = Reactor::new(ListenerConfig::new("127.0.0.1", 0), Echo)?;
    let server_addr = reactor.init()?;
    let stop = reactor.stop_handle();
    let server = thread::spawn(move || reactor.run());
    println!("Server started on {server_addr}\n");

    // Run the client in this thread
    let mut stream = TcpStream::connect(server_addr)?;
    let data = b"Hello, Reactor!";
    println!("Sending: {:?}", from_utf8(data).unwrap_or_default());
    stream.write_all(data)?;

    let mut received = Vec::new();
    let mut buf = [0u8; 64];
    while received.len() < data.len() {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    println!("Received: {:?}", from_utf8(&received).unwrap_or_default());

    stop.stop()?;
    server
        .join()
        .map_err(|_| Error::InvariantViolation("server thread panicked".into()))??;
    Ok(())
}

//! Chat Server Example - line-based broadcast chat
//!
//! Every line a client sends is relayed to all other clients. Framing is done
//! here, in the application: the reactor hands over raw receives and the
//! server splits them into lines per connection.
//!
//! Commands:
//! - `/nick <name>` changes the display name
//! - `/who` lists connected participants
//! - `/quit` closes the connection
//!
//! # Usage
//!
//! ```bash
//! cargo run --example chat_server -- --bind 127.0.0.1 --port 9000 -vv
//! # in other terminals
//! nc 127.0.0.1 9000
//! ```

use clap::Parser;
use config::Config;
use rustmux::prelude::*;
use std::collections::HashMap;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const MAX_LINE_LEN: usize = 1024;

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing for the rustmux crate based on verbosity level
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => return, // No tracing
        1 => "info",
        2 => "debug",
        _ => "trace", // 3 or more
    };

    let filter = format!("rustmux={level},chat_server={level}");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(author, version, about = "Line-based chat server", long_about = None)]
struct Args {
    /// Address to bind the server to
    #[arg(short, long)]
    bind: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path (TOML format), keys under [chat] or top level
    #[arg(long)]
    config: Option<String>,
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> ExitCode {
    let args = Args::parse();

    init_tracing(args.verbose);

    let mut builder = Config::builder();
    if let Some(config_path) = &args.config {
        builder = builder.add_source(config::File::with_name(config_path));
    }
    if let Some(bind) = &args.bind {
        builder = match builder.set_override("chat.bind_address", bind.as_str()) {
            Ok(b) => b,
            Err(err) => {
                eprintln!("Invalid bind address: {err}");
                return ExitCode::FAILURE;
            }
        };
    }
    if let Some(port) = args.port {
        builder = match builder.set_override("chat.bind_port", i64::from(port)) {
            Ok(b) => b,
            Err(err) => {
                eprintln!("Invalid port: {err}");
                return ExitCode::FAILURE;
            }
        };
    }

    let listener_config = match builder
        .build()
        .map_err(Error::from)
        .and_then(|config| ListenerConfig::from_config_named(&config, "chat"))
    {
        Ok(c) => c,
        Err(err) => {
            eprintln!("Failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut reactor = match Reactor::new(listener_config, ChatServer::new()) {
        Ok(r) => r,
        Err(err) => {
            eprintln!("Failed to create reactor: {err}");
            return ExitCode::FAILURE;
        }
    };

    match reactor.init() {
        Ok(addr) => println!("Chat server listening on {addr}"),
        Err(err) => {
            eprintln!("Failed to start listener: {err}");
            return ExitCode::FAILURE;
        }
    }

    if let Err(err) = reactor.run() {
        eprintln!("Reactor failed: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

// ============================================================================
// Server Implementation
// ============================================================================

struct Participant {
    name: String,
    // Bytes received after the last complete line
    pending: Vec<u8>,
}

impl Participant {
    fn new(id: ConnectionId) -> Self {
        Self {
            name: format!("guest-{id}"),
            pending: Vec::new(),
        }
    }
}

/// Chat server state, keyed by connection.
struct ChatServer {
    participants: HashMap<ConnectionId, Participant>,
}

impl ChatServer {
    fn new() -> Self {
        Self {
            participants: HashMap::new(),
        }
    }

    fn name_of(&self, id: ConnectionId) -> String {
        self.participants
            .get(&id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| format!("guest-{id}"))
    }

    fn handle_line(&mut self, ctx: &mut Context<'_>, id: ConnectionId, line: &str) {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            return;
        }

        if let Some(name) = line.strip_prefix("/nick ") {
            let name = name.trim();
            if name.len() < 2 || name.len() > 50 {
                let _ = ctx.send_to(id, b"* name must be 2 to 50 characters\n");
                return;
            }
            let old = self.name_of(id);
            if let Some(p) = self.participants.get_mut(&id) {
                p.name = name.to_string();
            }
            ctx.broadcast(format!("* {old} is now known as {name}\n").as_bytes());
        } else if line == "/who" {
            let names: Vec<String> = ctx
                .connection_ids()
                .into_iter()
                .map(|other| self.name_of(other))
                .collect();
            let _ = ctx.send_to(id, format!("* online: {}\n", names.join(", ")).as_bytes());
        } else if line == "/quit" {
            let _ = ctx.send_to(id, b"* bye\n");
            ctx.disconnect(id);
        } else {
            let text = format!("{}: {line}\n", self.name_of(id));
            ctx.broadcast_except(id, text.as_bytes());
        }
    }
}

impl Handler for ChatServer {
    fn on_client_connected(&mut self, ctx: &mut Context<'_>, id: ConnectionId) {
        let participant = Participant::new(id);
        let joined = format!("* {} joined\n", participant.name);
        let welcome = format!("* welcome, {} ({} online)\n", participant.name, ctx.connection_count());
        self.participants.insert(id, participant);

        let _ = ctx.send_to(id, welcome.as_bytes());
        ctx.broadcast_except(id, joined.as_bytes());
    }

    fn on_client_disconnected(&mut self, ctx: &mut Context<'_>, id: ConnectionId) {
        if let Some(participant) = self.participants.remove(&id) {
            ctx.broadcast_except(id, format!("* {} left\n", participant.name).as_bytes());
        }
    }

    fn on_message_received(&mut self, ctx: &mut Context<'_>, id: ConnectionId, data: &[u8]) {
        let Some(participant) = self.participants.get_mut(&id) else {
            return;
        };
        participant.pending.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = participant.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = participant.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        if participant.pending.len() > MAX_LINE_LEN {
            let _ = ctx.send_to(id, b"* line too long\n");
            ctx.disconnect(id);
            return;
        }

        for line in lines {
            self.handle_line(ctx, id, &line);
        }
    }
}

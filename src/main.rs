//! Entry point for `zip-over-udp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode.  All protocol work is delegated to library modules; `main.rs` owns
//! only process setup (logging, argument parsing, exit codes).

use std::net::Ipv4Addr;
use std::process;

use anyhow::Context;
use clap::{Parser, Subcommand};

use zip_over_udp::client::Client;
use zip_over_udp::server::Server;

/// Account-transfer service over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the server, registering clients and processing transfers.
    Server {
        /// UDP port to bind (1-65535).
        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,
    },
    /// Run an interactive client; reads `<dest-ip> <value>` lines from stdin.
    Client {
        /// Server UDP port (1-65535).
        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,
        /// Server IPv4 address.  Omit to locate a server by broadcast.
        server_ip: Option<Ipv4Addr>,
    },
}

fn main() {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            process::exit(1);
        }
    };

    if let Err(e) = run(cli) {
        eprintln!("fatal: {e:#}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.mode {
        Mode::Server { port } => {
            let server = Server::bind(port).with_context(|| format!("binding UDP port {port}"))?;
            server.run();
            Ok(())
        }
        Mode::Client { port, server_ip } => {
            let mut client = Client::connect(port, server_ip).context("locating server")?;
            client.run().context("client loop failed")?;
            Ok(())
        }
    }
}

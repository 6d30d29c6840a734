// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::net::IpAddr;
use std::thread;

use clap::{Parser, ValueEnum};
use log::info;
use nix::sys::signal::{SigSet, Signal};

use matrix_service::server::{
    Config, MtBlockingServer, Server, StBlockingServer, StNonblockingServer, StopHandle,
};

/// Matrix-multiplication RPC server.
#[derive(Parser)]
struct Cli {
    /// Connection-handling strategy.
    #[arg(short = 's', long = "server_type")]
    server_type: ServerType,

    /// The listening address.
    #[arg(short, long, default_value = "0.0.0.0")]
    address: IpAddr,

    /// The listening TCP port.
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Keep client connections open after a succesful response.
    #[arg(short, long)]
    keepalive: bool,

    /// Most connections mt_blocking serves at once.
    #[arg(short = 't', long = "thread_limit", default_value_t = 4)]
    thread_limit: usize,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
#[value(rename_all = "snake_case")]
enum ServerType {
    StBlocking,
    MtBlocking,
    StNonblocking,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version print to stdout and exit 0; anything else is
            // an argument error and exits 1.
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    env_logger::init();

    let config = Config {
        address: cli.address,
        port: cli.port,
        keepalive: cli.keepalive,
        thread_limit: cli.thread_limit,
    };

    let mut server: Box<dyn Server> = match cli.server_type {
        ServerType::StBlocking => Box::new(StBlockingServer::new(config)?),
        ServerType::MtBlocking => Box::new(MtBlockingServer::new(config)?),
        ServerType::StNonblocking => Box::new(StNonblockingServer::new(config)?),
    };

    spawn_signal_agent(server.stop_handle())?;

    info!("listening on {}:{}", cli.address, cli.port);
    server.run()?;

    Ok(())
}

/// Blocks SIGINT and SIGTERM for the whole process and parks a thread in
/// sigwait(2); the first delivered signal asks the server to stop.
fn spawn_signal_agent(stop: StopHandle) -> Result<(), Box<dyn std::error::Error>> {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block()?;

    thread::spawn(move || {
        if signals.wait().is_ok() {
            stop.stop();
        }
    });

    Ok(())
}

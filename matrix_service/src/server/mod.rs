// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The connection-handling reactors.
//!
//! Three interchangeable strategies drive the same framing, dispatch, and
//! error-envelope contract: one connection at a time over blocking sockets,
//! a bounded pool of per-connection threads, and a single-threaded epoll
//! loop over nonblocking sockets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::Error;

pub mod framed;
pub mod mt_blocking;
pub mod st_blocking;
pub mod st_nonblocking;

pub use mt_blocking::MtBlockingServer;
pub use st_blocking::StBlockingServer;
pub use st_nonblocking::StNonblockingServer;

/// Runtime configuration shared by every server flavor.
#[derive(Debug, Clone)]
pub struct Config {
    pub address: IpAddr,
    pub port: u16,

    /// Keep a connection open for further requests after a succesful
    /// response, instead of closing it right away.
    pub keepalive: bool,

    /// Upper bound on concurrently served connections (mt_blocking only).
    pub thread_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            keepalive: false,
            thread_limit: 4,
        }
    }
}

/// A running reactor: `run` drives the accept loop until a stop is requested
/// through the handle or the listening socket fails.
pub trait Server {
    fn run(&mut self) -> Result<(), Error>;

    /// Handle for requesting shutdown from another thread, typically a
    /// signal-handling agent.
    fn stop_handle(&self) -> StopHandle;
}

/// Clonable handle that asks a running server to shut down.
///
/// `stop` flips the server's stop flag and shuts down its registered
/// sockets, which unblocks any pending `accept`, read, write, or readiness
/// wait. It is idempotent, never blocks on server work, and never closes a
/// descriptor it does not own; closing is left to the reactor's own cleanup.
#[derive(Clone)]
pub struct StopHandle {
    target: Arc<dyn StopTarget + Send + Sync>,
}

impl StopHandle {
    pub(crate) fn new(target: Arc<dyn StopTarget + Send + Sync>) -> Self {
        Self { target }
    }

    pub fn stop(&self) {
        self.target.request_stop();
    }
}

pub(crate) trait StopTarget {
    fn request_stop(&self);
}

pub(crate) fn bind_listener(config: &Config) -> Result<TcpListener, Error> {
    TcpListener::bind(SocketAddr::new(config.address, config.port))
        .map_err(|e| Error::syscall("bind", e, "creating the listening socket"))
}

/// Shuts down both directions of a socket, ignoring failures: the fd may
/// already be half closed or the peer already gone.
pub(crate) fn shutdown_fd(fd: RawFd) {
    let _ = nix::sys::socket::shutdown(fd, nix::sys::socket::Shutdown::Both);
}

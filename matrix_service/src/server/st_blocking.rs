// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The single-threaded blocking reactor: one connection at a time, blocking
//! socket calls throughout.

use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use log::*;

use super::framed::serve_connection;
use super::{bind_listener, shutdown_fd, Config, Server, StopHandle, StopTarget};
use crate::Error;

pub struct StBlockingServer {
    config: Config,
    listener: TcpListener,
    shared: Arc<Shared>,
}

struct Shared {
    stop: AtomicBool,
    listener_fd: RawFd,

    /// Raw fd of the connection currently being served, or -1. Registered
    /// so a stop can interrupt a blocked read or write.
    client_fd: AtomicI32,
}

impl StopTarget for Shared {
    fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        shutdown_fd(self.listener_fd);
        let client = self.client_fd.load(Ordering::SeqCst);
        if client != -1 {
            shutdown_fd(client);
        }
    }
}

impl StBlockingServer {
    pub fn new(config: Config) -> Result<Self, Error> {
        let listener = bind_listener(&config)?;
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            listener_fd: listener.as_raw_fd(),
            client_fd: AtomicI32::new(-1),
        });

        Ok(Self {
            config,
            listener,
            shared,
        })
    }

    /// Address the listener is bound to (useful with a requested port of 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn stopped(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    fn serve_client(&self, mut stream: TcpStream) {
        self.shared
            .client_fd
            .store(stream.as_raw_fd(), Ordering::SeqCst);

        // An I/O failure ends this conversation, not the server.
        if let Err(e) = serve_connection(&mut stream, self.config.keepalive, &self.shared.stop) {
            warn!("client connection failed: {e}");
        }

        self.shared.client_fd.store(-1, Ordering::SeqCst);
        if !self.stopped() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Server for StBlockingServer {
    fn run(&mut self) -> Result<(), Error> {
        while !self.stopped() {
            let stream = match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {peer}");
                    stream
                }
                Err(e) => {
                    // The stop handle shuts the listener down, which makes a
                    // blocked accept fail; that is orderly termination.
                    if self.stopped() {
                        break;
                    }
                    return Err(Error::syscall("accept", e, "st_blocking accept loop"));
                }
            };

            self.serve_client(stream);
        }
        Ok(())
    }

    fn stop_handle(&self) -> StopHandle {
        StopHandle::new(self.shared.clone())
    }
}

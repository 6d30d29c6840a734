// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The single-threaded nonblocking reactor: epoll readiness notifications
//! driving a small per-client state machine.
//!
//! A client is registered for read readiness while a request is being
//! assembled and for write readiness while a response is being flushed,
//! never both. Handlers do the most work the socket currently permits and
//! then yield back to the event loop, so no client can starve another.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::*;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use super::{bind_listener, shutdown_fd, Config, Server, StopHandle, StopTarget};
use crate::dispatch;
use crate::Error;

const MAX_EVENTS: usize = 16;

/// Which step of the request/response cycle a client is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    ReadingLength,
    ReadingBody,
    WritingResponse,
}

struct ClientState {
    stream: TcpStream,
    phase: Phase,
    read_buffer: Vec<u8>,
    read_offset: usize,
    write_buffer: Vec<u8>,
    write_offset: usize,

    /// Set when the pending response is a protocol failure; the connection
    /// is torn down once that response is flushed.
    is_closing: bool,
}

impl ClientState {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            phase: Phase::ReadingLength,
            read_buffer: vec![0; 4],
            read_offset: 0,
            write_buffer: Vec::new(),
            write_offset: 0,
            is_closing: false,
        }
    }

    fn reset_read(&mut self) {
        self.read_buffer.clear();
        self.read_buffer.resize(4, 0);
        self.read_offset = 0;
    }
}

/// Result of pushing a nonblocking transfer as far as the socket permits.
enum TryIo {
    /// The buffer was filled (or drained) completely.
    Complete,
    /// The socket would block; wait for the next readiness event.
    Pending,
    /// The peer closed the stream or the socket failed.
    Failed,
}

fn try_read(stream: &mut TcpStream, buf: &mut [u8], offset: &mut usize) -> TryIo {
    while *offset < buf.len() {
        match stream.read(&mut buf[*offset..]) {
            Ok(0) => return TryIo::Failed,
            Ok(n) => *offset += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return TryIo::Pending,
            Err(_) => return TryIo::Failed,
        }
    }
    TryIo::Complete
}

fn try_write(stream: &mut TcpStream, buf: &[u8], offset: &mut usize) -> TryIo {
    while *offset < buf.len() {
        match stream.write(&buf[*offset..]) {
            Ok(0) => return TryIo::Failed,
            Ok(n) => *offset += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return TryIo::Pending,
            Err(_) => return TryIo::Failed,
        }
    }
    TryIo::Complete
}

pub struct StNonblockingServer {
    config: Config,
    listener: TcpListener,
    epoll: Epoll,
    clients: HashMap<RawFd, ClientState>,
    shared: Arc<Shared>,
}

struct Shared {
    stop: AtomicBool,
    listener_fd: RawFd,

    /// Live client fds, mirrored from the event loop so a stop can shut
    /// every conversation down and wake the readiness wait.
    client_fds: Mutex<HashSet<RawFd>>,
}

impl StopTarget for Shared {
    fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        shutdown_fd(self.listener_fd);
        if let Ok(fds) = self.client_fds.lock() {
            for fd in fds.iter() {
                shutdown_fd(*fd);
            }
        }
    }
}

impl StNonblockingServer {
    pub fn new(config: Config) -> Result<Self, Error> {
        let listener = bind_listener(&config)?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::syscall("fcntl", e, "setting the listener nonblocking"))?;

        let epoll = Epoll::new(EpollCreateFlags::empty())
            .map_err(|e| Error::syscall("epoll_create1", e.into(), "creating the multiplexer"))?;

        let listener_fd = listener.as_raw_fd();
        epoll
            .add(&listener, EpollEvent::new(EpollFlags::EPOLLIN, listener_fd as u64))
            .map_err(|e| Error::syscall("epoll_ctl", e.into(), "registering the listener"))?;

        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            listener_fd,
            client_fds: Mutex::new(HashSet::new()),
        });

        Ok(Self {
            config,
            listener,
            epoll,
            clients: HashMap::new(),
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

    fn accept_client(&mut self) {
        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            // Nothing actually pending, or the listener was shut down.
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                if !self.stopped() {
                    warn!("accept failed: {e}");
                }
                return;
            }
        };

        if let Err(e) = stream.set_nonblocking(true) {
            warn!("dropping connection from {peer}: {e}");
            return;
        }

        let fd = stream.as_raw_fd();
        if let Err(e) = self
            .epoll
            .add(&stream, EpollEvent::new(EpollFlags::EPOLLIN, fd as u64))
        {
            warn!("dropping connection from {peer}: {e}");
            return;
        }

        debug!("accepted connection from {peer}");
        self.clients.insert(fd, ClientState::new(stream));
        if let Ok(mut fds) = self.shared.client_fds.lock() {
            fds.insert(fd);
        }
    }

    fn drive_client(&mut self, fd: RawFd, ready: EpollFlags) {
        // The fd may belong to a client already closed earlier in this
        // event batch.
        if !self.clients.contains_key(&fd) {
            return;
        }

        if ready.contains(EpollFlags::EPOLLIN) {
            self.handle_client_read(fd);
        }
        if ready.contains(EpollFlags::EPOLLOUT) {
            self.handle_client_write(fd);
        }
        if !ready.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT)
            && ready.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR)
        {
            self.close_client(fd);
        }
    }

    fn handle_client_read(&mut self, fd: RawFd) {
        let Some(state) = self.clients.get_mut(&fd) else {
            return;
        };
        if state.phase == Phase::WritingResponse {
            return;
        }

        if state.phase == Phase::ReadingLength {
            match try_read(&mut state.stream, &mut state.read_buffer, &mut state.read_offset) {
                TryIo::Failed => return self.close_client(fd),
                TryIo::Pending => return,
                TryIo::Complete => {}
            }

            let mut prefix = [0u8; 4];
            prefix.copy_from_slice(&state.read_buffer[..4]);
            let length = u32::from_ne_bytes(prefix) as usize;
            if length == 0 {
                // A zero-length frame is a no-op; keep waiting for a real
                // one.
                state.reset_read();
                return;
            }

            state.phase = Phase::ReadingBody;
            state.read_buffer.resize(4 + length, 0);
            // Fall through: the body may already be readable.
        }

        match try_read(&mut state.stream, &mut state.read_buffer, &mut state.read_offset) {
            TryIo::Failed => return self.close_client(fd),
            TryIo::Pending => return,
            TryIo::Complete => {}
        }

        // Whole request assembled: execute it and queue the response.
        let outcome = dispatch::dispatch(&state.read_buffer[4..]);
        state.is_closing = !outcome.is_reply();

        let response = outcome.into_bytes();
        state.write_buffer.clear();
        state
            .write_buffer
            .extend_from_slice(&(response.len() as u32).to_ne_bytes());
        state.write_buffer.extend_from_slice(&response);
        state.write_offset = 0;

        state.reset_read();
        state.phase = Phase::WritingResponse;

        // The response goes out before the next request comes in.
        self.rearm(fd, EpollFlags::EPOLLOUT);
    }

    fn handle_client_write(&mut self, fd: RawFd) {
        let Some(state) = self.clients.get_mut(&fd) else {
            return;
        };
        if state.phase != Phase::WritingResponse {
            return;
        }

        match try_write(&mut state.stream, &state.write_buffer, &mut state.write_offset) {
            TryIo::Failed => return self.close_client(fd),
            TryIo::Pending => return,
            TryIo::Complete => {}
        }

        state.write_buffer.clear();
        state.write_offset = 0;

        if self.config.keepalive && !state.is_closing {
            state.phase = Phase::ReadingLength;
            self.rearm(fd, EpollFlags::EPOLLIN);
        } else {
            self.close_client(fd);
        }
    }

    fn rearm(&mut self, fd: RawFd, interest: EpollFlags) {
        let Some(state) = self.clients.get(&fd) else {
            return;
        };
        let mut event = EpollEvent::new(interest, fd as u64);
        if let Err(e) = self.epoll.modify(&state.stream, &mut event) {
            warn!("re-arming client {fd} failed: {e}");
            self.close_client(fd);
        }
    }

    fn close_client(&mut self, fd: RawFd) {
        let Some(state) = self.clients.remove(&fd) else {
            return;
        };
        if let Err(e) = self.epoll.delete(&state.stream) {
            trace!("deregistering client {fd}: {e}");
        }
        let _ = state.stream.shutdown(Shutdown::Both);
        if let Ok(mut fds) = self.shared.client_fds.lock() {
            fds.remove(&fd);
        }
        debug!("closed client {fd}");
        // Dropping the state closes the socket.
    }
}

impl Server for StNonblockingServer {
    fn run(&mut self) -> Result<(), Error> {
        let mut events = vec![EpollEvent::empty(); MAX_EVENTS];

        while !self.stopped() {
            let count = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(count) => count,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    if self.stopped() {
                        break;
                    }
                    return Err(Error::syscall("epoll_wait", e.into(), "waiting for readiness"));
                }
            };

            for event in &events[..count] {
                let fd = event.data() as RawFd;
                if fd == self.shared.listener_fd {
                    self.accept_client();
                } else {
                    self.drive_client(fd, event.events());
                }
            }
        }

        // Tear down whatever conversations were still live.
        let fds: Vec<RawFd> = self.clients.keys().copied().collect();
        for fd in fds {
            self.close_client(fd);
        }
        Ok(())
    }

    fn stop_handle(&self) -> StopHandle {
        StopHandle::new(self.shared.clone())
    }
}

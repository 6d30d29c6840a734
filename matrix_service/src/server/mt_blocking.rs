// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The multi-threaded blocking reactor: an accept loop feeding a bounded
//! pool of per-connection worker threads.
//!
//! One mutex guards the pool state (the worker registry and the queue of
//! finished worker ids); one condition variable wakes the accept loop when a
//! slot frees. A worker announces itself on the finished queue as its last
//! act, and only the accept loop (or the final cleanup) joins threads, so
//! every spawned worker is joined exactly once.

use std::collections::{HashMap, VecDeque};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::*;

use super::framed::serve_connection;
use super::{bind_listener, shutdown_fd, Config, Server, StopHandle, StopTarget};
use crate::Error;

pub struct MtBlockingServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

struct Shared {
    stop: AtomicBool,
    listener_fd: RawFd,
    keepalive: bool,
    thread_limit: usize,
    pool: Mutex<Pool>,
    slot_freed: Condvar,
}

#[derive(Default)]
struct Pool {
    next_id: u64,
    workers: HashMap<u64, Worker>,
    finished: VecDeque<u64>,
}

struct Worker {
    handle: JoinHandle<()>,

    /// The worker's client socket, cleared by the worker itself before the
    /// socket is dropped, so a concurrent stop never touches a recycled fd.
    client_fd: Option<RawFd>,
}

impl Pool {
    /// Removes every worker listed on the finished queue from the registry,
    /// handing their join handles to the caller.
    fn take_finished(&mut self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        while let Some(id) = self.finished.pop_front() {
            if let Some(worker) = self.workers.remove(&id) {
                handles.push(worker.handle);
            }
        }
        handles
    }
}

impl StopTarget for Shared {
    fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        shutdown_fd(self.listener_fd);

        // Workers blocked in a read on an idle keepalive connection only
        // observe the flag once their socket wakes up.
        if let Ok(pool) = self.pool.lock() {
            for worker in pool.workers.values() {
                if let Some(fd) = worker.client_fd {
                    shutdown_fd(fd);
                }
            }
        }

        self.slot_freed.notify_all();
    }
}

impl MtBlockingServer {
    pub fn new(config: Config) -> Result<Self, Error> {
        let listener = bind_listener(&config)?;
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            listener_fd: listener.as_raw_fd(),
            keepalive: config.keepalive,
            thread_limit: config.thread_limit.max(1),
            pool: Mutex::new(Pool::default()),
            slot_freed: Condvar::new(),
        });

        Ok(Self { listener, shared })
    }

    /// Address the listener is bound to (useful with a requested port of 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn stopped(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    /// Blocks until the pool is below its limit (or a stop arrives), joining
    /// every worker that has reported itself finished along the way.
    fn wait_for_slot(&self) {
        let mut pool = self.shared.pool.lock().unwrap();
        loop {
            let finished = pool.take_finished();
            if !finished.is_empty() {
                drop(pool);
                for handle in finished {
                    let _ = handle.join();
                }
                pool = self.shared.pool.lock().unwrap();
                continue;
            }

            if pool.workers.len() < self.shared.thread_limit || self.stopped() {
                return;
            }

            pool = self.shared.slot_freed.wait(pool).unwrap();
        }
    }

    fn spawn_worker(&self, stream: TcpStream) {
        let shared = Arc::clone(&self.shared);

        // Registration happens under the pool mutex before the worker can
        // reach its own epilogue, which also takes the mutex.
        let mut pool = self.shared.pool.lock().unwrap();
        let id = pool.next_id;
        pool.next_id += 1;
        let client_fd = stream.as_raw_fd();

        let handle = std::thread::spawn(move || worker_main(id, stream, shared));

        pool.workers.insert(
            id,
            Worker {
                handle,
                client_fd: Some(client_fd),
            },
        );
    }

    fn join_all(&self) {
        let handles = {
            let mut pool = self.shared.pool.lock().unwrap();
            pool.finished.clear();
            pool.workers
                .drain()
                .map(|(_, worker)| worker.handle)
                .collect::<Vec<_>>()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Server for MtBlockingServer {
    fn run(&mut self) -> Result<(), Error> {
        while !self.stopped() {
            self.wait_for_slot();
            if self.stopped() {
                break;
            }

            let stream = match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {peer}");
                    stream
                }
                Err(e) => {
                    if self.stopped() {
                        break;
                    }
                    self.join_all();
                    return Err(Error::syscall("accept", e, "mt_blocking accept loop"));
                }
            };

            self.spawn_worker(stream);
        }

        self.join_all();
        Ok(())
    }

    fn stop_handle(&self) -> StopHandle {
        StopHandle::new(self.shared.clone())
    }
}

impl Drop for MtBlockingServer {
    fn drop(&mut self) {
        // Normally run() has joined everything already; this covers a server
        // dropped mid-run or never run at all.
        self.shared.request_stop();
        self.join_all();
    }
}

fn worker_main(id: u64, mut stream: TcpStream, shared: Arc<Shared>) {
    // A panicking procedure takes down this connection, never the server.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        serve_connection(&mut stream, shared.keepalive, &shared.stop)
    }));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("worker {id}: connection failed: {e}"),
        Err(_) => error!("worker {id}: connection handler panicked"),
    }

    if !shared.stop.load(Ordering::SeqCst) {
        let _ = stream.shutdown(Shutdown::Both);
    }

    let mut pool = shared.pool.lock().unwrap();
    if let Some(worker) = pool.workers.get_mut(&id) {
        worker.client_fd = None;
    }
    pool.finished.push_back(id);
    drop(pool);
    shared.slot_freed.notify_all();

    // The stream (and its fd) is dropped only after the registry entry was
    // cleared above.
    drop(stream);
}

// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A "pipe", constructed using socketpair(2), that can be used for testing
//! connection handling without a real listener.

use std::os::fd::AsRawFd;

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

pub struct Endpoint {
    fd: std::os::fd::OwnedFd,
}

pub fn pipe() -> std::io::Result<(Endpoint, Endpoint)> {
    let (a, b) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )?;

    Ok((Endpoint { fd: a }, Endpoint { fd: b }))
}

impl Endpoint {
    /// Half-closes this end, so the peer's next read reports end-of-stream
    /// while this endpoint stays open for reading.
    pub fn shutdown_write(&self) -> std::io::Result<()> {
        nix::sys::socket::shutdown(self.fd.as_raw_fd(), nix::sys::socket::Shutdown::Write)?;
        Ok(())
    }
}

impl std::io::Read for Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(nix::unistd::read(&self.fd, buf)?)
    }
}

impl std::io::Write for Endpoint {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(nix::unistd::write(&self.fd, buf)?)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

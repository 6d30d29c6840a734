// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Stop-aware exact-count transfers over blocking streams, and the
//! request/response loop built on top of them.
//!
//! The wire format is one frame per message: a 4-byte length prefix in host
//! byte order, then that many bytes of envelope.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use log::*;

use crate::dispatch;
use crate::Error;

/// How an exact-count transfer ended.
#[derive(Debug)]
pub enum IoStatus {
    /// The whole buffer was transferred and no stop was requested.
    Done,
    /// The peer shut down the stream mid-transfer.
    PeerClosed,
    /// A stop request interrupted the transfer.
    Stopped,
    /// The stream failed.
    Failed(std::io::Error),
}

/// Reads exactly `buf.len()` bytes, looping over partial reads.
pub fn read_exact_stoppable(
    stream: &mut impl Read,
    buf: &mut [u8],
    stop: &AtomicBool,
) -> IoStatus {
    drive(buf.len(), stop, |done| stream.read(&mut buf[done..]))
}

/// Writes exactly `buf.len()` bytes, looping over partial writes.
pub fn write_exact_stoppable(
    stream: &mut impl Write,
    buf: &[u8],
    stop: &AtomicBool,
) -> IoStatus {
    drive(buf.len(), stop, |done| stream.write(&buf[done..]))
}

fn drive(
    total: usize,
    stop: &AtomicBool,
    mut io_step: impl FnMut(usize) -> std::io::Result<usize>,
) -> IoStatus {
    let mut done = 0;
    while done < total {
        if stop.load(Ordering::SeqCst) {
            return IoStatus::Stopped;
        }
        match io_step(done) {
            Ok(0) => return IoStatus::PeerClosed,
            Ok(n) => done += n,
            // A stop request shuts the socket down under us; the resulting
            // failure is orderly termination, not an error.
            Err(e) => {
                return if stop.load(Ordering::SeqCst) {
                    IoStatus::Stopped
                } else {
                    IoStatus::Failed(e)
                };
            }
        }
    }

    if stop.load(Ordering::SeqCst) {
        IoStatus::Stopped
    } else {
        IoStatus::Done
    }
}

/// Drives request/response pairs over one accepted connection.
///
/// Returns once the peer goes away, a protocol failure has been answered,
/// keepalive is off after a succesful response, or a stop interrupts the
/// transfer. An I/O failure is surfaced to the caller; everything else is a
/// normal end of conversation.
pub fn serve_connection(
    stream: &mut (impl Read + Write),
    keepalive: bool,
    stop: &AtomicBool,
) -> Result<(), Error> {
    loop {
        let mut prefix = [0u8; 4];
        match read_exact_stoppable(stream, &mut prefix, stop) {
            IoStatus::Done => {}
            IoStatus::PeerClosed | IoStatus::Stopped => return Ok(()),
            IoStatus::Failed(e) => return Err(Error::Io(e)),
        }

        let length = u32::from_ne_bytes(prefix) as usize;
        if length == 0 {
            // A zero-length frame is a no-op; nothing to answer.
            continue;
        }
        trace!("request frame of {length} bytes");

        let mut request = vec![0u8; length];
        match read_exact_stoppable(stream, &mut request, stop) {
            IoStatus::Done => {}
            IoStatus::PeerClosed | IoStatus::Stopped => return Ok(()),
            IoStatus::Failed(e) => return Err(Error::Io(e)),
        }

        let outcome = dispatch::dispatch(&request);

        let response = outcome.bytes();
        let prefix = (response.len() as u32).to_ne_bytes();
        match write_exact_stoppable(stream, &prefix, stop) {
            IoStatus::Done => {}
            IoStatus::PeerClosed | IoStatus::Stopped => return Ok(()),
            IoStatus::Failed(e) => return Err(Error::Io(e)),
        }
        match write_exact_stoppable(stream, response, stop) {
            IoStatus::Done => {}
            IoStatus::PeerClosed | IoStatus::Stopped => return Ok(()),
            IoStatus::Failed(e) => return Err(Error::Io(e)),
        }

        if !outcome.is_reply() || !keepalive {
            return Ok(());
        }
    }
}

// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

pub mod dispatch;
pub mod pipe;
mod procedures;
pub mod proto;
pub mod server;

use std::fmt;
use std::io;

/// The errors that can end a server run or an individual client connection.
#[derive(Debug)]
pub enum Error {
    /// A socket or multiplexer system call failed while no stop was
    /// requested.
    Syscall {
        call: &'static str,
        source: io::Error,
        context: &'static str,
    },

    /// An I/O failure on an individual client stream.
    Io(io::Error),
}

impl Error {
    pub(crate) fn syscall(call: &'static str, source: io::Error, context: &'static str) -> Self {
        Self::Syscall {
            call,
            source,
            context,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Syscall { source, .. } | Self::Io(source) => Some(source),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Syscall {
                call,
                source,
                context,
            } => {
                write!(f, "system call '{call}' failed ({context}): {source}")
            }
            Self::Io(source) => write!(f, "I/O error: {source}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

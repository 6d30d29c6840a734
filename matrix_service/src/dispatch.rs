// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Routing of envelope payloads to the registered procedures.

use std::fmt;

use log::*;

use crate::procedures;
use crate::proto;

/// A procedure implementation takes the encoded argument from a request
/// envelope and returns either the encoded response or a [`ProcedureError`]
/// describing why the request could not be executed.
pub type Procedure = fn(&[u8]) -> Result<Vec<u8>, ProcedureError>;

/// Registered procedures, indexed by procedure id. The 0th slot is the
/// reserved INVALID id and is never dispatched.
const PROCEDURES: [Option<Procedure>; 2] = [None, Some(procedures::matrix_op)];

// Every procedure's table index must equal the id its schemas declare; a
// mismatch here must not survive compilation.
const _: () = {
    assert!(proto::MatrixOpRequest::PROC_ID == 1);
    assert!(proto::MatrixOpResponse::PROC_ID == 1);
};

/// A non-fatal dispatch failure, reported to the peer as an envelope with
/// the INVALID procedure id and this diagnostic as its payload.
#[derive(Debug)]
pub struct ProcedureError(String);

impl ProcedureError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    fn into_message(self) -> String {
        self.0
    }
}

impl std::error::Error for ProcedureError {}

impl fmt::Display for ProcedureError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What `dispatch` produced for one request envelope.
///
/// Both arms carry a fully encoded response envelope; the distinction tells
/// the reactor whether the conversation may continue. `Reply` echoes the
/// request's procedure id and may keep the connection alive; `Fail` carries
/// the INVALID id and closes it. Calculation errors inside a procedure are
/// not failures: they ride inside the procedure's own response schema.
pub enum Outcome {
    Reply(Vec<u8>),
    Fail(Vec<u8>),
}

impl Outcome {
    pub fn is_reply(&self) -> bool {
        matches!(self, Self::Reply(_))
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Reply(bytes) | Self::Fail(bytes) => bytes,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Reply(bytes) | Self::Fail(bytes) => bytes,
        }
    }
}

/// Executes the procedure addressed by a request envelope.
pub fn dispatch(request: &[u8]) -> Outcome {
    match try_dispatch(request) {
        Ok(reply) => Outcome::Reply(reply.serialize_alloc()),
        Err(e) => {
            debug!("dispatch failed: {e}");
            let reply = proto::ProcedureData {
                proc_id: proto::PROC_ID_INVALID,
                payload: e.into_message().into_bytes(),
            };
            Outcome::Fail(reply.serialize_alloc())
        }
    }
}

fn try_dispatch(request: &[u8]) -> Result<proto::ProcedureData, ProcedureError> {
    let (proc_id, payload) = proto::decode_envelope(request)
        .map_err(|_| ProcedureError::new("Corrupted matrix_service::Procedure protobuf!"))?;

    trace!("dispatching procedure {proc_id}, argument of {} bytes", payload.len());

    let procedure = PROCEDURES
        .get(proc_id as usize)
        .copied()
        .flatten()
        .ok_or_else(|| ProcedureError::new(format!("Unknown ProcedureId: {proc_id}")))?;

    let response = procedure(&payload)?;

    Ok(proto::ProcedureData {
        proc_id,
        payload: response,
    })
}

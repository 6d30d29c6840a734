// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The procedure implementations registered in the dispatch table.

use log::*;

use matrix_op::{Matrix, MatrixError};

use crate::dispatch::ProcedureError;
use crate::proto;

/// The matrix-operation procedure: decodes a `MatrixOpRequest`, multiplies
/// the two argument matrices, and encodes a `MatrixOpResponse`.
///
/// Calculation failures (incompatible shapes, empty matrices) are carried
/// inside the response and do not fail the envelope; only a malformed
/// request surfaces as a [`ProcedureError`].
pub(crate) fn matrix_op(payload: &[u8]) -> Result<Vec<u8>, ProcedureError> {
    let mut request = proto::MatrixOpRequest::default();
    let mut input = payload;
    if request.deserialize(&mut input).is_err() {
        return Err(ProcedureError::new(format!(
            "Corrupted protobuf for procedure request with id {}!",
            proto::MatrixOpRequest::PROC_ID
        )));
    }

    if request.op != proto::OP_MUL {
        return Err(ProcedureError::new(format!(
            "Unsupported operation in MatrixOpRequest: {}",
            request.op
        )));
    }
    if request.args.len() != 2 {
        return Err(ProcedureError::new(format!(
            "Invalid count of args in MatrixOpRequest: {}",
            request.args.len()
        )));
    }
    for arg in &request.args {
        check_content_size(arg)?;
    }

    debug!(
        "MUL of {} x {} by {} x {}",
        request.args[0].rows, request.args[0].columns, request.args[1].rows, request.args[1].columns
    );

    let response = match multiply(&request.args[0], &request.args[1]) {
        Ok(product) => proto::MatrixOpResponse {
            outcome: Some(proto::MatrixOpOutcome::Result(proto::Matrix {
                rows: product.rows(),
                columns: product.columns(),
                content: product.content().to_vec(),
            })),
        },
        Err(e) => proto::MatrixOpResponse {
            outcome: Some(proto::MatrixOpOutcome::Error(e.to_string())),
        },
    };

    Ok(response.serialize_alloc())
}

/// A content length that disagrees with the declared dimensions means the
/// request itself is malformed, as opposed to describing an impossible
/// calculation.
fn check_content_size(matrix: &proto::Matrix) -> Result<(), ProcedureError> {
    if matrix.content.len() != matrix.rows as usize * matrix.columns as usize {
        return Err(ProcedureError::new(format!(
            "Invalid matrix content size: {} != {} x {}",
            matrix.content.len(),
            matrix.rows,
            matrix.columns
        )));
    }
    Ok(())
}

fn multiply(a: &proto::Matrix, b: &proto::Matrix) -> Result<Matrix, MatrixError> {
    let a = Matrix::new(a.rows, a.columns, a.content.clone())?;
    let b = Matrix::new(b.rows, b.columns, b.content.clone())?;
    a.multiply(&b)
}

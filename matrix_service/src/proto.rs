// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Wire bindings for the service's protobuf messages.
//!
//! The schema is fixed at compile time (one envelope plus the matrix
//! procedure's request and response), so the bindings are committed source
//! rather than generator output. Every message follows the same shape:
//! `Default` construction, `serialize_alloc` producing the proto3 encoding,
//! and `deserialize` consuming one from the front of a byte slice.

pub use helpers::DeserializeError;

/// Reserved procedure id used in responses to flag a protocol-level failure.
pub const PROC_ID_INVALID: u32 = 0;

/// Procedure id of the matrix-operation procedure.
pub const PROC_ID_MATRIX_OP: u32 = 1;

/// The only operation discriminant [`MatrixOpRequest::op`] currently
/// defines. Unknown discriminants survive a decode so the service can name
/// them in diagnostics.
pub const OP_MUL: u32 = 0;

/// Builds the outer envelope carrying `payload` under `proc_id`.
pub fn encode_envelope(proc_id: u32, payload: &[u8]) -> Vec<u8> {
    ProcedureData {
        proc_id,
        payload: payload.to_vec(),
    }
    .serialize_alloc()
}

/// Splits an envelope into its procedure id and payload.
///
/// An empty byte string is rejected: a peer always encodes at least the
/// procedure id field.
pub fn decode_envelope(bytes: &[u8]) -> Result<(u32, Vec<u8>), DeserializeError> {
    if bytes.is_empty() {
        return Err(DeserializeError);
    }

    let mut envelope = ProcedureData::default();
    let mut input = bytes;
    envelope.deserialize(&mut input)?;

    Ok((envelope.proc_id, envelope.payload))
}

/// The outer message framing every request and response: a procedure id and
/// the serialized inner message for that procedure.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProcedureData {
    pub proc_id: u32,
    pub payload: Vec<u8>,
}

impl ProcedureData {
    pub fn serialize_alloc(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if self.proc_id != 0 {
            helpers::put_key(1, helpers::WIRE_VARINT, &mut buf);
            helpers::put_varint(u64::from(self.proc_id), &mut buf);
        }
        if !self.payload.is_empty() {
            helpers::put_len_delimited(2, &self.payload, &mut buf);
        }
        buf
    }

    pub fn deserialize(&mut self, input: &mut &[u8]) -> Result<(), DeserializeError> {
        while !input.is_empty() {
            let (field, wire_type) = helpers::get_key(input)?;
            match (field, wire_type) {
                (1, helpers::WIRE_VARINT) => {
                    let mut value = 0;
                    helpers::get_varint(&mut value, input)?;
                    self.proc_id = value as u32;
                }
                (2, helpers::WIRE_LEN) => {
                    self.payload = helpers::get_len_delimited(input)?.to_vec();
                }
                (_, wire_type) => helpers::skip_field(wire_type, input)?,
            }
        }
        Ok(())
    }
}

/// A dense row-major matrix as it appears on the wire.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Matrix {
    pub rows: u32,
    pub columns: u32,
    pub content: Vec<f32>,
}

impl Matrix {
    pub fn serialize_alloc(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if self.rows != 0 {
            helpers::put_key(1, helpers::WIRE_VARINT, &mut buf);
            helpers::put_varint(u64::from(self.rows), &mut buf);
        }
        if self.columns != 0 {
            helpers::put_key(2, helpers::WIRE_VARINT, &mut buf);
            helpers::put_varint(u64::from(self.columns), &mut buf);
        }
        if !self.content.is_empty() {
            helpers::put_key(3, helpers::WIRE_LEN, &mut buf);
            helpers::put_varint(4 * self.content.len() as u64, &mut buf);
            for value in &self.content {
                buf.extend_from_slice(&value.to_le_bytes());
            }
        }
        buf
    }

    pub fn deserialize(&mut self, input: &mut &[u8]) -> Result<(), DeserializeError> {
        while !input.is_empty() {
            let (field, wire_type) = helpers::get_key(input)?;
            match (field, wire_type) {
                (1, helpers::WIRE_VARINT) => {
                    let mut value = 0;
                    helpers::get_varint(&mut value, input)?;
                    self.rows = value as u32;
                }
                (2, helpers::WIRE_VARINT) => {
                    let mut value = 0;
                    helpers::get_varint(&mut value, input)?;
                    self.columns = value as u32;
                }
                (3, helpers::WIRE_LEN) => {
                    // Packed encoding: a run of little-endian 32-bit floats.
                    let mut packed = helpers::get_len_delimited(input)?;
                    if packed.len() % 4 != 0 {
                        return Err(DeserializeError);
                    }
                    while !packed.is_empty() {
                        let mut value = 0f32;
                        helpers::get_f32(&mut value, &mut packed)?;
                        self.content.push(value);
                    }
                }
                (3, helpers::WIRE_I32) => {
                    let mut value = 0f32;
                    helpers::get_f32(&mut value, input)?;
                    self.content.push(value);
                }
                (_, wire_type) => helpers::skip_field(wire_type, input)?,
            }
        }
        Ok(())
    }
}

/// Request of the matrix-operation procedure.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MatrixOpRequest {
    pub op: u32,
    pub args: Vec<Matrix>,
}

impl MatrixOpRequest {
    /// Procedure id this request schema is registered under.
    pub const PROC_ID: u32 = PROC_ID_MATRIX_OP;

    pub fn serialize_alloc(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if self.op != 0 {
            helpers::put_key(1, helpers::WIRE_VARINT, &mut buf);
            helpers::put_varint(u64::from(self.op), &mut buf);
        }
        for arg in &self.args {
            helpers::put_len_delimited(2, &arg.serialize_alloc(), &mut buf);
        }
        buf
    }

    pub fn deserialize(&mut self, input: &mut &[u8]) -> Result<(), DeserializeError> {
        while !input.is_empty() {
            let (field, wire_type) = helpers::get_key(input)?;
            match (field, wire_type) {
                (1, helpers::WIRE_VARINT) => {
                    let mut value = 0;
                    helpers::get_varint(&mut value, input)?;
                    self.op = value as u32;
                }
                (2, helpers::WIRE_LEN) => {
                    let mut sub = helpers::get_len_delimited(input)?;
                    let mut arg = Matrix::default();
                    arg.deserialize(&mut sub)?;
                    self.args.push(arg);
                }
                (_, wire_type) => helpers::skip_field(wire_type, input)?,
            }
        }
        Ok(())
    }
}

/// The two mutually exclusive arms of a [`MatrixOpResponse`].
#[derive(Debug, Clone, PartialEq)]
pub enum MatrixOpOutcome {
    Result(Matrix),
    Error(String),
}

/// Response of the matrix-operation procedure. A well-formed response
/// carries exactly one arm: the computed value or the calculation error.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MatrixOpResponse {
    pub outcome: Option<MatrixOpOutcome>,
}

impl MatrixOpResponse {
    /// Procedure id this response schema is registered under.
    pub const PROC_ID: u32 = PROC_ID_MATRIX_OP;

    pub fn result(&self) -> Option<&Matrix> {
        match &self.outcome {
            Some(MatrixOpOutcome::Result(matrix)) => Some(matrix),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            Some(MatrixOpOutcome::Error(text)) => Some(text),
            _ => None,
        }
    }

    pub fn serialize_alloc(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match &self.outcome {
            Some(MatrixOpOutcome::Result(matrix)) => {
                helpers::put_len_delimited(1, &matrix.serialize_alloc(), &mut buf);
            }
            Some(MatrixOpOutcome::Error(text)) => {
                helpers::put_len_delimited(2, text.as_bytes(), &mut buf);
            }
            None => {}
        }
        buf
    }

    pub fn deserialize(&mut self, input: &mut &[u8]) -> Result<(), DeserializeError> {
        while !input.is_empty() {
            let (field, wire_type) = helpers::get_key(input)?;
            match (field, wire_type) {
                // Oneof semantics: the arm decoded last wins.
                (1, helpers::WIRE_LEN) => {
                    let mut sub = helpers::get_len_delimited(input)?;
                    let mut matrix = Matrix::default();
                    matrix.deserialize(&mut sub)?;
                    self.outcome = Some(MatrixOpOutcome::Result(matrix));
                }
                (2, helpers::WIRE_LEN) => {
                    let bytes = helpers::get_len_delimited(input)?;
                    let text =
                        String::from_utf8(bytes.to_vec()).map_err(|_| DeserializeError)?;
                    self.outcome = Some(MatrixOpOutcome::Error(text));
                }
                (_, wire_type) => helpers::skip_field(wire_type, input)?,
            }
        }
        Ok(())
    }
}

pub mod helpers {
    //! Scalar encode/decode routines shared by the message bindings.

    /// Wire type of a varint-encoded scalar.
    pub const WIRE_VARINT: u8 = 0;
    /// Wire type of a fixed 64-bit value.
    pub const WIRE_I64: u8 = 1;
    /// Wire type of a length-delimited field.
    pub const WIRE_LEN: u8 = 2;
    /// Wire type of a fixed 32-bit value.
    pub const WIRE_I32: u8 = 5;

    #[derive(Debug)]
    pub struct DeserializeError;

    impl std::error::Error for DeserializeError {}

    impl std::fmt::Display for DeserializeError {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "Error deserializing data")
        }
    }

    pub fn get_varint(dst: &mut u64, input: &mut &[u8]) -> Result<(), DeserializeError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        let mut consumed = 0usize;
        loop {
            let Some(&byte) = input.get(consumed) else {
                return Err(DeserializeError);
            };
            consumed += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 64 {
                return Err(DeserializeError);
            }
        }
        *input = &input[consumed..];
        *dst = value;
        Ok(())
    }

    pub fn put_varint(mut value: u64, buf: &mut Vec<u8>) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                buf.push(byte);
                return;
            }
            buf.push(byte | 0x80);
        }
    }

    /// Reads a field key, returning the field number and wire type. Field
    /// number zero is illegal on the wire.
    pub fn get_key(input: &mut &[u8]) -> Result<(u32, u8), DeserializeError> {
        let mut key = 0;
        get_varint(&mut key, input)?;
        let field = (key >> 3) as u32;
        if field == 0 {
            return Err(DeserializeError);
        }
        Ok((field, (key & 0x7) as u8))
    }

    pub fn put_key(field: u32, wire_type: u8, buf: &mut Vec<u8>) {
        put_varint(u64::from(field) << 3 | u64::from(wire_type), buf);
    }

    /// Splits off the contents of a length-delimited field.
    pub fn get_len_delimited<'a>(input: &mut &'a [u8]) -> Result<&'a [u8], DeserializeError> {
        let mut length = 0;
        get_varint(&mut length, input)?;
        let length = usize::try_from(length).map_err(|_| DeserializeError)?;
        if input.len() < length {
            return Err(DeserializeError);
        }
        let (bytes, rest) = input.split_at(length);
        *input = rest;
        Ok(bytes)
    }

    pub fn put_len_delimited(field: u32, bytes: &[u8], buf: &mut Vec<u8>) {
        put_key(field, WIRE_LEN, buf);
        put_varint(bytes.len() as u64, buf);
        buf.extend_from_slice(bytes);
    }

    pub fn get_f32(dst: &mut f32, input: &mut &[u8]) -> Result<(), DeserializeError> {
        *dst = f32::from_le_bytes(take_fixed::<4>(input)?);
        Ok(())
    }

    /// Skips a field of an unrecognized number by its wire type.
    pub fn skip_field(wire_type: u8, input: &mut &[u8]) -> Result<(), DeserializeError> {
        match wire_type {
            WIRE_VARINT => {
                let mut scratch = 0;
                get_varint(&mut scratch, input)
            }
            WIRE_I64 => take_fixed::<8>(input).map(|_| ()),
            WIRE_LEN => get_len_delimited(input).map(|_| ()),
            WIRE_I32 => take_fixed::<4>(input).map(|_| ()),
            _ => Err(DeserializeError),
        }
    }

    fn take_fixed<const N: usize>(input: &mut &[u8]) -> Result<[u8; N], DeserializeError> {
        if input.len() < N {
            return Err(DeserializeError);
        }
        let (bytes, rest) = input.split_at(N);
        *input = rest;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }
}

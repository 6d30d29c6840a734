// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use matrix_service::proto::*;

#[test]
fn envelope_round_trip() {
    let payload = b"some opaque payload".to_vec();
    let bytes = encode_envelope(PROC_ID_MATRIX_OP, &payload);

    let (proc_id, decoded) = decode_envelope(&bytes).unwrap();
    assert_eq!(proc_id, PROC_ID_MATRIX_OP);
    assert_eq!(decoded, payload);
}

#[test]
fn envelope_wire_bytes() {
    // Field 1 varint (key 0x08), field 2 length-delimited (key 0x12).
    let bytes = encode_envelope(1, &[0xAA]);
    assert_eq!(bytes, [0x08, 0x01, 0x12, 0x01, 0xAA]);
}

#[test]
fn envelope_rejects_empty_input() {
    assert!(decode_envelope(&[]).is_err());
}

#[test]
fn envelope_rejects_truncation() {
    let bytes = encode_envelope(1, b"payload");
    assert!(decode_envelope(&bytes[..bytes.len() - 1]).is_err());
}

#[test]
fn matrix_wire_bytes_use_packed_floats() {
    let matrix = Matrix {
        rows: 1,
        columns: 2,
        content: vec![1.0, 2.0],
    };

    let mut expected = vec![0x08, 0x01, 0x10, 0x02, 0x1a, 0x08];
    expected.extend_from_slice(&1.0f32.to_le_bytes());
    expected.extend_from_slice(&2.0f32.to_le_bytes());
    assert_eq!(matrix.serialize_alloc(), expected);
}

#[test]
fn matrix_accepts_unpacked_floats() {
    // Field 3 as a fixed 32-bit value (key 0x1d) instead of a packed run.
    let mut bytes = vec![0x08, 0x02, 0x10, 0x01];
    bytes.push(0x1d);
    bytes.extend_from_slice(&3.0f32.to_le_bytes());
    bytes.push(0x1d);
    bytes.extend_from_slice(&4.0f32.to_le_bytes());

    let mut matrix = Matrix::default();
    let mut input = bytes.as_slice();
    matrix.deserialize(&mut input).unwrap();

    assert_eq!(matrix.rows, 2);
    assert_eq!(matrix.columns, 1);
    assert_eq!(matrix.content, [3.0, 4.0]);
}

#[test]
fn unknown_fields_are_skipped() {
    let mut bytes = encode_envelope(1, b"xy");
    // Field 15 varint, then field 14 length-delimited: both unknown to the
    // envelope and ignored.
    bytes.extend_from_slice(&[0x78, 0x2A]);
    bytes.extend_from_slice(&[0x72, 0x02, 0xFF, 0xFF]);

    let (proc_id, payload) = decode_envelope(&bytes).unwrap();
    assert_eq!(proc_id, 1);
    assert_eq!(payload, b"xy");
}

#[test]
fn request_round_trip() {
    let request = MatrixOpRequest {
        op: OP_MUL,
        args: vec![
            Matrix {
                rows: 2,
                columns: 2,
                content: vec![1.0, 2.0, 3.0, 4.0],
            },
            Matrix {
                rows: 2,
                columns: 1,
                content: vec![5.0, 6.0],
            },
        ],
    };

    let bytes = request.serialize_alloc();
    let mut after = MatrixOpRequest::default();
    let mut input = bytes.as_slice();
    after.deserialize(&mut input).unwrap();

    assert_eq!(request, after);
}

#[test]
fn response_oneof_arms() {
    let ok = MatrixOpResponse {
        outcome: Some(MatrixOpOutcome::Result(Matrix {
            rows: 1,
            columns: 1,
            content: vec![2.0],
        })),
    };
    let bytes = ok.serialize_alloc();
    let mut after = MatrixOpResponse::default();
    let mut input = bytes.as_slice();
    after.deserialize(&mut input).unwrap();
    assert_eq!(after.result().unwrap().content, [2.0]);
    assert!(after.error().is_none());

    let failed = MatrixOpResponse {
        outcome: Some(MatrixOpOutcome::Error("shape mismatch".into())),
    };
    let bytes = failed.serialize_alloc();
    let mut after = MatrixOpResponse::default();
    let mut input = bytes.as_slice();
    after.deserialize(&mut input).unwrap();
    assert_eq!(after.error(), Some("shape mismatch"));
    assert!(after.result().is_none());
}

#[test]
fn multi_byte_varint_lengths() {
    let payload = vec![0x5A; 300];
    let bytes = encode_envelope(1, &payload);

    let (proc_id, decoded) = decode_envelope(&bytes).unwrap();
    assert_eq!(proc_id, 1);
    assert_eq!(decoded, payload);
}

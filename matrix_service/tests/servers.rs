// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! End-to-end tests running each reactor on an ephemeral port and talking
//! to it over real TCP connections.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use matrix_service::proto::*;
use matrix_service::server::{
    Config, MtBlockingServer, Server, StBlockingServer, StNonblockingServer, StopHandle,
};

fn config(keepalive: bool, thread_limit: usize) -> Config {
    Config {
        address: "127.0.0.1".parse().unwrap(),
        port: 0,
        keepalive,
        thread_limit,
    }
}

struct Running {
    stop: StopHandle,
    done: mpsc::Receiver<Result<(), matrix_service::Error>>,
}

impl Running {
    /// Requests a stop and checks that run() returns cleanly and promptly.
    fn finish(self) {
        self.stop.stop();
        let result = self
            .done
            .recv_timeout(Duration::from_secs(5))
            .expect("server did not stop in time");
        result.expect("server run failed");
    }
}

fn start(mut server: impl Server + Send + 'static) -> Running {
    let stop = server.stop_handle();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(server.run());
    });
    Running { stop, done: rx }
}

fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).unwrap()
}

fn write_frame(stream: &mut TcpStream, bytes: &[u8]) {
    stream
        .write_all(&(bytes.len() as u32).to_ne_bytes())
        .unwrap();
    stream.write_all(bytes).unwrap();
}

fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).unwrap();
    let mut frame = vec![0u8; u32::from_ne_bytes(prefix) as usize];
    stream.read_exact(&mut frame).unwrap();
    frame
}

fn expect_closed(stream: &mut TcpStream) {
    let mut scratch = [0u8; 1];
    assert_eq!(stream.read(&mut scratch).unwrap(), 0);
}

fn matrix(rows: u32, columns: u32, content: &[f32]) -> Matrix {
    Matrix {
        rows,
        columns,
        content: content.to_vec(),
    }
}

fn mul_request(a: Matrix, b: Matrix) -> Vec<u8> {
    let request = MatrixOpRequest {
        op: OP_MUL,
        args: vec![a, b],
    };
    encode_envelope(PROC_ID_MATRIX_OP, &request.serialize_alloc())
}

fn parse_mul_response(frame: &[u8]) -> MatrixOpResponse {
    let (proc_id, payload) = decode_envelope(frame).unwrap();
    assert_eq!(proc_id, PROC_ID_MATRIX_OP);

    let mut response = MatrixOpResponse::default();
    let mut input = payload.as_slice();
    response.deserialize(&mut input).unwrap();
    response
}

/// The protocol scenarios every reactor must pass, driven over separate
/// connections against a keepalive server.
fn exercise_protocol(addr: SocketAddr) {
    // Junk bytes: a diagnostic envelope comes back and the connection dies.
    {
        let mut client = connect(addr);
        write_frame(&mut client, b"qqq");

        let frame = read_frame(&mut client);
        let (proc_id, payload) = decode_envelope(&frame).unwrap();
        assert_eq!(proc_id, PROC_ID_INVALID);
        assert_eq!(payload, b"Corrupted matrix_service::Procedure protobuf!");
        expect_closed(&mut client);
    }

    // Unknown procedure id.
    {
        let mut client = connect(addr);
        write_frame(&mut client, &encode_envelope(PROC_ID_MATRIX_OP + 1, &[]));

        let frame = read_frame(&mut client);
        let (proc_id, payload) = decode_envelope(&frame).unwrap();
        assert_eq!(proc_id, PROC_ID_INVALID);
        assert_eq!(payload, b"Unknown ProcedureId: 2");
        expect_closed(&mut client);
    }

    // 1x1 by 1x1.
    {
        let mut client = connect(addr);
        write_frame(
            &mut client,
            &mul_request(matrix(1, 1, &[1.0]), matrix(1, 1, &[2.0])),
        );

        let response = parse_mul_response(&read_frame(&mut client));
        let result = response.result().unwrap();
        assert_eq!((result.rows, result.columns), (1, 1));
        assert_eq!(result.content, [2.0]);
    }

    // 2x2 by 2x2.
    {
        let mut client = connect(addr);
        let a = matrix(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        write_frame(&mut client, &mul_request(a.clone(), a));

        let response = parse_mul_response(&read_frame(&mut client));
        let result = response.result().unwrap();
        assert_eq!((result.rows, result.columns), (2, 2));
        assert_eq!(result.content, [7.0, 10.0, 15.0, 22.0]);
    }

    // Incompatible shapes: a domain error inside a succesful envelope.
    {
        let mut client = connect(addr);
        write_frame(
            &mut client,
            &mul_request(matrix(1, 1, &[1.0]), matrix(2, 1, &[2.0, 2.0])),
        );

        let response = parse_mul_response(&read_frame(&mut client));
        assert!(response.error().is_some());
        assert!(response.result().is_none());
    }

    // A zero-length frame is a no-op: the next real request on the same
    // connection gets the first response.
    {
        let mut client = connect(addr);
        client.write_all(&0u32.to_ne_bytes()).unwrap();
        write_frame(
            &mut client,
            &mul_request(matrix(1, 1, &[3.0]), matrix(1, 1, &[4.0])),
        );

        let response = parse_mul_response(&read_frame(&mut client));
        assert_eq!(response.result().unwrap().content, [12.0]);
    }
}

#[test]
fn st_blocking_protocol() {
    let server = StBlockingServer::new(config(true, 4)).unwrap();
    let addr = server.local_addr().unwrap();
    let running = start(server);

    exercise_protocol(addr);
    running.finish();
}

#[test]
fn mt_blocking_protocol() {
    let server = MtBlockingServer::new(config(true, 4)).unwrap();
    let addr = server.local_addr().unwrap();
    let running = start(server);

    exercise_protocol(addr);
    running.finish();
}

#[test]
fn st_nonblocking_protocol() {
    let server = StNonblockingServer::new(config(true, 4)).unwrap();
    let addr = server.local_addr().unwrap();
    let running = start(server);

    exercise_protocol(addr);
    running.finish();
}

#[test]
fn keepalive_reuses_the_connection() {
    let server = StBlockingServer::new(config(true, 4)).unwrap();
    let addr = server.local_addr().unwrap();
    let running = start(server);

    let mut client = connect(addr);
    for factor in [2.0f32, 3.0] {
        write_frame(
            &mut client,
            &mul_request(matrix(1, 1, &[factor]), matrix(1, 1, &[5.0])),
        );
        let response = parse_mul_response(&read_frame(&mut client));
        assert_eq!(response.result().unwrap().content, [factor * 5.0]);
    }

    drop(client);
    running.finish();
}

#[test]
fn without_keepalive_the_connection_closes() {
    let server = StBlockingServer::new(config(false, 4)).unwrap();
    let addr = server.local_addr().unwrap();
    let running = start(server);

    let mut client = connect(addr);
    write_frame(
        &mut client,
        &mul_request(matrix(1, 1, &[1.0]), matrix(1, 1, &[2.0])),
    );
    let response = parse_mul_response(&read_frame(&mut client));
    assert!(response.result().is_some());
    expect_closed(&mut client);

    running.finish();
}

#[test]
fn mt_blocking_bounds_the_pool() {
    let server = MtBlockingServer::new(config(true, 4)).unwrap();
    let addr = server.local_addr().unwrap();
    let running = start(server);

    // Four keepalive clients pin all four worker slots.
    let mut holders = Vec::new();
    for i in 0..4 {
        let mut client = connect(addr);
        write_frame(
            &mut client,
            &mul_request(matrix(1, 1, &[i as f32]), matrix(1, 1, &[2.0])),
        );
        let response = parse_mul_response(&read_frame(&mut client));
        assert_eq!(response.result().unwrap().content, [i as f32 * 2.0]);
        holders.push(client);
    }

    // A fifth client queues in the kernel backlog until a slot frees.
    let mut fifth = connect(addr);
    write_frame(
        &mut fifth,
        &mul_request(matrix(1, 1, &[10.0]), matrix(1, 1, &[2.0])),
    );
    thread::sleep(Duration::from_millis(100));

    drop(holders.remove(0));

    let response = parse_mul_response(&read_frame(&mut fifth));
    assert_eq!(response.result().unwrap().content, [20.0]);

    drop(holders);
    drop(fifth);
    running.finish();
}

#[test]
fn st_nonblocking_interleaves_clients() {
    let server = StNonblockingServer::new(config(true, 4)).unwrap();
    let addr = server.local_addr().unwrap();
    let running = start(server);

    let mut slow = connect(addr);
    let mut fast = connect(addr);

    // Send only half of the slow client's request.
    let slow_request = mul_request(matrix(1, 1, &[6.0]), matrix(1, 1, &[7.0]));
    slow.write_all(&(slow_request.len() as u32).to_ne_bytes())
        .unwrap();
    slow.write_all(&slow_request[..slow_request.len() / 2])
        .unwrap();

    // The fast client gets served while the slow request is stalled.
    write_frame(
        &mut fast,
        &mul_request(matrix(1, 1, &[2.0]), matrix(1, 1, &[3.0])),
    );
    let response = parse_mul_response(&read_frame(&mut fast));
    assert_eq!(response.result().unwrap().content, [6.0]);

    // Completing the slow request gets it answered too.
    slow.write_all(&slow_request[slow_request.len() / 2..])
        .unwrap();
    let response = parse_mul_response(&read_frame(&mut slow));
    assert_eq!(response.result().unwrap().content, [42.0]);

    drop(slow);
    drop(fast);
    running.finish();
}

/// Stop must interrupt a reactor that is blocked on an idle keepalive
/// client, not just one parked in accept.
#[test]
fn stop_interrupts_an_idle_connection() {
    let st = StBlockingServer::new(config(true, 4)).unwrap();
    let st_addr = st.local_addr().unwrap();
    let mt = MtBlockingServer::new(config(true, 4)).unwrap();
    let mt_addr = mt.local_addr().unwrap();
    let nb = StNonblockingServer::new(config(true, 4)).unwrap();
    let nb_addr = nb.local_addr().unwrap();

    for (addr, running) in [
        (st_addr, start(st)),
        (mt_addr, start(mt)),
        (nb_addr, start(nb)),
    ] {
        let mut client = connect(addr);
        write_frame(
            &mut client,
            &mul_request(matrix(1, 1, &[1.0]), matrix(1, 1, &[1.0])),
        );
        let response = parse_mul_response(&read_frame(&mut client));
        assert!(response.result().is_some());

        // The connection is idle now; the server is blocked waiting on it.
        running.finish();
        expect_closed(&mut client);
    }
}

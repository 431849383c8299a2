//! A minimal, single-purpose HTTP/1.1 mock server for scenario tests.
//!
//! No mocking crate is in the dependency stack, so this speaks just enough
//! HTTP to drive the request engine: it reads one request, ignores the
//! body framing details beyond finding the blank line, and writes back a
//! fixed status with an empty body. Good enough for status-sequence tests,
//! not a general-purpose server.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::JoinHandle;

/// Starts a server bound to an ephemeral port that serves `statuses` in
/// order, one per accepted connection, then stops accepting. Returns the
/// base URL (e.g. `http://127.0.0.1:54321`) and a join handle.
pub fn start_sequenced_server(statuses: Vec<u16>) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
    let addr = listener.local_addr().expect("local_addr");
    let url = format!("http://{addr}");

    let handle = std::thread::spawn(move || {
        for status in statuses {
            match listener.accept() {
                Ok((stream, _)) => serve_one(stream, status),
                Err(_) => return,
            }
        }
    });

    (url, handle)
}

fn serve_one(mut stream: TcpStream, status: u16) {
    let mut buf = [0u8; 4096];
    // Best-effort read of the request; we don't need to parse it, just drain
    // enough that the client isn't blocked waiting on us to read.
    let _ = stream.read(&mut buf);

    let reason = reason_phrase(status);
    let body = "ok";
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.flush();
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

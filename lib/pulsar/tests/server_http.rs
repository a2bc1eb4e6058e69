//! End-to-end tests driving a running server over real sockets with a
//! blocking client.

use lumen::logging::{o, Discard, Logger};
use pulsar::http::server::{HttpServer, ServerConfig, StopHandle};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Builds a server in its own thread (the reactor is single-threaded and not
/// `Send`) and hands back the listen address plus a stop handle.
fn start_server<F>(setup: F) -> (SocketAddr, StopHandle, thread::JoinHandle<()>)
where
    F: FnOnce(&HttpServer) + Send + 'static,
{
    let (tx, rx) = mpsc::channel();

    let handle = thread::spawn(move || {
        let log = Logger::root(Discard, o!());
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        let server = HttpServer::new(config, &log).expect("server must start");

        setup(&server);

        tx.send((server.local_addr(), server.stop_handle())).unwrap();
        server.run().expect("reactor must exit cleanly");
    });

    let (addr, stop) = rx.recv().unwrap();
    (addr, stop, handle)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect must succeed");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Reads one response: the head up to the blank line, then exactly
/// `Content-Length` body bytes.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        let count = stream.read(&mut byte).expect("read must not time out");
        assert_ne!(count, 0, "unexpected EOF while reading response head");
        head.push(byte[0]);
    }

    let head = String::from_utf8(head).unwrap();
    let length = head
        .lines()
        .find_map(|line| {
            let mut parts = line.splitn(2, ':');
            match parts.next()?.eq_ignore_ascii_case("content-length") {
                true => parts.next()?.trim().parse::<usize>().ok(),
                false => None,
            }
        })
        .expect("response must carry Content-Length");

    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

fn finish(stop: StopHandle, handle: thread::JoinHandle<()>) {
    stop.stop();
    handle.join().unwrap();
}

#[test]
fn test_bare_get_yields_404() {
    let (addr, stop, handle) = start_server(|_server| {});

    let mut client = connect(addr);
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();

    let (head, body) = read_response(&mut client);
    assert!(head.starts_with("HTTP/1.1 404, Not Found\r\n"));
    assert!(head.contains("Content-Length: 0\r\n"));
    assert!(head.contains("Date: "));
    assert!(body.is_empty());

    finish(stop, handle);
}

#[test]
fn test_sequential_requests_on_one_connection() {
    let (addr, stop, handle) = start_server(|_server| {});

    let mut client = connect(addr);
    client.write_all(b"GET / HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\n\r\n").unwrap();

    let (first, _) = read_response(&mut client);
    let (second, _) = read_response(&mut client);
    assert!(first.starts_with("HTTP/1.1 404, Not Found\r\n"));
    assert!(second.starts_with("HTTP/1.1 404, Not Found\r\n"));

    finish(stop, handle);
}

#[test]
fn test_connection_close_ends_with_eof() {
    let (addr, stop, handle) = start_server(|_server| {});

    let mut client = connect(addr);
    client
        .write_all(b"GET / HTTP/1.1\r\nconnection:    close   \r\n\r\n")
        .unwrap();

    let (head, _) = read_response(&mut client);
    assert!(head.starts_with("HTTP/1.1 404, Not Found\r\n"));
    assert!(head.contains("Connection: close\r\n"));

    let mut rest = Vec::new();
    let count = client.read_to_end(&mut rest).unwrap();
    assert_eq!(count, 0, "peer must observe EOF after Connection: close");

    finish(stop, handle);
}

#[test]
fn test_http10_keep_alive_then_close() {
    let (addr, stop, handle) = start_server(|_server| {});

    let mut client = connect(addr);
    client
        .write_all(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n")
        .unwrap();

    let (head, _) = read_response(&mut client);
    assert!(head.starts_with("HTTP/1.0 404, Not Found\r\n"));
    assert!(head.contains("Content-Length: 0\r\n"));
    assert!(head.contains("Connection: Keep-Alive\r\n"));

    // The next HTTP/1.0 request omits Keep-Alive: close plus EOF.
    client.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut client);
    assert!(head.contains("Connection: close\r\n"));

    let mut rest = Vec::new();
    assert_eq!(client.read_to_end(&mut rest).unwrap(), 0);

    finish(stop, handle);
}

#[test]
fn test_routed_get_and_post_echo() {
    let (addr, stop, handle) = start_server(|server| {
        server.route("/hello", |_request, writer| {
            writer.write_str("hello from the server");
        });
        server.route("/echo", |request, writer| {
            writer.write(&request.body);
        });
    });

    let mut client = connect(addr);
    client.write_all(b"GET /hello HTTP/1.1\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut client);
    assert!(head.starts_with("HTTP/1.1 200, OK\r\n"));
    assert_eq!(body, b"hello from the server");

    client
        .write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 9\r\n\r\necho this")
        .unwrap();
    let (head, body) = read_response(&mut client);
    assert!(head.starts_with("HTTP/1.1 200, OK\r\n"));
    assert_eq!(body, b"echo this");

    finish(stop, handle);
}

#[test]
fn test_header_continuation_is_folded() {
    let (addr, stop, handle) = start_server(|server| {
        server.route("/headers", |request, writer| {
            let value = request.headers.get("Hello").unwrap_or("missing");
            writer.write_str(value);
        });
    });

    let mut client = connect(addr);
    client
        .write_all(b"GET /headers HTTP/1.1\r\nhello: world\r\n hid!\r\n\r\n")
        .unwrap();

    let (_, body) = read_response(&mut client);
    assert_eq!(body, b"world hid!");

    finish(stop, handle);
}

#[test]
fn test_request_arrives_byte_by_byte() {
    let (addr, stop, handle) = start_server(|_server| {});

    let mut client = connect(addr);
    for byte in b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n" {
        client.write_all(&[*byte]).unwrap();
        client.flush().unwrap();
    }

    let (head, _) = read_response(&mut client);
    assert!(head.starts_with("HTTP/1.1 404, Not Found\r\n"));

    finish(stop, handle);
}

#[test]
fn test_unknown_method_is_501() {
    let (addr, stop, handle) = start_server(|_server| {});

    let mut client = connect(addr);
    client.write_all(b"BREW /tea HTTP/1.1\r\n\r\n").unwrap();

    let (head, _) = read_response(&mut client);
    assert!(head.starts_with("HTTP/1.1 501, Not Implemented\r\n"));

    finish(stop, handle);
}

#[test]
fn test_stop_closes_live_connections() {
    let (addr, stop, handle) = start_server(|_server| {});

    // Idle connection: no request in flight.
    let mut client = connect(addr);
    thread::sleep(Duration::from_millis(100));

    stop.stop();
    handle.join().unwrap();

    let mut rest = Vec::new();
    let _ = client.read_to_end(&mut rest);
    assert!(rest.is_empty());
}

//! End-to-end tests of the HTTP pipeline over the TLS transport, using a
//! blocking rustls client against a self-signed server certificate.

use lumen::logging::{o, Discard, Logger};
use pulsar::http::server::{HttpServer, ServerConfig, StopHandle};
use pulsar::tls::rustls::TlsConfig;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ClientConnection, ServerName};
use std::convert::TryFrom;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, SystemTime};

struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn start_tls_server<F>(setup: F) -> (SocketAddr, StopHandle, thread::JoinHandle<()>)
where
    F: FnOnce(&HttpServer) + Send + 'static,
{
    let (tx, rx) = mpsc::channel();

    let handle = thread::spawn(move || {
        let log = Logger::root(Discard, o!());

        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let tls = TlsConfig::from_der(
            vec![cert.serialize_der().unwrap()],
            cert.serialize_private_key_der(),
        )
        .unwrap();

        let mut config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        config.tls = Some(tls);

        let server = HttpServer::new(config, &log).expect("server must start");
        setup(&server);

        tx.send((server.local_addr(), server.stop_handle())).unwrap();
        server.run().expect("reactor must exit cleanly");
    });

    let (addr, stop) = rx.recv().unwrap();
    (addr, stop, handle)
}

fn tls_client(addr: SocketAddr) -> (ClientConnection, TcpStream) {
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    let name = ServerName::try_from("localhost").unwrap();
    let session = ClientConnection::new(Arc::new(config), name).unwrap();

    let tcp = TcpStream::connect(addr).unwrap();
    tcp.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    (session, tcp)
}

fn read_response<R: Read>(stream: &mut R) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        let count = stream.read(&mut byte).expect("read must succeed");
        assert_ne!(count, 0, "unexpected EOF in response head");
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

#[test]
fn test_get_over_tls() {
    let (addr, stop, handle) = start_tls_server(|server| {
        server.route("/secure", |_request, writer| {
            writer.write_str("tls says hi");
        });
    });

    let (mut session, mut tcp) = tls_client(addr);
    let mut stream = rustls::Stream::new(&mut session, &mut tcp);

    stream.write_all(b"GET /secure HTTP/1.1\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200, OK\r\n"));
    assert_eq!(body, b"tls says hi");

    stop.stop();
    handle.join().unwrap();
}

#[test]
fn test_keep_alive_over_tls() {
    let (addr, stop, handle) = start_tls_server(|server| {
        server.route("/echo", |request, writer| {
            writer.write(&request.body);
        });
    });

    let (mut session, mut tcp) = tls_client(addr);
    let mut stream = rustls::Stream::new(&mut session, &mut tcp);

    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404, Not Found\r\n"));

    stream
        .write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 10\r\n\r\nover-tls!!")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200, OK\r\n"));
    assert_eq!(body, b"over-tls!!");

    stop.stop();
    handle.join().unwrap();
}

#[test]
fn test_connection_close_over_tls() {
    let (addr, stop, handle) = start_tls_server(|_server| {});

    let (mut session, mut tcp) = tls_client(addr);
    let mut stream = rustls::Stream::new(&mut session, &mut tcp);

    stream
        .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();

    let (head, _) = read_response(&mut stream);
    assert!(head.contains("Connection: close\r\n"));

    // The server runs the close handshake and the socket reaches EOF.
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);
    assert!(rest.is_empty());

    stop.stop();
    handle.join().unwrap();
}

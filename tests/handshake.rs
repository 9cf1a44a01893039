use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::spawn;

use wspacket::{Error, Server};

const UPGRADE_REQUEST: &[u8] = b"\
    GET / HTTP/1.1\r\n\
    Host: x\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Version: 13\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    \r\n";

fn read_response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).unwrap() == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[test]
fn valid_upgrade_switches_protocols() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new();
    let serving = {
        let server = server.clone();
        spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            server.serve(stream)
        })
    };

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(UPGRADE_REQUEST).unwrap();

    let head = read_response_head(&mut stream);
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(head.contains("Upgrade: websocket\r\n"));
    assert!(head.contains("Connection: Upgrade\r\n"));
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

    let id = serving.join().unwrap().unwrap();
    assert!(id > 0);
    assert_eq!(server.len(), 1);
    assert_eq!(server.session(id).unwrap().id(), id);
}

#[test]
fn bad_version_is_rejected_with_404() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new();
    let serving = spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        server.serve(stream)
    });

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(
            b"GET / HTTP/1.1\r\n\
              Host: x\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Version: 8\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              \r\n",
        )
        .unwrap();

    let head = read_response_head(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(serving.join().unwrap().is_err());
}

#[test]
fn handshake_check_can_reject_for_application_reasons() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new();
    server.set_handshake_check(|request| {
        if request.headers().contains_key("Authorization") {
            Ok(())
        } else {
            Err("authorization required".into())
        }
    });
    let serving = spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        server.serve(stream)
    });

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(UPGRADE_REQUEST).unwrap();

    let head = read_response_head(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));

    let mut body = String::new();
    stream.read_to_string(&mut body).unwrap();
    assert!(body.contains("authorization required"));
    assert!(matches!(
        serving.join().unwrap(),
        Err(Error::HandshakeRejected(_))
    ));
}

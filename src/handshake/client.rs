//! Client side of the upgrade handshake.

use std::io::Read;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, UPGRADE};
use http::{HeaderMap, Response, StatusCode};
use httparse::Status;
use log::trace;
use url::Url;

use super::{convert_key, header_contains, MAX_HEADERS};
use crate::error::{CapacityError, Error, ProtocolError, Result};

/// Upper bound for the handshake response head.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Generate a random key for the `Sec-WebSocket-Key` header.
pub fn generate_key() -> String {
    // a base64-encoded (see Section 4 of [RFC4648]) value that,
    // when decoded, is 16 bytes in length (RFC 6455)
    let r: [u8; 16] = rand::random();
    BASE64.encode(r)
}

/// Build the upgrade request for the given URL, with the caller's extra
/// headers appended after the required ones.
pub fn build_request(url: &Url, key: &str, extra_headers: &HeaderMap) -> Vec<u8> {
    let mut request = format!(
        "\
         GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {key}\r\n",
        path = request_path(url),
        host = request_host(url),
        key = key,
    );
    for (name, value) in extra_headers {
        if let Ok(value) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }
    }
    request.push_str("\r\n");
    request.into_bytes()
}

/// The GET part of the request.
fn request_path(url: &Url) -> String {
    if let Some(query) = url.query() {
        format!("{}?{}", url.path(), query)
    } else {
        url.path().to_string()
    }
}

/// The Host: part of the request.
fn request_host(url: &Url) -> String {
    let host = url.host_str().expect("Bug: URL without host");
    if let Some(port) = url.port() {
        format!("{}:{}", host, port)
    } else {
        host.to_string()
    }
}

/// Read and parse the handshake response head. Returns the response and any
/// bytes read past it; those belong to the frame layer.
pub fn read_response(stream: &mut impl Read) -> Result<(Response<()>, Vec<u8>)> {
    trace!("Performing client handshake...");
    let mut buf = Vec::with_capacity(1024);
    loop {
        if buf.len() >= MAX_RESPONSE_HEAD {
            return Err(Error::Capacity(CapacityError::HeaderTooLong));
        }
        let mut chunk = [0u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            return Err(Error::Protocol(ProtocolError::HandshakeIncomplete));
        }
        buf.extend_from_slice(&chunk[..read]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf)? {
            Status::Complete(size) => {
                let parsed = from_httparse(response)?;
                return Ok((parsed, buf[size..].to_vec()));
            }
            Status::Partial => continue,
        }
    }
}

fn from_httparse(raw: httparse::Response<'_, '_>) -> Result<Response<()>> {
    if raw.version.expect("Bug: no HTTP version in parsed response") < /*1.*/1 {
        return Err(Error::Protocol(ProtocolError::WrongHttpVersion));
    }
    let mut builder = Response::builder()
        .status(raw.code.expect("Bug: no status code in parsed response"))
        .version(http::Version::HTTP_11);
    for header in raw.headers.iter() {
        builder = builder.header(header.name, header.value);
    }
    builder.body(()).map_err(Error::from)
}

/// Verify the server's reply against the key we sent: the status must be
/// 101, `Upgrade`/`Connection` must match case-insensitively and
/// `Sec-WebSocket-Accept` must equal the expected accept key.
pub fn verify_response(response: &Response<()>, key: &str) -> Result<()> {
    // 1. If the status code received from the server is not 101, the
    // client handles the response per HTTP [RFC2616] procedures. (RFC 6455)
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(Error::Http(response.status().as_u16()));
    }
    // 2. If the response lacks an |Upgrade| header field or the |Upgrade|
    // header field contains a value that is not an ASCII case-
    // insensitive match for the value "websocket", the client MUST
    // _Fail the WebSocket Connection_. (RFC 6455)
    if !header_contains(response.headers(), UPGRADE, "websocket") {
        return Err(Error::Protocol(ProtocolError::MissingUpgradeWebSocketHeader));
    }
    // 3. If the response lacks a |Connection| header field or the
    // |Connection| header field doesn't contain a token that is an
    // ASCII case-insensitive match for the value "Upgrade", the client
    // MUST _Fail the WebSocket Connection_. (RFC 6455)
    if !header_contains(response.headers(), CONNECTION, "upgrade") {
        return Err(Error::Protocol(ProtocolError::MissingConnectionUpgradeHeader));
    }
    // 4. If the response lacks a |Sec-WebSocket-Accept| header field or
    // the |Sec-WebSocket-Accept| contains a value other than the
    // base64-encoded SHA-1 of ... the client MUST _Fail the WebSocket
    // Connection_. (RFC 6455)
    let accept_ok = response
        .headers()
        .get(SEC_WEBSOCKET_ACCEPT)
        .map(|value| value.as_bytes() == convert_key(key.as_bytes()).as_bytes())
        .unwrap_or(false);
    if !accept_ok {
        return Err(Error::Protocol(ProtocolError::SecWebSocketAcceptKeyMismatch));
    }
    Ok(())
}

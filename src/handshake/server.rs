//! Server side of the upgrade handshake.

use std::io::{Read, Write};

use http::header::{CONNECTION, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE};
use http::Request;
use httparse::Status;
use log::{debug, trace};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use super::{convert_key, header_contains, MAX_HEADERS};
use crate::error::{CapacityError, Error, ProtocolError, Result};

/// Upper bound for the upgrade request head.
const MAX_REQUEST_HEAD: usize = 16 * 1024;

/// Read and parse an upgrade request from the stream. Returns the request
/// and any bytes read past the request head; those belong to the frame
/// layer and must be replayed ahead of the stream.
pub fn read_request(stream: &mut impl Read) -> Result<(Request<()>, Vec<u8>)> {
    trace!("Server handshake initiated.");
    let mut buf = Vec::with_capacity(1024);
    loop {
        if buf.len() >= MAX_REQUEST_HEAD {
            return Err(Error::Capacity(CapacityError::HeaderTooLong));
        }
        let mut chunk = [0u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            return Err(Error::Protocol(ProtocolError::HandshakeIncomplete));
        }
        buf.extend_from_slice(&chunk[..read]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buf)? {
            Status::Complete(size) => {
                let parsed = from_httparse(request)?;
                return Ok((parsed, buf[size..].to_vec()));
            }
            Status::Partial => continue,
        }
    }
}

fn from_httparse(raw: httparse::Request<'_, '_>) -> Result<Request<()>> {
    if raw.version.expect("Bug: no HTTP version in parsed request") < /*1.*/1 {
        return Err(Error::Protocol(ProtocolError::WrongHttpVersion));
    }
    let mut builder = Request::builder()
        .method(raw.method.expect("Bug: no method in parsed request"))
        .uri(raw.path.expect("Bug: no path in parsed request"))
        .version(http::Version::HTTP_11);
    for header in raw.headers.iter() {
        builder = builder.header(header.name, header.value);
    }
    builder.body(()).map_err(Error::from)
}

/// Validate the upgrade request: the method must be GET, `Connection` must
/// carry the `upgrade` token, `Upgrade` must carry `websocket`,
/// `Sec-WebSocket-Version` must be 13 and `Sec-WebSocket-Key` must decode
/// to exactly 16 bytes.
pub fn validate_upgrade(request: &Request<()>) -> Result<()> {
    if request.method() != http::Method::GET {
        return Err(Error::Protocol(ProtocolError::WrongHttpMethod));
    }
    if !header_contains(request.headers(), CONNECTION, "upgrade") {
        return Err(Error::Protocol(ProtocolError::MissingConnectionUpgradeHeader));
    }
    if !header_contains(request.headers(), UPGRADE, "websocket") {
        return Err(Error::Protocol(ProtocolError::MissingUpgradeWebSocketHeader));
    }
    let version_ok = request
        .headers()
        .get_all(SEC_WEBSOCKET_VERSION)
        .iter()
        .any(|value| value.to_str().map(|v| v.trim() == "13").unwrap_or(false));
    if !version_ok {
        return Err(Error::Protocol(ProtocolError::MissingSecWebSocketVersionHeader));
    }
    let key_ok = request
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .and_then(|value| value.to_str().ok())
        .map(|key| {
            BASE64
                .decode(key.trim())
                .map(|decoded| decoded.len() == 16)
                .unwrap_or(false)
        })
        .unwrap_or(false);
    if !key_ok {
        return Err(Error::Protocol(ProtocolError::InvalidSecWebSocketKey));
    }
    Ok(())
}

/// Build the 101 reply to a validated upgrade request.
pub fn accept_response(request: &Request<()>) -> Result<Vec<u8>> {
    let key = request
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .ok_or(Error::Protocol(ProtocolError::InvalidSecWebSocketKey))?;
    let reply = format!(
        "\
         HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        convert_key(key.as_bytes())
    );
    Ok(reply.into_bytes())
}

/// Build the 404 reply naming the check that failed.
pub fn reject_response(reason: &str) -> Vec<u8> {
    let body = format!("{}\n", reason);
    format!(
        "\
         HTTP/1.1 404 Not Found\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        body.len(),
        body
    )
    .into_bytes()
}

/// Write the 404 reply to the stream.
pub fn write_rejection(stream: &mut impl Write, reason: &str) -> Result<()> {
    debug!("Server handshake failed: {}", reason);
    stream.write_all(&reject_response(reason))?;
    Ok(())
}

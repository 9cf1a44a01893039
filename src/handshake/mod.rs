//! HTTP/1.1 upgrade handshake for both endpoint roles.

pub mod client;
pub mod server;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::header::HeaderName;
use http::HeaderMap;
use sha1::{Digest, Sha1};

// Limit the number of header lines.
pub(crate) const MAX_HEADERS: usize = 124;

/// Turn a Sec-WebSocket-Key into a Sec-WebSocket-Accept.
pub fn convert_key(input: &[u8]) -> String {
    // ... field is constructed by concatenating /key/ ...
    // ... with the string "258EAFA5-E914-47DA-95CA-C5AB0DC85B11" (RFC 6455)
    const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
    let mut sha1 = Sha1::new();
    sha1.update(input);
    sha1.update(WS_GUID);
    BASE64.encode(sha1.finalize())
}

/// Check whether any value of the named header contains the given token,
/// case-insensitively. `token` must be lowercase.
pub(crate) fn header_contains(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|value| value.to_ascii_lowercase().contains(token))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONNECTION, UPGRADE};

    #[test]
    fn key_conversion() {
        // example from RFC 6455
        assert_eq!(
            convert_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn header_token_matching() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, "keep-alive, Upgrade".parse().unwrap());
        headers.insert(UPGRADE, "WebSocket".parse().unwrap());

        assert!(header_contains(&headers, CONNECTION, "upgrade"));
        assert!(header_contains(&headers, UPGRADE, "websocket"));
        assert!(!header_contains(&headers, UPGRADE, "h2c"));
    }
}

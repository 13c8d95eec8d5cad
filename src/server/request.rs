//! First-request parsing and protocol classification
//!
//! Every connection starts with one plaintext HTTP request inside the TLS
//! session. The head is read once, bounded, and classified: a WebSocket
//! upgrade goes to the frame loop, anything else to the static responder.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProtocolError;

/// Parsed request line plus headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse a complete request head (everything before the blank line).
    pub fn parse(head: &str) -> Result<Self, ProtocolError> {
        let mut lines = head.split("\r\n");

        let request_line = lines.next().ok_or(ProtocolError::BadRequest)?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or(ProtocolError::BadRequest)?.to_string();
        let path = parts.next().ok_or(ProtocolError::BadRequest)?.to_string();
        if parts.next().is_none() {
            // HTTP version missing
            return Err(ProtocolError::BadRequest);
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').ok_or(ProtocolError::BadRequest)?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method,
            path,
            headers,
        })
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The client's WebSocket nonce, when present and non-empty.
    pub fn websocket_key(&self) -> Option<&str> {
        self.header("Sec-WebSocket-Key").filter(|k| !k.is_empty())
    }

    /// A request is a WebSocket upgrade iff all three hold:
    /// `Upgrade: websocket`, `Connection` containing the `upgrade` token,
    /// and a non-empty `Sec-WebSocket-Key`.
    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade_ok = self
            .header("Upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);

        let connection_ok = self
            .header("Connection")
            .map(|v| {
                v.split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
            })
            .unwrap_or(false);

        upgrade_ok && connection_ok && self.websocket_key().is_some()
    }
}

/// Read the request head from the decrypted stream, up to `max` bytes.
///
/// Returns the head text and any extra bytes that arrived after the blank
/// line; the WebSocket branch must not lose those.
pub async fn read_request_head<R>(
    stream: &mut R,
    max: usize,
) -> Result<(String, Vec<u8>), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(end) = find_head_end(&buf) {
            let head = String::from_utf8_lossy(&buf[..end]).into_owned();
            let rest = buf.split_off(end + 4);
            return Ok((head, rest));
        }
        if buf.len() >= max {
            return Err(ProtocolError::RequestTooLarge(max));
        }

        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|_| ProtocolError::TruncatedRequest)?;
        if n == 0 {
            return Err(ProtocolError::TruncatedRequest);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(extra_headers: &str) -> String {
        format!("GET / HTTP/1.1\r\nHost: kvm.local\r\n{extra_headers}\r\n")
    }

    const UPGRADE: &str = "Upgrade: websocket\r\n";
    const CONNECTION: &str = "Connection: Upgrade\r\n";
    const KEY: &str = "Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n";

    #[test]
    fn test_parse_request_line() {
        let head = RequestHead::parse("GET /style.css HTTP/1.1\r\nHost: x\r\n").unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/style.css");
        assert_eq!(head.header("host"), Some("x"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(RequestHead::parse("").is_err());
        assert!(RequestHead::parse("GET").is_err());
        assert!(RequestHead::parse("GET /\r\n").is_err());
        assert!(RequestHead::parse("GET / HTTP/1.1\r\nbroken header line\r\n").is_err());
    }

    #[test]
    fn test_upgrade_requires_all_three_headers() {
        // All 2^3 combinations; only the full set classifies as an upgrade.
        for mask in 0u8..8 {
            let mut headers = String::new();
            if mask & 1 != 0 {
                headers.push_str(UPGRADE);
            }
            if mask & 2 != 0 {
                headers.push_str(CONNECTION);
            }
            if mask & 4 != 0 {
                headers.push_str(KEY);
            }
            let head = RequestHead::parse(&request(&headers)).unwrap();
            assert_eq!(
                head.is_websocket_upgrade(),
                mask == 7,
                "header mask {mask:03b}"
            );
        }
    }

    #[test]
    fn test_upgrade_headers_case_insensitive() {
        let head = RequestHead::parse(&request(
            "upgrade: WebSocket\r\nCONNECTION: upgrade\r\nsec-websocket-key: abc123==\r\n",
        ))
        .unwrap();
        assert!(head.is_websocket_upgrade());
        assert_eq!(head.websocket_key(), Some("abc123=="));
    }

    #[test]
    fn test_connection_header_token_list() {
        // Browsers send `Connection: keep-alive, Upgrade`.
        let head = RequestHead::parse(&request(
            "Upgrade: WebSocket\r\nConnection: keep-alive, Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n",
        ))
        .unwrap();
        assert!(head.is_websocket_upgrade());
    }

    #[test]
    fn test_empty_key_is_not_an_upgrade() {
        let head = RequestHead::parse(&request(
            "Upgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key:\r\n",
        ))
        .unwrap();
        assert!(!head.is_websocket_upgrade());
    }

    #[tokio::test]
    async fn test_read_head_and_remainder() {
        let wire = b"GET / HTTP/1.1\r\nHost: x\r\n\r\nEXTRA".to_vec();
        let mut stream = std::io::Cursor::new(wire);
        let (head, rest) = read_request_head(&mut stream, 8192).await.unwrap();
        assert!(head.starts_with("GET / HTTP/1.1"));
        assert!(!head.contains("EXTRA"));
        assert_eq!(rest, b"EXTRA");
    }

    #[tokio::test]
    async fn test_read_head_enforces_limit() {
        let wire = vec![b'a'; 16 * 1024];
        let mut stream = std::io::Cursor::new(wire);
        let result = read_request_head(&mut stream, 8192).await;
        assert!(matches!(result, Err(ProtocolError::RequestTooLarge(_))));
    }

    #[tokio::test]
    async fn test_read_head_truncated_peer() {
        let wire = b"GET / HTTP/1.1\r\nHos".to_vec();
        let mut stream = std::io::Cursor::new(wire);
        let result = read_request_head(&mut stream, 8192).await;
        assert!(matches!(result, Err(ProtocolError::TruncatedRequest)));
    }
}

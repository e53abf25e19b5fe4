//! Request classification and the canned response.
//!
//! A request is whatever a single recv call returned. The only thing
//! looked for is an exact `Connection: close` line; everything else is
//! answered with the same fixed payload.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::OnceLock;

const STATUS_LINE: &str = "HTTP/1.1 200 OK\r\n";
const SERVER: &str = "hello-epoll";
const CONTENT_TYPE: &str = "text/plain; charset=utf-8";
const BODY: &str = "hello world!\r\n";

const CLOSE_DIRECTIVE: &str = "Connection: close";

/// A request that decoded cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedRequest {
    /// Request carried an exact `Connection: close` line.
    pub close_requested: bool,
}

/// Request bytes were not valid UTF-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Malformed {
    /// Length of the valid UTF-8 prefix.
    pub valid_up_to: usize,
}

impl std::fmt::Display for Malformed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid utf-8 after {} bytes", self.valid_up_to)
    }
}

impl std::error::Error for Malformed {}

/// Classify one request buffer.
pub fn parse(input: &[u8]) -> Result<ParsedRequest, Malformed> {
    let text = std::str::from_utf8(input).map_err(|e| Malformed {
        valid_up_to: e.valid_up_to(),
    })?;

    Ok(ParsedRequest {
        close_requested: text.split("\r\n").any(|line| line == CLOSE_DIRECTIVE),
    })
}

/// The fixed response, serialized once.
pub fn response() -> &'static Bytes {
    static RESPONSE: OnceLock<Bytes> = OnceLock::new();
    RESPONSE.get_or_init(build_response)
}

fn build_response() -> Bytes {
    let headers = format!(
        "Server: {SERVER}\r\nContent-type: {CONTENT_TYPE}\r\nContent-length: {}\r\n\r\n",
        BODY.len()
    );

    let mut buf = BytesMut::with_capacity(STATUS_LINE.len() + headers.len() + BODY.len());
    buf.put_slice(STATUS_LINE.as_bytes());
    buf.put_slice(headers.as_bytes());
    buf.put_slice(BODY.as_bytes());
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_request() {
        let req = parse(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert!(!req.close_requested);
    }

    #[test]
    fn test_parse_close_directive() {
        let req = parse(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").unwrap();
        assert!(req.close_requested);

        // Directive alone, without a trailing CRLF.
        assert!(parse(b"Connection: close").unwrap().close_requested);
    }

    #[test]
    fn test_close_directive_must_match_exactly() {
        for input in [
            &b"GET / HTTP/1.1\r\nconnection: close\r\n\r\n"[..],
            b"GET / HTTP/1.1\r\nConnection: closed\r\n\r\n",
            b"GET / HTTP/1.1\r\nConnection:close\r\n\r\n",
            b"GET / HTTP/1.1\r\n Connection: close\r\n\r\n",
            b"GET / HTTP/1.1\nConnection: close\n\n",
            b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
        ] {
            assert!(
                !parse(input).unwrap().close_requested,
                "matched {:?}",
                String::from_utf8_lossy(input)
            );
        }
    }

    #[test]
    fn test_parse_empty_buffer() {
        assert!(!parse(b"").unwrap().close_requested);
    }

    #[test]
    fn test_parse_invalid_utf8() {
        assert_eq!(
            parse(b"GET /\xff\xfe HTTP/1.1\r\n"),
            Err(Malformed { valid_up_to: 5 })
        );
    }

    #[test]
    fn test_response_bytes() {
        let expected: &[u8] = b"HTTP/1.1 200 OK\r\n\
            Server: hello-epoll\r\n\
            Content-type: text/plain; charset=utf-8\r\n\
            Content-length: 14\r\n\r\n\
            hello world!\r\n";
        assert_eq!(&response()[..], expected);
    }

    #[test]
    fn test_content_length_matches_body() {
        let raw = std::str::from_utf8(response()).unwrap();
        let (head, body) = raw.split_once("\r\n\r\n").unwrap();
        let declared: usize = head
            .lines()
            .find_map(|line| line.strip_prefix("Content-length: "))
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(declared, body.len());
        assert_eq!(body, "hello world!\r\n");
    }

    #[test]
    fn test_response_built_once() {
        assert!(std::ptr::eq(response(), response()));
        assert_eq!(response().as_ptr(), response().clone().as_ptr());
    }
}

use crate::http::request::Headers;
use crate::net::buffer::NetBuffer;
use crate::net::conn::{Connection, SendCallback};
use crate::net::gather::{GatherBuilder, PoolHandle};
use lumen::time;

/// Status codes produced by the server core itself.
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_FOUND: u16 = 404;
    pub const REQUEST_ENTITY_TOO_LARGE: u16 = 413;
    pub const REQUEST_URI_TOO_LONG: u16 = 414;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const NOT_IMPLEMENTED: u16 = 501;
}

/// The RFC 2616 recommended reason phrase for a status code.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Time-out",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Large",
        415 => "Unsupported Media Type",
        416 => "Requested range not satisfiable",
        417 => "Expectation Failed",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Time-out",
        505 => "HTTP Version not supported",
        _ => "Unknown",
    }
}

/// Builds one response: a mutable headers set, an at-most-once status commit
/// and a gathered body. `finalize` stitches the status line and headers in
/// front of the body and hands back the buffer array for a gathered send.
pub struct ResponseWriter {
    minor_version: u8,
    status: u16,
    committed: bool,
    close_connection: bool,
    omit_body: bool,
    headers: Headers,
    body: GatherBuilder,
    bytes_sent: usize,
}

impl ResponseWriter {
    pub fn new(pool: PoolHandle) -> ResponseWriter {
        ResponseWriter {
            minor_version: 1,
            status: status::OK,
            committed: false,
            close_connection: false,
            omit_body: false,
            headers: Headers::new(),
            body: GatherBuilder::new(pool),
            bytes_sent: 0,
        }
    }

    /// Headers stay mutable until the response is finalized.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Commits the status code. At most once: later calls are no-ops.
    pub fn write_header(&mut self, code: u16) {
        if self.committed {
            return;
        }
        self.status = code;
        self.committed = true;
    }

    /// Appends body bytes, committing status 200 when nothing was committed
    /// yet.
    pub fn write(&mut self, bytes: &[u8]) {
        self.write_header(status::OK);
        self.body.write_bytes(bytes);
    }

    pub fn write_str(&mut self, text: &str) {
        self.write(text.as_bytes());
    }

    /// Requests a `Connection: close` header and connection teardown after
    /// the response is flushed.
    pub fn set_close_connection(&mut self, close: bool) {
        self.close_connection = close;
    }

    #[inline]
    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    /// Selects the HTTP/1.x minor version used on the status line.
    pub fn set_version(&mut self, minor: u8) {
        self.minor_version = minor;
    }

    /// Suppresses the body at send time while keeping the entity headers,
    /// as a HEAD response requires.
    pub fn set_omit_body(&mut self, omit: bool) {
        self.omit_body = omit;
    }

    #[inline]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Bytes handed to the transport by the last `finalize`.
    #[inline]
    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    /// Completes the head (automatic `Content-Length`, `Connection: close`
    /// when requested, `Date` when absent), stitches it in front of the body
    /// and returns the gathered buffers plus their total length.
    pub fn finalize(&mut self) -> (Vec<NetBuffer>, usize) {
        self.write_header(status::OK);

        let body_len = self.body.body_len();
        self.headers.set("Content-Length", body_len.to_string());
        if self.close_connection {
            self.headers.set("Connection", "close".to_string());
        }
        if !self.headers.contains("Date") {
            self.headers.set("Date", time::http_date());
        }

        {
            let status_line = format!(
                "HTTP/1.{} {}, {}\r\n",
                self.minor_version,
                self.status,
                reason_phrase(self.status)
            );
            let mut head = self.body.insert_front();
            head.write_str(&status_line);
            for (key, values) in self.headers.iter() {
                head.write_str(key);
                head.write_str(": ");
                head.write_str(&values.join(","));
                head.write_str("\r\n");
            }
            head.write_str("\r\n");
        }

        if self.omit_body {
            self.body.discard_body();
        }

        let bufs = self.body.build();
        let total = bufs.iter().map(NetBuffer::remaining).sum();
        self.bytes_sent = total;

        (bufs, total)
    }

    /// Finalizes and performs the gathered send on `conn`.
    pub fn send(&mut self, conn: &mut dyn Connection, cb: SendCallback) {
        let (bufs, total) = self.finalize();
        conn.send_buffers(cb, bufs, total);
    }

    /// Resets the writer for the next response on the same connection.
    pub fn clear(&mut self) {
        self.minor_version = 1;
        self.status = status::OK;
        self.committed = false;
        self.close_connection = false;
        self.omit_body = false;
        self.headers.clear();
        self.body.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::buffer::NetBuffer;
    use crate::net::gather::BufferPool;

    fn collect(bufs: &[NetBuffer]) -> Vec<u8> {
        let mut out = Vec::new();
        for buf in bufs {
            out.extend_from_slice(buf.unread_slice());
        }
        out
    }

    fn writer() -> ResponseWriter {
        ResponseWriter::new(BufferPool::handle(512, 16))
    }

    #[test]
    fn test_minimal_response_head() {
        let mut w = writer();
        w.write_header(status::NOT_FOUND);

        let (bufs, total) = w.finalize();
        let wire = collect(&bufs);
        let text = std::str::from_utf8(&wire).unwrap();

        assert_eq!(total, wire.len());
        assert!(text.starts_with("HTTP/1.1 404, Not Found\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(text.contains("Date: "));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_write_commits_ok() {
        let mut w = writer();
        w.write_str("hello");
        // The status is already committed; this must be a no-op.
        w.write_header(status::NOT_FOUND);

        let (bufs, _) = w.finalize();
        let wire = collect(&bufs);
        let text = std::str::from_utf8(&wire).unwrap();

        assert!(text.starts_with("HTTP/1.1 200, OK\r\n"));
    }

    #[test]
    fn test_body_and_content_length() {
        let mut w = writer();
        w.write_str("hello world");

        let (bufs, _) = w.finalize();
        let wire = collect(&bufs);
        let text = std::str::from_utf8(&wire).unwrap();

        assert!(text.starts_with("HTTP/1.1 200, OK\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.ends_with("\r\n\r\nhello world"));
    }

    #[test]
    fn test_connection_close_header() {
        let mut w = writer();
        w.set_close_connection(true);

        let (bufs, _) = w.finalize();
        let text_bytes = collect(&bufs);
        let text = std::str::from_utf8(&text_bytes).unwrap();

        assert!(text.contains("Connection: close\r\n"));
    }

    #[test]
    fn test_version_zero_status_line() {
        let mut w = writer();
        w.set_version(0);
        w.write_header(status::NOT_FOUND);

        let (bufs, _) = w.finalize();
        let wire = collect(&bufs);
        assert!(wire.starts_with(b"HTTP/1.0 404, Not Found\r\n"));
    }

    #[test]
    fn test_omit_body_keeps_content_length() {
        let mut w = writer();
        w.write_str("invisible");
        w.set_omit_body(true);

        let (bufs, _) = w.finalize();
        let wire = collect(&bufs);
        let text = std::str::from_utf8(&wire).unwrap();

        assert!(text.contains("Content-Length: 9\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(!text.contains("invisible"));
    }

    #[test]
    fn test_unknown_reason_phrase() {
        assert_eq!(reason_phrase(299), "Unknown");
        assert_eq!(reason_phrase(404), "Not Found");
    }

    #[test]
    fn test_clear_resets_for_reuse() {
        let mut w = writer();
        w.write_str("first");
        w.set_close_connection(true);
        let _ = w.finalize();

        w.clear();
        w.write_header(status::OK);
        let (bufs, _) = w.finalize();
        let wire = collect(&bufs);
        let text = std::str::from_utf8(&wire).unwrap();

        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(!text.contains("Connection: close"));
        assert!(!text.contains("first"));
    }
}

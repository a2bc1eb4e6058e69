use crate::http::parser;
use crate::http::request::{BodyMode, Method, Request};
use crate::http::response::{status, ResponseWriter};
use crate::net::conn::{Connection, RecvCallback};
use crate::net::gather::PoolHandle;
use hashbrown::HashMap;
use lumen::logging::{self, Logger};
use std::cell::RefCell;
use std::rc::Rc;
use std::str;

/// A registered request handler. Handlers run on the reactor thread and must
/// not block.
pub type Handler = Box<dyn FnMut(&Request, &mut ResponseWriter)>;

/// Exact-match URI routing table shared by every connection of a server.
pub struct Routes {
    map: RefCell<HashMap<String, RefCell<Handler>>>,
}

impl Routes {
    pub fn new() -> Routes {
        Routes {
            map: RefCell::new(HashMap::new()),
        }
    }

    pub fn insert<S: Into<String>>(&self, uri: S, handler: Handler) {
        self.map.borrow_mut().insert(uri.into(), RefCell::new(handler));
    }

    fn dispatch(&self, uri: &str, request: &Request, writer: &mut ResponseWriter) -> bool {
        let map = self.map.borrow();
        match map.get(uri) {
            Some(handler) => {
                let mut handler = handler.borrow_mut();
                (&mut *handler)(request, writer);
                true
            }
            None => false,
        }
    }
}

/// Pipeline position of one connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PipelineState {
    RequestStart,
    RequestHeaders,
    MessageBody,
    ResponseSend,
    /// The handler advances the state itself; the receive loop backs off.
    Manual,
    Closed,
}

/// Typed parse failure carrying the response status code.
struct InvalidRequest(u16);

enum StepOutcome {
    /// The state advanced; run the next step against the buffered data.
    Continue,
    /// The buffer holds an incomplete element; wait for more bytes.
    NeedMore,
    /// A response send was started; the receive loop is done for now.
    Responded,
}

/// The per-connection HTTP state machine: parses the request head and body
/// off the transport, dispatches to the routed handler and drives the
/// gathered response send. One instance lives as long as its connection and
/// is reset between requests.
pub struct HttpConn {
    state: PipelineState,
    request: Request,
    writer: ResponseWriter,
    routes: Rc<Routes>,
    pool: PoolHandle,
    keep_alive: bool,
    finished: Option<Rc<dyn Fn()>>,
    log: Logger,
}

impl HttpConn {
    pub fn new(
        routes: Rc<Routes>,
        pool: PoolHandle,
        conn_id: usize,
        log: &Logger,
    ) -> Rc<RefCell<HttpConn>> {
        Rc::new(RefCell::new(HttpConn {
            state: PipelineState::RequestStart,
            request: Request::new(),
            writer: ResponseWriter::new(Rc::clone(&pool)),
            routes,
            pool,
            keep_alive: true,
            finished: None,
            log: log.new(logging::o!("conn_id" => conn_id)),
        }))
    }

    /// Hook invoked once when this machine is done with its connection, so
    /// the owning server can drop it from the live set.
    pub fn set_finished_hook(&mut self, hook: Rc<dyn Fn()>) {
        self.finished = Some(hook);
    }

    #[inline]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// The persistent receive callback that feeds this machine.
    pub fn recv_callback(this: Rc<RefCell<HttpConn>>) -> RecvCallback {
        Box::new(move |conn| {
            HttpConn::on_data(&this, conn);
        })
    }

    /// Marks the connection closed on the machine side and notifies the
    /// server. Used by close/error callbacks installed by the server.
    pub fn on_transport_closed(this: &Rc<RefCell<HttpConn>>) {
        let hook = {
            let mut m = this.borrow_mut();
            m.state = PipelineState::Closed;
            m.finished.take()
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    fn on_data(this: &Rc<RefCell<HttpConn>>, conn: &mut dyn Connection) {
        loop {
            let state = this.borrow().state;

            let outcome = match state {
                PipelineState::RequestStart => Self::step_request_start(this, conn),
                PipelineState::RequestHeaders => Self::step_headers(this, conn),
                PipelineState::MessageBody => Self::step_body(this, conn),
                // A send is in flight or the handler took over; leave the
                // buffered bytes for the next pass.
                PipelineState::ResponseSend | PipelineState::Manual => return,
                PipelineState::Closed => return,
            };

            match outcome {
                Ok(StepOutcome::Continue) => continue,
                Ok(StepOutcome::NeedMore) => {
                    conn.in_buffer().compact();
                    return;
                }
                Ok(StepOutcome::Responded) => return,
                Err(InvalidRequest(code)) => {
                    Self::send_error(this, conn, code);
                    return;
                }
            }
        }
    }

    fn step_request_start(
        this: &Rc<RefCell<HttpConn>>,
        conn: &mut dyn Connection,
    ) -> Result<StepOutcome, InvalidRequest> {
        let buf = conn.in_buffer();
        buf.flip_read();

        // Empty lines before the request line are tolerated.
        parser::skip_crlf(buf);

        let line = match parser::parse_line(buf) {
            Some(line) => line,
            None => {
                if buf.remaining() == buf.capacity() {
                    return Err(InvalidRequest(status::REQUEST_URI_TOO_LONG));
                }
                return Ok(StepOutcome::NeedMore);
            }
        };

        let (method_word, pos) =
            parser::parse_word(line, 0).ok_or(InvalidRequest(status::BAD_REQUEST))?;
        let (uri_word, pos) =
            parser::parse_word(line, pos).ok_or(InvalidRequest(status::BAD_REQUEST))?;
        let (version_word, _) =
            parser::parse_word(line, pos).ok_or(InvalidRequest(status::BAD_REQUEST))?;

        let method = Method::from_bytes(method_word)
            .ok_or(InvalidRequest(status::NOT_IMPLEMENTED))?;
        let minor = parser::parse_version(version_word)
            .ok_or(InvalidRequest(status::NOT_IMPLEMENTED))?;
        if minor > 1 {
            return Err(InvalidRequest(status::NOT_IMPLEMENTED));
        }
        let uri = str::from_utf8(uri_word).map_err(|_| InvalidRequest(status::BAD_REQUEST))?;

        let mut m = this.borrow_mut();
        logging::debug!(m.log, "request line"; "method" => method.as_str(), "uri" => uri, "minor" => minor);
        m.request.reset();
        m.request.method = method;
        m.request.uri.push_str(uri);
        m.request.minor_version = minor;
        m.state = PipelineState::RequestHeaders;

        Ok(StepOutcome::Continue)
    }

    fn step_headers(
        this: &Rc<RefCell<HttpConn>>,
        conn: &mut dyn Connection,
    ) -> Result<StepOutcome, InvalidRequest> {
        loop {
            let buf = conn.in_buffer();
            buf.flip_read();

            let line = match parser::parse_line(buf) {
                Some(line) => line,
                None => {
                    if buf.remaining() == buf.capacity() {
                        return Err(InvalidRequest(status::REQUEST_URI_TOO_LONG));
                    }
                    return Ok(StepOutcome::NeedMore);
                }
            };

            if line.is_empty() {
                this.borrow_mut().state = PipelineState::MessageBody;
                return Ok(StepOutcome::Continue);
            }

            if parser::is_whitespace(line[0]) {
                // Folded continuation of the previous header's last value.
                let text = parser::parse_text(line, 0);
                let text =
                    str::from_utf8(text).map_err(|_| InvalidRequest(status::BAD_REQUEST))?;
                let mut m = this.borrow_mut();
                if !m.request.headers.append_to_last(text) {
                    return Err(InvalidRequest(status::BAD_REQUEST));
                }
                continue;
            }

            let (key, pos) =
                parser::parse_token(line, 0).ok_or(InvalidRequest(status::BAD_REQUEST))?;
            if pos >= line.len() || line[pos] != b':' {
                return Err(InvalidRequest(status::BAD_REQUEST));
            }
            let value = parser::parse_text(line, pos + 1);

            let key = str::from_utf8(key).map_err(|_| InvalidRequest(status::BAD_REQUEST))?;
            let value = str::from_utf8(value).map_err(|_| InvalidRequest(status::BAD_REQUEST))?;

            this.borrow_mut().request.headers.add(key, value.to_string());
        }
    }

    fn step_body(
        this: &Rc<RefCell<HttpConn>>,
        conn: &mut dyn Connection,
    ) -> Result<StepOutcome, InvalidRequest> {
        let (mode, declared) = {
            let m = this.borrow();

            let mode = match m.request.method.expects_body() {
                true => BodyMode::Read,
                false => BodyMode::Ignore,
            };

            let declared = match mode {
                BodyMode::Ignore => 0,
                _ => match m.request.headers.get("Content-Length") {
                    Some(value) => value
                        .trim()
                        .parse::<usize>()
                        .map_err(|_| InvalidRequest(status::BAD_REQUEST))?,
                    None => 0,
                },
            };

            (mode, declared)
        };

        let buf = conn.in_buffer();
        buf.flip_read();

        if declared > 0 {
            // The body must fit the receive buffer; anything larger is
            // rejected rather than streamed.
            if declared > buf.capacity() {
                return Err(InvalidRequest(status::REQUEST_ENTITY_TOO_LARGE));
            }
            if buf.remaining() < declared {
                return Ok(StepOutcome::NeedMore);
            }
        }

        {
            let mut m = this.borrow_mut();
            m.request.body_mode = mode;
            if declared > 0 {
                m.request.body.extend_from_slice(&buf.read_slice()[..declared]);
                buf.advance_read(declared);
            }
            m.state = PipelineState::ResponseSend;
        }

        Self::respond(this, conn);
        Ok(StepOutcome::Responded)
    }

    fn respond(this: &Rc<RefCell<HttpConn>>, conn: &mut dyn Connection) {
        let _ = conn.cancel_recv();

        {
            let mut m = this.borrow_mut();
            let m = &mut *m;

            let minor = m.request.minor_version;
            let connection_header = m
                .request
                .headers
                .get("Connection")
                .map(|value| value.trim().to_ascii_lowercase());

            // HTTP/1.1 defaults to persistent; HTTP/1.0 only persists on an
            // explicit Keep-Alive.
            let close = match minor {
                0 => connection_header.as_deref() != Some("keep-alive"),
                _ => connection_header.as_deref() == Some("close"),
            };
            if minor == 0 && !close {
                m.writer
                    .headers_mut()
                    .set("Connection", "Keep-Alive".to_string());
            }

            m.writer.set_version(minor);
            m.writer.set_close_connection(close);
            m.writer.set_omit_body(m.request.method == Method::Head);

            let routed = m.routes.dispatch(&m.request.uri, &m.request, &mut m.writer);
            if !routed {
                logging::debug!(m.log, "no handler"; "uri" => &m.request.uri);
                m.writer.write_header(status::NOT_FOUND);
            }

            // The handler may have requested a teardown of its own.
            m.keep_alive = !m.writer.close_connection();
        }

        Self::send_response(this, conn);
    }

    fn send_error(this: &Rc<RefCell<HttpConn>>, conn: &mut dyn Connection, code: u16) {
        let _ = conn.cancel_recv();

        {
            let mut m = this.borrow_mut();
            logging::debug!(m.log, "invalid request"; "status" => code);

            let minor = m.request.minor_version;
            m.writer.clear();
            m.writer.set_version(minor);
            m.writer.set_close_connection(true);
            m.writer.write_header(code);
            m.keep_alive = false;
            m.state = PipelineState::ResponseSend;
        }

        Self::send_response(this, conn);
    }

    fn send_response(this: &Rc<RefCell<HttpConn>>, conn: &mut dyn Connection) {
        // Finalize outside the send so a synchronous completion callback can
        // re-borrow the machine.
        let (bufs, total) = {
            let mut m = this.borrow_mut();
            m.writer.finalize()
        };

        let hook = Rc::clone(this);
        conn.send_buffers(
            Box::new(move |conn| HttpConn::on_response_sent(&hook, conn)),
            bufs,
            total,
        );
    }

    fn on_response_sent(this: &Rc<RefCell<HttpConn>>, conn: &mut dyn Connection) {
        let reclaimed = conn.take_sent_buffers();

        let keep_alive = {
            let mut m = this.borrow_mut();
            m.pool.borrow_mut().release_all(reclaimed);
            logging::debug!(m.log, "response sent"; "bytes" => m.writer.bytes_sent(), "keep_alive" => m.keep_alive);
            m.writer.clear();
            m.keep_alive
        };

        if !keep_alive {
            conn.close();
            Self::on_transport_closed(this);
            return;
        }

        {
            let mut m = this.borrow_mut();
            m.state = PipelineState::RequestStart;
            m.request.reset();
        }

        // Re-arm the receive and immediately run the pipeline once more in
        // case a pipelined request is already buffered.
        conn.recv_append_persistent(HttpConn::recv_callback(Rc::clone(this)));
        HttpConn::on_data(this, conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::buffer::NetBuffer;
    use crate::net::conn::{
        CloseCallback, Connection, ErrorCallback, RecvCallback, SendCallback,
    };
    use crate::net::gather::BufferPool;
    use lumen::logging::{Discard, Logger};
    use std::mem;

    /// In-memory transport: the test injects request bytes into the
    /// in-buffer and collects everything the pipeline sends.
    struct MockConn {
        in_buf: NetBuffer,
        out_buf: NetBuffer,
        recv_cb: Option<RecvCallback>,
        wire: Vec<u8>,
        sent: Vec<NetBuffer>,
        closed: bool,
    }

    impl MockConn {
        fn new(capacity: usize) -> MockConn {
            MockConn {
                in_buf: NetBuffer::new(capacity),
                out_buf: NetBuffer::new(capacity),
                recv_cb: None,
                wire: Vec::new(),
                sent: Vec::new(),
                closed: false,
            }
        }

        /// Simulates the reactor delivering `bytes` to the armed receive.
        fn deliver(&mut self, bytes: &[u8]) {
            self.in_buf.flip_append();
            assert_eq!(self.in_buf.put(bytes), bytes.len());
            self.in_buf.flip_read();

            if let Some(mut cb) = self.recv_cb.take() {
                cb(self);
                if self.recv_cb.is_none() && !self.closed {
                    self.recv_cb = Some(cb);
                }
            }
        }

        fn take_wire(&mut self) -> Vec<u8> {
            mem::replace(&mut self.wire, Vec::new())
        }
    }

    impl Connection for MockConn {
        fn recv(&mut self, cb: RecvCallback) {
            self.in_buf.clear();
            self.recv_cb = Some(cb);
        }

        fn recv_append(&mut self, cb: RecvCallback) {
            self.recv_cb = Some(cb);
        }

        fn recv_persistent(&mut self, cb: RecvCallback) {
            self.recv_cb = Some(cb);
        }

        fn recv_append_persistent(&mut self, cb: RecvCallback) {
            self.recv_cb = Some(cb);
        }

        fn cancel_recv(&mut self) -> Option<RecvCallback> {
            self.recv_cb.take()
        }

        fn send(&mut self, cb: SendCallback) {
            self.out_buf.flip_read();
            let drained = self.out_buf.read_slice().to_vec();
            self.out_buf.advance_read(drained.len());
            self.wire.extend_from_slice(&drained);
            self.out_buf.clear();
            cb(self);
        }

        fn send_buffer(&mut self, cb: SendCallback, buf: NetBuffer) {
            self.send_buffers(cb, vec![buf], 0);
        }

        fn send_buffers(&mut self, cb: SendCallback, bufs: Vec<NetBuffer>, _remaining: usize) {
            for mut buf in bufs {
                buf.flip_read();
                self.wire.extend_from_slice(buf.read_slice());
                let len = buf.read_slice().len();
                buf.advance_read(len);
                self.sent.push(buf);
            }
            cb(self);
        }

        fn send_partial(&mut self, cb: SendCallback) {
            self.send(cb);
        }

        fn set_on_close(&mut self, _cb: CloseCallback) {}

        fn set_on_error(&mut self, _cb: ErrorCallback) {}

        fn in_buffer(&mut self) -> &mut NetBuffer {
            &mut self.in_buf
        }

        fn out_buffer(&mut self) -> &mut NetBuffer {
            &mut self.out_buf
        }

        fn take_sent_buffers(&mut self) -> Vec<NetBuffer> {
            mem::replace(&mut self.sent, Vec::new())
        }

        fn close(&mut self) {
            self.closed = true;
            self.recv_cb = None;
        }

        fn is_closed(&self) -> bool {
            self.closed
        }
    }

    fn test_log() -> Logger {
        Logger::root(Discard, lumen::logging::o!())
    }

    fn machine(routes: Rc<Routes>, capacity: usize) -> (Rc<RefCell<HttpConn>>, MockConn) {
        let pool = BufferPool::handle(512, 32);
        let this = HttpConn::new(routes, pool, 0, &test_log());

        let mut conn = MockConn::new(capacity);
        conn.recv_append_persistent(HttpConn::recv_callback(Rc::clone(&this)));
        (this, conn)
    }

    fn response_text(conn: &mut MockConn) -> String {
        String::from_utf8(conn.take_wire()).unwrap()
    }

    #[test]
    fn test_get_without_handler_is_404() {
        let (_this, mut conn) = machine(Rc::new(Routes::new()), 4096);

        conn.deliver(b"GET / HTTP/1.1\r\n\r\n");

        let text = response_text(&mut conn);
        assert!(text.starts_with("HTTP/1.1 404, Not Found\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(text.contains("Date: "));
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_routed_handler_runs() {
        let routes = Rc::new(Routes::new());
        routes.insert(
            "/hello",
            Box::new(|request: &Request, writer: &mut ResponseWriter| {
                assert_eq!(request.method, Method::Get);
                writer.write_str("hi there");
            }),
        );

        let (_this, mut conn) = machine(routes, 4096);
        conn.deliver(b"GET /hello HTTP/1.1\r\n\r\n");

        let text = response_text(&mut conn);
        assert!(text.starts_with("HTTP/1.1 200, OK\r\n"));
        assert!(text.contains("Content-Length: 8\r\n"));
        assert!(text.ends_with("hi there"));
    }

    #[test]
    fn test_pipelined_requests_get_two_responses() {
        let (_this, mut conn) = machine(Rc::new(Routes::new()), 4096);

        conn.deliver(b"GET / HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\n\r\n");

        let text = response_text(&mut conn);
        let count = text.matches("HTTP/1.1 404, Not Found").count();
        assert_eq!(count, 2);
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_split_delivery_parses_like_one_chunk() {
        let (_this, mut conn) = machine(Rc::new(Routes::new()), 4096);

        let wire = b"GET /split HTTP/1.1\r\nHost: here\r\n\r\n";
        for byte in wire.iter() {
            conn.deliver(&[*byte]);
        }

        let text = response_text(&mut conn);
        assert!(text.starts_with("HTTP/1.1 404, Not Found\r\n"));
    }

    #[test]
    fn test_connection_close_closes_after_response() {
        let (_this, mut conn) = machine(Rc::new(Routes::new()), 4096);

        conn.deliver(b"GET / HTTP/1.1\r\nconnection:    close   \r\n\r\n");

        let text = response_text(&mut conn);
        assert!(text.contains("Connection: close\r\n"));
        assert!(conn.is_closed());
    }

    #[test]
    fn test_http10_keep_alive() {
        let (_this, mut conn) = machine(Rc::new(Routes::new()), 4096);

        conn.deliver(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n");
        let text = response_text(&mut conn);
        assert!(text.starts_with("HTTP/1.0 404, Not Found\r\n"));
        assert!(text.contains("Connection: Keep-Alive\r\n"));
        assert!(!conn.is_closed());

        // A follow-up HTTP/1.0 request without Keep-Alive closes.
        conn.deliver(b"GET / HTTP/1.0\r\n\r\n");
        let text = response_text(&mut conn);
        assert!(text.contains("Connection: close\r\n"));
        assert!(conn.is_closed());
    }

    #[test]
    fn test_header_continuation_joins_values() {
        let routes = Rc::new(Routes::new());
        routes.insert(
            "/",
            Box::new(|request: &Request, writer: &mut ResponseWriter| {
                assert_eq!(request.headers.get("Hello"), Some("world hid!"));
                writer.write_header(status::OK);
            }),
        );

        let (_this, mut conn) = machine(routes, 4096);
        conn.deliver(b"GET / HTTP/1.1\r\nhello: world\r\n hid!\r\n\r\n");

        let text = response_text(&mut conn);
        assert!(text.starts_with("HTTP/1.1 200, OK\r\n"));
    }

    #[test]
    fn test_continuation_as_first_header_is_bad_request() {
        let (_this, mut conn) = machine(Rc::new(Routes::new()), 4096);

        conn.deliver(b"GET / HTTP/1.1\r\n folded\r\n\r\n");

        let text = response_text(&mut conn);
        assert!(text.starts_with("HTTP/1.1 400, Bad Request\r\n"));
        assert!(conn.is_closed());
    }

    #[test]
    fn test_unknown_method_not_implemented() {
        let (_this, mut conn) = machine(Rc::new(Routes::new()), 4096);

        conn.deliver(b"BREW /pot HTTP/1.1\r\n\r\n");

        let text = response_text(&mut conn);
        assert!(text.starts_with("HTTP/1.1 501, Not Implemented\r\n"));
    }

    #[test]
    fn test_minor_version_above_one_not_implemented() {
        let (_this, mut conn) = machine(Rc::new(Routes::new()), 4096);

        conn.deliver(b"GET / HTTP/1.2\r\n\r\n");

        let text = response_text(&mut conn);
        assert!(text.starts_with("HTTP/1.1 501, Not Implemented\r\n"));
    }

    #[test]
    fn test_overlong_request_line_is_414() {
        let (_this, mut conn) = machine(Rc::new(Routes::new()), 64);

        let mut wire = b"GET /".to_vec();
        wire.resize(64, b'x');
        conn.deliver(&wire);

        let text = response_text(&mut conn);
        assert!(text.starts_with("HTTP/1.1 414, Request-URI Too Large\r\n"));
    }

    #[test]
    fn test_post_body_reaches_handler() {
        let routes = Rc::new(Routes::new());
        routes.insert(
            "/submit",
            Box::new(|request: &Request, writer: &mut ResponseWriter| {
                assert_eq!(request.method, Method::Post);
                assert_eq!(request.body_mode, BodyMode::Read);
                assert_eq!(request.body, b"name=ferris");
                writer.write_str("saved");
            }),
        );

        let (_this, mut conn) = machine(routes, 4096);
        conn.deliver(b"POST /submit HTTP/1.1\r\nContent-Length: 11\r\n\r\nname=ferris");

        let text = response_text(&mut conn);
        assert!(text.starts_with("HTTP/1.1 200, OK\r\n"));
    }

    #[test]
    fn test_post_body_split_across_deliveries() {
        let routes = Rc::new(Routes::new());
        routes.insert(
            "/submit",
            Box::new(|request: &Request, writer: &mut ResponseWriter| {
                assert_eq!(request.body, b"0123456789");
                writer.write_header(status::OK);
            }),
        );

        let (_this, mut conn) = machine(routes, 4096);
        conn.deliver(b"POST /submit HTTP/1.1\r\nContent-Length: 10\r\n\r\n01234");
        assert!(conn.take_wire().is_empty());
        conn.deliver(b"56789");

        let text = response_text(&mut conn);
        assert!(text.starts_with("HTTP/1.1 200, OK\r\n"));
    }

    #[test]
    fn test_oversized_body_is_413() {
        let (_this, mut conn) = machine(Rc::new(Routes::new()), 128);

        conn.deliver(b"POST / HTTP/1.1\r\nContent-Length: 4096\r\n\r\n");

        let text = response_text(&mut conn);
        assert!(text.starts_with("HTTP/1.1 413, Request Entity Too Large\r\n"));
        assert!(conn.is_closed());
    }

    #[test]
    fn test_head_omits_body() {
        let routes = Rc::new(Routes::new());
        routes.insert(
            "/page",
            Box::new(|_request: &Request, writer: &mut ResponseWriter| {
                writer.write_str("page body");
            }),
        );

        let (_this, mut conn) = machine(routes, 4096);
        conn.deliver(b"HEAD /page HTTP/1.1\r\n\r\n");

        let text = response_text(&mut conn);
        assert!(text.contains("Content-Length: 9\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(!text.contains("page body"));
    }
}

use crate::net::buffer::NetBuffer;
use crate::net::gather::PoolHandle;
use crate::net::reactor::{Reactor, ReadyHandler};
use lumen::logging::{self, Logger};
use mio::net::TcpStream;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::mem;
use std::rc::{Rc, Weak};

/// Callback invoked when received data is available. Persistent receives
/// keep the callback installed across deliveries.
pub type RecvCallback = Box<dyn FnMut(&mut dyn Connection)>;
/// One-shot callback fired when a send completes, or after any progress for
/// partial sends.
pub type SendCallback = Box<dyn FnOnce(&mut dyn Connection)>;
/// Fired once when the peer closes. Informational: the receiver must still
/// call `close` to release resources.
pub type CloseCallback = Box<dyn FnOnce(&mut dyn Connection)>;
/// Fired once on a transport failure. The connection is left unusable and
/// must be closed explicitly.
pub type ErrorCallback = Box<dyn FnOnce(&mut dyn Connection, io::Error)>;

/// The application-facing transport contract. Implemented by the plain
/// non-blocking connection and, with identical semantics, by the TLS
/// connection.
///
/// Callback fields are cleared before dispatch, so a callback that
/// reconfigures the connection always wins over the prior configuration.
pub trait Connection {
    /// One-shot receive; the in-buffer is cleared before the read.
    fn recv(&mut self, cb: RecvCallback);
    /// One-shot receive appending to the existing in-buffer contents.
    fn recv_append(&mut self, cb: RecvCallback);
    /// Persistent receive; the in-buffer is cleared before every read.
    fn recv_persistent(&mut self, cb: RecvCallback);
    /// Persistent receive; the caller manages the in-buffer contents.
    fn recv_append_persistent(&mut self, cb: RecvCallback);
    /// Cancels any receive subscription, returning the prior callback.
    /// Idempotent.
    fn cancel_recv(&mut self) -> Option<RecvCallback>;
    /// Sends the remaining bytes of the internal out-buffer. An empty buffer
    /// completes immediately.
    fn send(&mut self, cb: SendCallback);
    /// Sends the remaining bytes of `buf` without copying. The buffer is held
    /// by the connection while in flight and reclaimable through
    /// `take_sent_buffers` once the callback fires.
    fn send_buffer(&mut self, cb: SendCallback, buf: NetBuffer);
    /// Gathered send of an ordered buffer sequence. `remaining` bounds the
    /// total byte count; zero means the sum of the buffers.
    fn send_buffers(&mut self, cb: SendCallback, bufs: Vec<NetBuffer>, remaining: usize);
    /// Sends at least one byte of the internal out-buffer, then fires the
    /// callback. The caller typically inspects the buffer and reschedules.
    fn send_partial(&mut self, cb: SendCallback);
    fn set_on_close(&mut self, cb: CloseCallback);
    fn set_on_error(&mut self, cb: ErrorCallback);
    fn in_buffer(&mut self) -> &mut NetBuffer;
    fn out_buffer(&mut self) -> &mut NetBuffer;
    /// Reclaims externally supplied buffers whose send has completed.
    fn take_sent_buffers(&mut self) -> Vec<NetBuffer>;
    /// Closes the socket, deregisters from the reactor and returns pooled
    /// buffers. Idempotent.
    fn close(&mut self);
    fn is_closed(&self) -> bool;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RecvMode {
    Idle,
    OneShot,
    OneShotAppend,
    Persistent,
    PersistentAppend,
}

impl RecvMode {
    #[inline]
    fn is_persistent(self) -> bool {
        match self {
            RecvMode::Persistent | RecvMode::PersistentAppend => true,
            _ => false,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SendMode {
    Idle,
    InternalFull,
    InternalPartial,
    ExternalSingle,
    ExternalMultiple,
}

// Bound on recv/send dispatches triggered back-to-back from one readiness
// event before the connection yields through a deferred reactor task.
const MAX_SEQ_OPS: u32 = 4;

/// A non-blocking TCP connection driven by the reactor.
///
/// Owns the socket, an in-buffer and an out-buffer (pool-backed when a pool
/// is supplied) and the callback set. Receive and send interest always track
/// the armed modes; after arming, one immediate I/O attempt is made so a
/// ready socket does not pay a reactor round trip.
pub struct NbConn {
    stream: TcpStream,
    reactor: Rc<Reactor>,
    weak_self: Weak<RefCell<NbConn>>,
    token: Option<usize>,
    pool: Option<PoolHandle>,
    in_buf: NetBuffer,
    out_buf: NetBuffer,
    recv_mode: RecvMode,
    recv_cb: Option<RecvCallback>,
    send_mode: SendMode,
    send_cb: Option<SendCallback>,
    external: VecDeque<NetBuffer>,
    external_remaining: usize,
    sent: Vec<NetBuffer>,
    task_cb: Option<Box<dyn FnMut(&mut dyn Connection)>>,
    on_close: Option<CloseCallback>,
    on_error: Option<ErrorCallback>,
    seq_ops: u32,
    closed: bool,
    id: usize,
    log: Logger,
}

impl NbConn {
    pub fn new(
        reactor: Rc<Reactor>,
        stream: TcpStream,
        pool: Option<PoolHandle>,
        buffer_size: usize,
        id: usize,
        log: &Logger,
    ) -> NbConn {
        let (in_buf, out_buf) = match &pool {
            Some(pool) => {
                let mut pool = pool.borrow_mut();
                (pool.allocate(), pool.allocate())
            }
            None => (NetBuffer::new(buffer_size), NetBuffer::new(buffer_size)),
        };

        NbConn {
            stream,
            reactor,
            weak_self: Weak::new(),
            token: None,
            pool,
            in_buf,
            out_buf,
            recv_mode: RecvMode::Idle,
            recv_cb: None,
            send_mode: SendMode::Idle,
            send_cb: None,
            external: VecDeque::new(),
            external_remaining: 0,
            sent: Vec::new(),
            task_cb: None,
            on_close: None,
            on_error: None,
            seq_ops: 0,
            closed: false,
            id,
            log: log.new(logging::o!("conn_id" => id)),
        }
    }

    /// Registers the connection on its reactor. Must be called once, before
    /// any receive or send is armed.
    pub fn register(conn: &Rc<RefCell<NbConn>>) -> io::Result<()> {
        let handler = Rc::clone(conn) as Rc<RefCell<dyn ReadyHandler>>;
        let mut c = conn.borrow_mut();
        let reactor = Rc::clone(&c.reactor);

        let token = reactor.register(&mut c.stream, false, false, handler)?;
        c.token = Some(token);
        c.weak_self = Rc::downgrade(conn);

        logging::debug!(c.log, "connection registered"; "slot" => token);
        Ok(())
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// The reactor slot this connection occupies, once registered.
    #[inline]
    pub fn token(&self) -> Option<usize> {
        self.token
    }

    #[inline]
    pub fn reactor(&self) -> &Rc<Reactor> {
        &self.reactor
    }

    /// Installs the handler for cross-thread task-completion notifications
    /// delivered through `Remote::notify` on this connection's slot.
    pub fn set_task_callback(&mut self, cb: Box<dyn FnMut(&mut dyn Connection)>) {
        self.task_cb = Some(cb);
    }

    fn arm_recv(&mut self, mode: RecvMode, cb: RecvCallback) {
        debug_assert!(!self.closed, "recv armed on closed connection");

        if mode == RecvMode::OneShot {
            self.in_buf.clear();
        }

        self.recv_mode = mode;
        self.recv_cb = Some(cb);
        self.update_interest();
        self.pump_read();
    }

    fn update_interest(&self) {
        if let Some(token) = self.token {
            self.reactor.set_interest(
                token,
                self.recv_mode != RecvMode::Idle,
                self.send_mode != SendMode::Idle,
            );
        }
    }

    /// Schedules a reactor task that resumes pumping once the current
    /// dispatch pass unwinds. Used when the sequential-op budget runs out.
    fn defer_pump(&self) {
        let weak = self.weak_self.clone();
        self.reactor.defer(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                let mut c = conn.borrow_mut();
                if !c.closed {
                    c.seq_ops = 0;
                    c.pump_read();
                    c.pump_write();
                }
            }
        }));
    }

    fn pump_read(&mut self) {
        loop {
            if self.closed || self.recv_mode == RecvMode::Idle {
                return;
            }

            if self.recv_mode == RecvMode::Persistent {
                self.in_buf.clear();
            }
            self.in_buf.flip_append();

            if self.in_buf.is_full() {
                // No room: the consumer must drain or resize before more
                // reads can land. The last delivery saw the full buffer.
                return;
            }

            match self.in_buf.ingress(&mut self.stream) {
                Ok(0) => {
                    logging::debug!(self.log, "peer closed connection");
                    self.fire_close();
                    return;
                }
                Ok(count) => {
                    logging::trace!(self.log, "received"; "bytes" => count);
                    self.in_buf.flip_read();
                    self.dispatch_recv();
                    if self.closed {
                        return;
                    }
                    if self.seq_ops >= MAX_SEQ_OPS {
                        self.defer_pump();
                        return;
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.fire_error(err);
                    return;
                }
            }
        }
    }

    fn dispatch_recv(&mut self) {
        let mode = self.recv_mode;
        let mut cb = match self.recv_cb.take() {
            Some(cb) => cb,
            None => return,
        };

        // One-shot subscriptions are cleared before dispatch so the callback
        // may re-arm; persistent ones keep the mode and get the callback
        // reinstated unless the callback reconfigured the connection.
        if !mode.is_persistent() {
            self.recv_mode = RecvMode::Idle;
        }
        self.update_interest();
        self.seq_ops += 1;

        cb(self);

        if !self.closed && mode.is_persistent() && self.recv_cb.is_none() && self.recv_mode == mode
        {
            self.recv_cb = Some(cb);
        }
    }

    fn arm_send(&mut self, mode: SendMode, cb: SendCallback) {
        debug_assert!(!self.closed, "send armed on closed connection");
        debug_assert_eq!(self.send_mode, SendMode::Idle, "send already in flight");

        self.send_mode = mode;
        self.send_cb = Some(cb);
        self.update_interest();
        self.pump_write();
    }

    fn pump_write(&mut self) {
        loop {
            if self.closed {
                return;
            }

            let result = match self.send_mode {
                SendMode::Idle => return,
                SendMode::InternalFull | SendMode::InternalPartial => self.write_internal(),
                SendMode::ExternalSingle | SendMode::ExternalMultiple => self.write_external(),
            };

            match result {
                Ok(true) => {
                    // Current send finished and its callback ran; loop in
                    // case the callback armed a follow-up.
                    if self.closed {
                        return;
                    }
                    if self.seq_ops >= MAX_SEQ_OPS {
                        self.defer_pump();
                        return;
                    }
                }
                Ok(false) => return,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.fire_error(err);
                    return;
                }
            }
        }
    }

    /// Writes from the internal out-buffer. Returns `Ok(true)` when the send
    /// completed (callback fired), `Ok(false)` to wait for writability.
    fn write_internal(&mut self) -> io::Result<bool> {
        self.out_buf.flip_read();

        if self.out_buf.is_empty() {
            self.out_buf.clear();
            self.complete_send();
            return Ok(true);
        }

        let count = self.out_buf.egress(&mut self.stream)?;
        if count == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        logging::trace!(self.log, "sent"; "bytes" => count);

        if self.out_buf.is_empty() {
            // Fully drained: reclaim the whole region for the next fill.
            self.out_buf.clear();
            self.complete_send();
            return Ok(true);
        }
        if self.send_mode == SendMode::InternalPartial {
            self.complete_send();
            return Ok(true);
        }

        Ok(false)
    }

    fn write_external(&mut self) -> io::Result<bool> {
        loop {
            if self.external_remaining == 0 {
                self.complete_send();
                return Ok(true);
            }

            let front = match self.external.front_mut() {
                Some(front) => front,
                None => {
                    self.complete_send();
                    return Ok(true);
                }
            };

            if front.is_empty() {
                let drained = self.external.pop_front().expect("front checked above");
                self.sent.push(drained);
                continue;
            }

            let count = front.egress(&mut self.stream)?;
            if count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            logging::trace!(self.log, "sent"; "bytes" => count);
            self.external_remaining = self.external_remaining.saturating_sub(count);
        }
    }

    fn complete_send(&mut self) {
        self.send_mode = SendMode::Idle;
        while let Some(buf) = self.external.pop_front() {
            self.sent.push(buf);
        }
        self.external_remaining = 0;
        self.update_interest();
        self.seq_ops += 1;

        if let Some(cb) = self.send_cb.take() {
            cb(self);
        }
    }

    fn fire_close(&mut self) {
        self.recv_mode = RecvMode::Idle;
        self.recv_cb = None;
        self.update_interest();

        match self.on_close.take() {
            Some(cb) => cb(self),
            None => self.close(),
        }
    }

    fn fire_error(&mut self, err: io::Error) {
        logging::debug!(self.log, "transport error"; "error" => %err);

        self.recv_mode = RecvMode::Idle;
        self.recv_cb = None;
        self.send_mode = SendMode::Idle;
        self.send_cb = None;
        self.update_interest();

        match self.on_error.take() {
            Some(cb) => cb(self, err),
            None => self.close(),
        }
    }
}

impl Connection for NbConn {
    fn recv(&mut self, cb: RecvCallback) {
        self.arm_recv(RecvMode::OneShot, cb);
    }

    fn recv_append(&mut self, cb: RecvCallback) {
        self.arm_recv(RecvMode::OneShotAppend, cb);
    }

    fn recv_persistent(&mut self, cb: RecvCallback) {
        self.arm_recv(RecvMode::Persistent, cb);
    }

    fn recv_append_persistent(&mut self, cb: RecvCallback) {
        self.arm_recv(RecvMode::PersistentAppend, cb);
    }

    fn cancel_recv(&mut self) -> Option<RecvCallback> {
        self.recv_mode = RecvMode::Idle;
        let cb = self.recv_cb.take();
        self.update_interest();
        cb
    }

    fn send(&mut self, cb: SendCallback) {
        if self.out_buf.remaining() == 0 {
            cb(self);
            return;
        }
        self.arm_send(SendMode::InternalFull, cb);
    }

    fn send_buffer(&mut self, cb: SendCallback, mut buf: NetBuffer) {
        buf.flip_read();
        let total = buf.remaining();
        self.external.push_back(buf);

        if total == 0 {
            while let Some(buf) = self.external.pop_front() {
                self.sent.push(buf);
            }
            cb(self);
            return;
        }

        self.external_remaining = total;
        self.arm_send(SendMode::ExternalSingle, cb);
    }

    fn send_buffers(&mut self, cb: SendCallback, bufs: Vec<NetBuffer>, remaining: usize) {
        let mut total = 0;
        for mut buf in bufs {
            buf.flip_read();
            total += buf.remaining();
            self.external.push_back(buf);
        }
        if remaining != 0 {
            total = remaining;
        }

        if total == 0 {
            while let Some(buf) = self.external.pop_front() {
                self.sent.push(buf);
            }
            cb(self);
            return;
        }

        self.external_remaining = total;
        self.arm_send(SendMode::ExternalMultiple, cb);
    }

    fn send_partial(&mut self, cb: SendCallback) {
        if self.out_buf.remaining() == 0 {
            cb(self);
            return;
        }
        self.arm_send(SendMode::InternalPartial, cb);
    }

    fn set_on_close(&mut self, cb: CloseCallback) {
        self.on_close = Some(cb);
    }

    fn set_on_error(&mut self, cb: ErrorCallback) {
        self.on_error = Some(cb);
    }

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
        if self.closed {
            return;
        }
        self.closed = true;

        self.recv_mode = RecvMode::Idle;
        self.send_mode = SendMode::Idle;
        self.recv_cb = None;
        self.send_cb = None;
        self.task_cb = None;
        self.on_close = None;
        self.on_error = None;

        if let Some(token) = self.token.take() {
            if let Err(err) = self.reactor.deregister(token, &mut self.stream) {
                logging::debug!(self.log, "deregistration failed"; "error" => %err);
            }
        }

        if let Some(pool) = self.pool.take() {
            let mut pool = pool.borrow_mut();
            pool.release(mem::replace(&mut self.in_buf, NetBuffer::new(0)));
            pool.release(mem::replace(&mut self.out_buf, NetBuffer::new(0)));
            pool.release_all(self.external.drain(..));
            pool.release_all(self.sent.drain(..));
        } else {
            self.external.clear();
            self.sent.clear();
        }

        logging::debug!(self.log, "connection closed");
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl ReadyHandler for NbConn {
    fn on_ready(&mut self, readable: bool, writable: bool) {
        self.seq_ops = 0;

        if readable {
            self.pump_read();
        }
        if writable && !self.closed {
            self.pump_write();
        }
    }

    fn on_task_done(&mut self) {
        if let Some(mut cb) = self.task_cb.take() {
            cb(self);
            if !self.closed && self.task_cb.is_none() {
                self.task_cb = Some(cb);
            }
        }
    }
}

use crate::net::buffer::NetBuffer;
use crate::net::conn::{
    CloseCallback, Connection, ErrorCallback, NbConn, RecvCallback, SendCallback,
};
use crate::net::reactor::Remote;
use crate::tls::engine::{Engine, HandshakeStatus, NetReader};
use crate::tls::state::{Op, StateKind, StepState};
use lumen::logging::{self, Logger};
use std::cell::RefCell;
use std::io;
use std::mem;
use std::rc::Rc;
use std::sync::mpsc::{channel, Sender};
use std::thread;

// Backstop against a misbehaving engine driving the dispatcher in circles.
const MAX_DISPATCH_SPINS: u32 = 256;

/// Direction the dispatcher is currently driving.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Direction {
    Wrap,
    Unwrap,
}

impl Direction {
    #[inline]
    fn other(self) -> Direction {
        match self {
            Direction::Wrap => Direction::Unwrap,
            Direction::Unwrap => Direction::Wrap,
        }
    }
}

/// Connection-level lifecycle state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TlsState {
    Active,
    Closing,
    Closed,
}

/// Outbound plaintext source selected by the application-facing sends.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum AppSource {
    None,
    Internal,
    External,
}

enum Flush {
    AwaitSend,
    Settled,
}

/// Serial worker for delegated engine tasks. One background thread drains a
/// job queue in submission order; completion is reported back to the reactor
/// through its cross-thread task queue.
pub struct TaskExecutor {
    tx: Sender<Box<dyn FnOnce() + Send>>,
}

impl TaskExecutor {
    pub fn new() -> TaskExecutor {
        let (tx, rx) = channel::<Box<dyn FnOnce() + Send>>();

        thread::spawn(move || {
            for job in rx.iter() {
                job();
            }
        });

        TaskExecutor { tx }
    }

    pub fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        let _ = self.tx.send(job);
    }
}

/// The state behind a TLS connection: the engine, the application-side
/// buffers, the current/other step state pair and the dispatcher bookkeeping.
///
/// The network-side record buffers are the underlying connection's own
/// in/out buffers, so encrypted traffic moves without copying between
/// layers.
pub struct TlsCore {
    engine: Box<dyn Engine>,
    app_in: NetBuffer,
    app_out: NetBuffer,
    external: Vec<NetBuffer>,
    sent: Vec<NetBuffer>,
    source: AppSource,
    kind: StateKind,
    conn_state: TlsState,
    direction: Direction,
    is_dispatching: bool,
    done_other_direction: bool,
    request_wrap: bool,
    request_unwrap: bool,
    needs_app_recv: bool,
    net_send_pending: bool,
    app_recv_cb: Option<RecvCallback>,
    app_recv_persistent: bool,
    app_recv_append: bool,
    app_send_cb: Option<SendCallback>,
    on_close: Option<CloseCallback>,
    on_error: Option<ErrorCallback>,
    worker: Rc<TaskExecutor>,
    remote: Remote,
    token: Option<usize>,
    log: Logger,
}

impl TlsCore {
    pub fn new(
        engine: Box<dyn Engine>,
        worker: Rc<TaskExecutor>,
        remote: Remote,
        log: &Logger,
    ) -> Rc<RefCell<TlsCore>> {
        let kind = match engine.handshake_status() {
            HandshakeStatus::NotHandshaking => StateKind::Active,
            _ => StateKind::Handshake,
        };
        let app_size = engine.app_buffer_size();

        Rc::new(RefCell::new(TlsCore {
            engine,
            app_in: NetBuffer::new(app_size),
            app_out: NetBuffer::new(app_size),
            external: Vec::new(),
            sent: Vec::new(),
            source: AppSource::None,
            kind,
            conn_state: TlsState::Active,
            direction: Direction::Unwrap,
            is_dispatching: false,
            done_other_direction: false,
            request_wrap: false,
            request_unwrap: false,
            needs_app_recv: false,
            net_send_pending: false,
            app_recv_cb: None,
            app_recv_persistent: false,
            app_recv_append: false,
            app_send_cb: None,
            on_close: None,
            on_error: None,
            worker,
            remote,
            token: None,
            log: log.new(logging::o!("layer" => "tls")),
        }))
    }

    #[inline]
    pub fn state(&self) -> TlsState {
        self.conn_state
    }

    /// The persistent receive callback installed on the underlying
    /// connection: every batch of network records re-enters the dispatcher
    /// on the unwrap side.
    pub fn net_recv_callback(core: Rc<RefCell<TlsCore>>) -> RecvCallback {
        Box::new(move |conn| {
            TlsCore::dispatch(&core, conn, Direction::Unwrap);
        })
    }

    /// Arms an application receive. In append mode the plaintext in-buffer
    /// is preserved across deliveries; otherwise it is cleared after each.
    pub fn recv_impl(
        core: &Rc<RefCell<TlsCore>>,
        conn: &mut dyn Connection,
        cb: RecvCallback,
        persistent: bool,
        append: bool,
    ) {
        let resume = {
            let mut c = core.borrow_mut();
            if c.conn_state == TlsState::Closed {
                return;
            }
            c.app_recv_cb = Some(cb);
            c.app_recv_persistent = persistent;
            c.app_recv_append = append;
            c.request_unwrap = true;
            mem::replace(&mut c.needs_app_recv, false)
        };

        // A delivery was suppressed while the application had no callback
        // armed; resume the underlying receive flow.
        if resume {
            conn.recv_append_persistent(Self::net_recv_callback(Rc::clone(core)));
        }

        Self::dispatch(core, conn, Direction::Unwrap);
    }

    /// Clears the application receive callback only; network records keep
    /// flowing so handshake traffic is never stalled.
    pub fn cancel_recv_impl(core: &Rc<RefCell<TlsCore>>) -> Option<RecvCallback> {
        core.borrow_mut().app_recv_cb.take()
    }

    /// Arms an application send from the given source.
    pub fn send_impl(
        core: &Rc<RefCell<TlsCore>>,
        conn: &mut dyn Connection,
        cb: SendCallback,
        source: AppSource,
        bufs: Vec<NetBuffer>,
    ) {
        {
            let mut c = core.borrow_mut();
            if c.conn_state != TlsState::Active {
                logging::debug!(c.log, "send dropped, connection not active");
                return;
            }
            debug_assert!(c.app_send_cb.is_none(), "send already in flight");
            c.app_send_cb = Some(cb);
            c.source = source;
            c.external = bufs;
            c.request_wrap = true;
        }

        Self::dispatch(core, conn, Direction::Wrap);
    }

    /// Graceful close: signal the engine, flush the close records, then
    /// report closure to the application.
    pub fn close_impl(core: &Rc<RefCell<TlsCore>>, conn: &mut dyn Connection) {
        {
            let mut c = core.borrow_mut();
            match c.conn_state {
                TlsState::Active => {
                    logging::debug!(c.log, "starting close handshake");
                    c.conn_state = TlsState::Closing;
                    c.engine.close_outbound();
                }
                TlsState::Closing | TlsState::Closed => return,
            }
        }

        Self::dispatch(core, conn, Direction::Wrap);
    }

    /// Hard close: tear down the transport without close handshaking.
    pub fn close_immediately(core: &Rc<RefCell<TlsCore>>, conn: &mut dyn Connection) {
        {
            let mut c = core.borrow_mut();
            if c.conn_state == TlsState::Closed {
                return;
            }
            logging::debug!(c.log, "closing immediately");
            c.conn_state = TlsState::Closed;
            c.engine.close_inbound();
            c.engine.close_outbound();
            c.request_wrap = false;
            c.request_unwrap = false;
            c.app_recv_cb = None;
            c.app_send_cb = None;
        }

        conn.close();
    }

    pub fn fire_close(core: &Rc<RefCell<TlsCore>>, conn: &mut dyn Connection) {
        let cb = core.borrow_mut().on_close.take();
        if let Some(cb) = cb {
            cb(conn);
        }
    }

    pub fn fire_error(core: &Rc<RefCell<TlsCore>>, conn: &mut dyn Connection, err: io::Error) {
        let cb = core.borrow_mut().on_error.take();
        if let Some(cb) = cb {
            cb(conn, err);
        }
    }

    /// Task-completion entry point: re-arms the network receive and resumes
    /// the dispatcher from the engine's current handshake intent.
    pub fn on_tasks_done(core: &Rc<RefCell<TlsCore>>, conn: &mut dyn Connection) {
        let direction = {
            let c = core.borrow();
            if c.conn_state == TlsState::Closed {
                return;
            }
            logging::debug!(c.log, "delegated tasks complete");
            match c.engine.handshake_status() {
                HandshakeStatus::NeedWrap => Direction::Wrap,
                _ => Direction::Unwrap,
            }
        };

        conn.recv_append_persistent(Self::net_recv_callback(Rc::clone(core)));
        Self::dispatch(core, conn, direction);
    }

    /// Runs the step machine until it has to wait for the network or the
    /// application. Re-entrant calls record their direction as a request and
    /// return; the active dispatcher picks requests up in its completion
    /// phase.
    fn dispatch(core: &Rc<RefCell<TlsCore>>, conn: &mut dyn Connection, initial: Direction) {
        {
            let mut c = core.borrow_mut();
            if c.conn_state == TlsState::Closed {
                return;
            }
            if c.is_dispatching {
                match initial {
                    Direction::Wrap => c.request_wrap = true,
                    Direction::Unwrap => c.request_unwrap = true,
                }
                return;
            }
            c.is_dispatching = true;
            c.direction = initial;
            c.done_other_direction = false;
            // This entry services the request it was asked for.
            match initial {
                Direction::Wrap => c.request_wrap = false,
                Direction::Unwrap => c.request_unwrap = false,
            }
        }

        loop {
            Self::run_dispatch(core, conn);

            // A synchronous completion (for example a send that finished
            // within its own arm call) may have queued a follow-up while the
            // dispatcher was unwinding; service it before going idle.
            let again = {
                let mut c = core.borrow_mut();
                if c.conn_state == TlsState::Closed {
                    false
                } else if c.request_wrap && !c.net_send_pending {
                    c.request_wrap = false;
                    c.direction = Direction::Wrap;
                    c.done_other_direction = false;
                    true
                } else if c.request_unwrap {
                    c.request_unwrap = false;
                    c.direction = Direction::Unwrap;
                    c.done_other_direction = false;
                    true
                } else {
                    false
                }
            };

            if !again {
                break;
            }
        }

        core.borrow_mut().is_dispatching = false;

        if core.borrow().conn_state == TlsState::Closing {
            Self::check_close_done(core, conn);
        }
    }

    fn run_dispatch(core: &Rc<RefCell<TlsCore>>, conn: &mut dyn Connection) {
        let mut spins = 0u32;

        loop {
            spins += 1;
            if spins > MAX_DISPATCH_SPINS {
                let c = core.borrow();
                logging::warn!(c.log, "dispatch spin limit reached, yielding");
                return;
            }

            if core.borrow().conn_state == TlsState::Closed {
                return;
            }

            let direction = core.borrow().direction;

            let op = {
                let mut c = core.borrow_mut();
                if direction == Direction::Wrap && c.net_send_pending {
                    // Records are already in flight; the send completion will
                    // resume the wrap side.
                    Op::None
                } else {
                    match c.step(conn) {
                        Ok(op) => op,
                        Err(err) => {
                            logging::error!(c.log, "engine failure"; "error" => %err);
                            drop(c);
                            Self::close_immediately(core, conn);
                            let err = io::Error::new(io::ErrorKind::InvalidData, err);
                            Self::fire_error(core, conn, err);
                            return;
                        }
                    }
                }
            };

            // Drains resolve into either a wait or plain completion.
            let op = match op {
                Op::DrainDest => match direction {
                    Direction::Wrap => match Self::flush_net_out(core, conn) {
                        Flush::AwaitSend => return,
                        Flush::Settled => Op::None,
                    },
                    Direction::Unwrap => {
                        if Self::deliver_app_data(core, conn) {
                            continue;
                        }
                        // Paused until the application arms a receive.
                        return;
                    }
                },
                other => other,
            };

            match op {
                Op::None => {
                    let mut c = core.borrow_mut();
                    if c.request_wrap && !c.net_send_pending {
                        c.request_wrap = false;
                        c.direction = Direction::Wrap;
                        c.done_other_direction = false;
                        continue;
                    }
                    if c.request_unwrap {
                        c.request_unwrap = false;
                        c.direction = Direction::Unwrap;
                        c.done_other_direction = false;
                        continue;
                    }
                    // Before going idle, give the opposite direction exactly
                    // one opportunistic pass.
                    if !c.done_other_direction {
                        c.done_other_direction = true;
                        c.direction = c.direction.other();
                        continue;
                    }
                    return;
                }
                Op::StateChange => {
                    let mut c = core.borrow_mut();
                    c.kind = c.kind.other();
                    logging::trace!(c.log, "state change"; "state" => ?c.kind);
                    continue;
                }
                Op::ScheduleWrap => {
                    core.borrow_mut().direction = Direction::Wrap;
                    continue;
                }
                Op::ScheduleUnwrap => {
                    core.borrow_mut().direction = Direction::Unwrap;
                    continue;
                }
                Op::LoadSrc => {
                    // Wait for the underlying persistent receive to deliver
                    // more records.
                    conn.in_buffer().flip_append();
                    return;
                }
                Op::EngineClose => {
                    Self::close_immediately(core, conn);
                    Self::fire_close(core, conn);
                    return;
                }
                Op::ScheduleTasks => {
                    Self::offload_tasks(core, conn);
                    return;
                }
                Op::DrainDest => unreachable!("drain resolved above"),
            }
        }
    }

    /// One step of the current state in the current direction.
    fn step(&mut self, conn: &mut dyn Connection) -> Result<Op, crate::tls::engine::EngineError> {
        let state = self.kind.step();

        match self.direction {
            Direction::Unwrap => {
                state.step_unwrap(&mut *self.engine, conn.in_buffer(), &mut self.app_in)
            }
            Direction::Wrap => {
                let engine = &mut self.engine;
                let mut reader = match self.source {
                    AppSource::Internal => NetReader::single(&mut self.app_out),
                    AppSource::External => NetReader::new(&mut self.external),
                    AppSource::None => NetReader::empty(),
                };
                state.step_wrap(&mut **engine, &mut reader, conn.out_buffer())
            }
        }
    }

    /// Ships net-out to the peer. `Settled` means there was nothing to ship
    /// and the wrap side is quiescent; any armed application send completes.
    fn flush_net_out(core: &Rc<RefCell<TlsCore>>, conn: &mut dyn Connection) -> Flush {
        conn.out_buffer().flip_read();

        if conn.out_buffer().is_empty() {
            Self::complete_app_send(core, conn);
            return Flush::Settled;
        }

        core.borrow_mut().net_send_pending = true;

        let core = Rc::clone(core);
        conn.send(Box::new(move |conn| {
            core.borrow_mut().net_send_pending = false;
            TlsCore::dispatch(&core, conn, Direction::Wrap);
        }));

        Flush::AwaitSend
    }

    /// Delivers app-in plaintext to the application callback. Returns false
    /// when no callback is armed, in which case further network receives are
    /// suppressed until the application comes back.
    fn deliver_app_data(core: &Rc<RefCell<TlsCore>>, conn: &mut dyn Connection) -> bool {
        let (mut cb, persistent, append, mut app_in, mut app_out) = {
            let mut c = core.borrow_mut();
            c.app_in.flip_read();

            if c.app_in.is_empty() {
                return true;
            }

            match c.app_recv_cb.take() {
                Some(cb) => {
                    let app_in = mem::replace(&mut c.app_in, NetBuffer::new(0));
                    let app_out = mem::replace(&mut c.app_out, NetBuffer::new(0));
                    (cb, c.app_recv_persistent, c.app_recv_append, app_in, app_out)
                }
                None => {
                    logging::trace!(c.log, "no receive armed, pausing delivery");
                    c.needs_app_recv = true;
                    drop(c);
                    let _ = conn.cancel_recv();
                    return false;
                }
            }
        };

        {
            let mut view = TlsView {
                core,
                conn,
                app_in: &mut app_in,
                app_out: &mut app_out,
            };
            cb(&mut view);
        }

        // In append mode the callback manages the buffer and unconsumed
        // bytes survive; otherwise the batch is gone once delivered.
        match append {
            true => app_in.compact(),
            false => app_in.clear(),
        }

        let mut c = core.borrow_mut();
        c.app_in = app_in;
        c.app_out = app_out;
        if persistent && c.app_recv_persistent && c.app_recv_cb.is_none() {
            c.app_recv_cb = Some(cb);
        }

        true
    }

    fn complete_app_send(core: &Rc<RefCell<TlsCore>>, conn: &mut dyn Connection) {
        let cb = {
            let mut c = core.borrow_mut();
            let bufs = mem::replace(&mut c.external, Vec::new());
            c.sent.extend(bufs);
            c.source = AppSource::None;
            // The internal plaintext source is fully wrapped by now.
            c.app_out.clear();
            c.app_send_cb.take()
        };

        if let Some(cb) = cb {
            Self::with_view(core, conn, move |view| cb(view));
        }
    }

    fn offload_tasks(core: &Rc<RefCell<TlsCore>>, conn: &mut dyn Connection) {
        let mut tasks = Vec::new();
        {
            let mut c = core.borrow_mut();
            while let Some(task) = c.engine.next_task() {
                tasks.push(task);
            }
        }

        if tasks.is_empty() {
            return;
        }

        // Network receives pause while the handshake is parked on the worker;
        // the completion notification re-arms them.
        let _ = conn.cancel_recv();

        let (remote, token, worker) = {
            let c = core.borrow();
            logging::debug!(c.log, "offloading delegated tasks"; "count" => tasks.len());
            (c.remote.clone(), c.token, Rc::clone(&c.worker))
        };

        let slot = match token {
            Some(slot) => slot,
            None => return,
        };

        worker.execute(Box::new(move || {
            for task in tasks {
                task();
            }
            remote.notify(slot);
        }));
    }

    fn check_close_done(core: &Rc<RefCell<TlsCore>>, conn: &mut dyn Connection) {
        let done = {
            let c = core.borrow();
            c.conn_state == TlsState::Closing
                && c.engine.is_outbound_done()
                && !c.net_send_pending
        };

        if done && conn.out_buffer().remaining() == 0 {
            {
                let mut c = core.borrow_mut();
                logging::debug!(c.log, "close handshake complete");
                c.conn_state = TlsState::Closed;
            }
            conn.close();
            Self::fire_close(core, conn);
        }
    }

    /// Runs `f` against a transient application-facing view of this
    /// connection. The app buffers are lent to the view for the duration.
    fn with_view<R>(
        core: &Rc<RefCell<TlsCore>>,
        conn: &mut dyn Connection,
        f: impl FnOnce(&mut dyn Connection) -> R,
    ) -> R {
        let (mut app_in, mut app_out) = {
            let mut c = core.borrow_mut();
            (
                mem::replace(&mut c.app_in, NetBuffer::new(0)),
                mem::replace(&mut c.app_out, NetBuffer::new(0)),
            )
        };

        let result = {
            let mut view = TlsView {
                core,
                conn,
                app_in: &mut app_in,
                app_out: &mut app_out,
            };
            f(&mut view)
        };

        let mut c = core.borrow_mut();
        c.app_in = app_in;
        c.app_out = app_out;
        result
    }
}

/// The application-facing face of a TLS connection, handed to application
/// callbacks. Presents the same `Connection` contract as a plain connection:
/// the in/out buffers are the plaintext ones, receives and sends are
/// re-expressed as unwrap/wrap requests.
pub struct TlsView<'a> {
    core: &'a Rc<RefCell<TlsCore>>,
    conn: &'a mut dyn Connection,
    app_in: &'a mut NetBuffer,
    app_out: &'a mut NetBuffer,
}

impl<'a> Connection for TlsView<'a> {
    fn recv(&mut self, cb: RecvCallback) {
        self.app_in.clear();
        TlsCore::recv_impl(self.core, &mut *self.conn, cb, false, false);
    }

    fn recv_append(&mut self, cb: RecvCallback) {
        TlsCore::recv_impl(self.core, &mut *self.conn, cb, false, true);
    }

    fn recv_persistent(&mut self, cb: RecvCallback) {
        TlsCore::recv_impl(self.core, &mut *self.conn, cb, true, false);
    }

    fn recv_append_persistent(&mut self, cb: RecvCallback) {
        TlsCore::recv_impl(self.core, &mut *self.conn, cb, true, true);
    }

    fn cancel_recv(&mut self) -> Option<RecvCallback> {
        TlsCore::cancel_recv_impl(self.core)
    }

    fn send(&mut self, cb: SendCallback) {
        TlsCore::send_impl(self.core, &mut *self.conn, cb, AppSource::Internal, Vec::new());
    }

    fn send_buffer(&mut self, cb: SendCallback, buf: NetBuffer) {
        TlsCore::send_impl(self.core, &mut *self.conn, cb, AppSource::External, vec![buf]);
    }

    fn send_buffers(&mut self, cb: SendCallback, bufs: Vec<NetBuffer>, _remaining: usize) {
        TlsCore::send_impl(self.core, &mut *self.conn, cb, AppSource::External, bufs);
    }

    // Partial sends are not meaningful at record granularity; aliased to a
    // full send.
    fn send_partial(&mut self, cb: SendCallback) {
        self.send(cb);
    }

    fn set_on_close(&mut self, cb: CloseCallback) {
        self.core.borrow_mut().on_close = Some(cb);
    }

    fn set_on_error(&mut self, cb: ErrorCallback) {
        self.core.borrow_mut().on_error = Some(cb);
    }

    fn in_buffer(&mut self) -> &mut NetBuffer {
        self.app_in
    }

    fn out_buffer(&mut self) -> &mut NetBuffer {
        self.app_out
    }

    fn take_sent_buffers(&mut self) -> Vec<NetBuffer> {
        mem::replace(&mut self.core.borrow_mut().sent, Vec::new())
    }

    fn close(&mut self) {
        TlsCore::close_impl(self.core, &mut *self.conn);
    }

    fn is_closed(&self) -> bool {
        self.core.borrow().conn_state == TlsState::Closed
    }
}

/// Owner handle for a TLS connection: couples the shared core with the
/// underlying registered connection.
///
/// Methods on this handle borrow the underlying connection and must not be
/// called from inside connection callbacks; within callbacks, use the
/// `&mut dyn Connection` view passed to the callback instead.
pub struct TlsConn {
    core: Rc<RefCell<TlsCore>>,
    nbc: Rc<RefCell<NbConn>>,
}

impl TlsConn {
    pub fn new(
        engine: Box<dyn Engine>,
        nbc: Rc<RefCell<NbConn>>,
        worker: Rc<TaskExecutor>,
        log: &Logger,
    ) -> TlsConn {
        let remote = nbc.borrow().reactor().remote();
        let core = TlsCore::new(engine, worker, remote, log);

        TlsConn { core, nbc }
    }

    #[inline]
    pub fn core(&self) -> &Rc<RefCell<TlsCore>> {
        &self.core
    }

    /// Wires the underlying connection (network receive, task completion,
    /// close and error forwarding) and lets handshake traffic flow.
    pub fn start(&self) {
        let mut nbc = self.nbc.borrow_mut();
        self.core.borrow_mut().token = nbc.token();

        let core = Rc::clone(&self.core);
        nbc.set_task_callback(Box::new(move |conn| {
            TlsCore::on_tasks_done(&core, conn);
        }));

        let core = Rc::clone(&self.core);
        nbc.set_on_close(Box::new(move |conn| {
            TlsCore::close_immediately(&core, conn);
            TlsCore::fire_close(&core, conn);
        }));

        let core = Rc::clone(&self.core);
        nbc.set_on_error(Box::new(move |conn, err| {
            TlsCore::close_immediately(&core, conn);
            TlsCore::fire_error(&core, conn, err);
        }));

        nbc.recv_append_persistent(TlsCore::net_recv_callback(Rc::clone(&self.core)));
    }

    pub fn recv(&self, cb: RecvCallback) {
        let mut nbc = self.nbc.borrow_mut();
        TlsCore::recv_impl(&self.core, &mut *nbc, cb, false, false);
    }

    pub fn recv_persistent(&self, cb: RecvCallback) {
        let mut nbc = self.nbc.borrow_mut();
        TlsCore::recv_impl(&self.core, &mut *nbc, cb, true, false);
    }

    /// Persistent receive with a caller-managed plaintext buffer.
    pub fn recv_append_persistent(&self, cb: RecvCallback) {
        let mut nbc = self.nbc.borrow_mut();
        TlsCore::recv_impl(&self.core, &mut *nbc, cb, true, true);
    }

    pub fn cancel_recv(&self) -> Option<RecvCallback> {
        TlsCore::cancel_recv_impl(&self.core)
    }

    pub fn send_buffers(&self, cb: SendCallback, bufs: Vec<NetBuffer>) {
        let mut nbc = self.nbc.borrow_mut();
        TlsCore::send_impl(&self.core, &mut *nbc, cb, AppSource::External, bufs);
    }

    pub fn set_on_close(&self, cb: CloseCallback) {
        self.core.borrow_mut().on_close = Some(cb);
    }

    pub fn set_on_error(&self, cb: ErrorCallback) {
        self.core.borrow_mut().on_error = Some(cb);
    }

    /// Graceful close with close handshaking.
    pub fn close(&self) {
        let mut nbc = self.nbc.borrow_mut();
        TlsCore::close_impl(&self.core, &mut *nbc);
    }

    /// Hard close without handshaking.
    pub fn close_immediately(&self) {
        let mut nbc = self.nbc.borrow_mut();
        TlsCore::close_immediately(&self.core, &mut *nbc);
    }

    pub fn is_closed(&self) -> bool {
        self.core.borrow().conn_state == TlsState::Closed
    }
}

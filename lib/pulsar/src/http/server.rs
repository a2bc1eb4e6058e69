use crate::http::conn::{Handler, HttpConn, Routes};
use crate::http::request::Request;
use crate::http::response::ResponseWriter;
use crate::net::conn::{Connection, NbConn};
use crate::net::gather::{BufferPool, PoolHandle};
use crate::net::reactor::{Reactor, ReadyHandler, Remote};
use crate::tls::conn::{TaskExecutor, TlsConn};
use crate::tls::rustls::TlsConfig;
use indexmap::IndexSet;
use lumen::logging::{self, Logger};
use mio::net::{TcpListener, TcpStream};
use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

pub const DEFAULT_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_POOL_CAPACITY: usize = 128;

/// Server construction parameters.
pub struct ServerConfig {
    pub address: SocketAddr,
    /// Per-connection receive/send buffer size; also the pool entry size.
    pub buffer_size: usize,
    /// Bound on pooled buffers kept around for reuse.
    pub pool_capacity: usize,
    /// When set, every accepted connection speaks TLS.
    pub tls: Option<TlsConfig>,
}

impl ServerConfig {
    pub fn new(address: SocketAddr) -> ServerConfig {
        ServerConfig {
            address,
            buffer_size: DEFAULT_BUFFER_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            tls: None,
        }
    }
}

/// Either face of the transport layer, as stored in the live set.
#[derive(Clone)]
enum Transport {
    Plain(Rc<RefCell<NbConn>>),
    Tls(Rc<TlsConn>),
}

impl Transport {
    fn hard_close(&self) {
        match self {
            Transport::Plain(nbc) => nbc.borrow_mut().close(),
            Transport::Tls(tls) => tls.close_immediately(),
        }
    }
}

struct LiveConn {
    transport: Transport,
    #[allow(dead_code)]
    machine: Rc<RefCell<HttpConn>>,
}

/// State shared between the acceptor and the server handle: the connection
/// slab with its free list, the live-connection set and everything needed to
/// equip a new connection.
struct ServerShared {
    reactor: Rc<Reactor>,
    pool: PoolHandle,
    routes: Rc<Routes>,
    worker: Rc<TaskExecutor>,
    tls: Option<TlsConfig>,
    buffer_size: usize,
    conns: Vec<Option<LiveConn>>,
    free: Vec<usize>,
    live: IndexSet<usize>,
    log: Logger,
}

impl ServerShared {
    fn allocate_slot(&mut self) -> usize {
        match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.conns.push(None);
                self.conns.len() - 1
            }
        }
    }

    fn remove(shared: &Rc<RefCell<ServerShared>>, slot: usize) {
        let removed = {
            let mut s = shared.borrow_mut();
            match s.conns.get_mut(slot).and_then(Option::take) {
                Some(_) => {
                    s.live.swap_remove(&slot);
                    s.free.push(slot);
                    true
                }
                None => false,
            }
        };

        if removed {
            let s = shared.borrow();
            logging::debug!(s.log, "connection removed"; "conn_id" => slot, "live" => s.live.len());
        }
    }
}

/// Accept handler registered for the listening socket.
struct Acceptor {
    listener: TcpListener,
    shared: Rc<RefCell<ServerShared>>,
}

impl ReadyHandler for Acceptor {
    fn on_ready(&mut self, readable: bool, _writable: bool) {
        if !readable {
            return;
        }

        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = accept_connection(&self.shared, stream, peer) {
                        let s = self.shared.borrow();
                        logging::error!(s.log, "failed to set up connection"; "error" => %err);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let s = self.shared.borrow();
                    logging::error!(s.log, "accept failed"; "error" => %err);
                    return;
                }
            }
        }
    }
}

fn accept_connection(
    shared: &Rc<RefCell<ServerShared>>,
    stream: TcpStream,
    peer: SocketAddr,
) -> io::Result<()> {
    let (reactor, pool, routes, worker, tls, buffer_size, slot, log) = {
        let mut s = shared.borrow_mut();
        let slot = s.allocate_slot();
        (
            Rc::clone(&s.reactor),
            Rc::clone(&s.pool),
            Rc::clone(&s.routes),
            Rc::clone(&s.worker),
            s.tls.clone(),
            s.buffer_size,
            slot,
            s.log.new(logging::o!()),
        )
    };

    logging::debug!(log, "accepted connection"; "conn_id" => slot, "peer" => %peer);

    let nbc = Rc::new(RefCell::new(NbConn::new(
        reactor,
        stream,
        Some(Rc::clone(&pool)),
        buffer_size,
        slot,
        &log,
    )));

    if let Err(err) = NbConn::register(&nbc) {
        shared.borrow_mut().free.push(slot);
        return Err(err);
    }

    let machine = HttpConn::new(routes, pool, slot, &log);

    // The machine tells the server when it is done with the connection.
    {
        let shared_hook = Rc::clone(shared);
        machine
            .borrow_mut()
            .set_finished_hook(Rc::new(move || ServerShared::remove(&shared_hook, slot)));
    }

    let transport = match tls {
        Some(config) => match config.new_engine() {
            Ok(engine) => Transport::Tls(Rc::new(TlsConn::new(
                Box::new(engine),
                Rc::clone(&nbc),
                worker,
                &log,
            ))),
            Err(err) => {
                nbc.borrow_mut().close();
                shared.borrow_mut().free.push(slot);
                return Err(io::Error::new(io::ErrorKind::InvalidData, err));
            }
        },
        None => Transport::Plain(Rc::clone(&nbc)),
    };

    // Insert into the live set before starting: starting may invoke
    // callbacks immediately.
    {
        let mut s = shared.borrow_mut();
        s.conns[slot] = Some(LiveConn {
            transport: transport.clone(),
            machine: Rc::clone(&machine),
        });
        s.live.insert(slot);
    }

    // Close and error callbacks release the connection's server slot.
    let close_cb = {
        let machine = Rc::clone(&machine);
        Box::new(move |conn: &mut dyn Connection| {
            conn.close();
            HttpConn::on_transport_closed(&machine);
        })
    };
    let error_cb = {
        let machine = Rc::clone(&machine);
        let log = log.new(logging::o!());
        Box::new(move |conn: &mut dyn Connection, err: io::Error| {
            logging::debug!(log, "connection error"; "error" => %err);
            conn.close();
            HttpConn::on_transport_closed(&machine);
        })
    };

    match &transport {
        Transport::Plain(nbc) => {
            let mut c = nbc.borrow_mut();
            c.set_on_close(close_cb);
            c.set_on_error(error_cb);
            c.recv_append_persistent(HttpConn::recv_callback(machine));
        }
        Transport::Tls(tls) => {
            tls.set_on_close(close_cb);
            tls.set_on_error(error_cb);
            tls.start();
            tls.recv_append_persistent(HttpConn::recv_callback(machine));
        }
    }

    Ok(())
}

/// Cloneable, thread-safe handle that stops a running server.
#[derive(Clone)]
pub struct StopHandle {
    remote: Remote,
}

impl StopHandle {
    pub fn stop(&self) {
        self.remote.stop();
    }
}

/// The HTTP server: owns the listening socket, the reactor and the set of
/// live connections; routes requests by exact URI match.
pub struct HttpServer {
    reactor: Rc<Reactor>,
    shared: Rc<RefCell<ServerShared>>,
    routes: Rc<Routes>,
    acceptor: Rc<RefCell<Acceptor>>,
    acceptor_slot: usize,
    local_addr: SocketAddr,
    log: Logger,
}

impl HttpServer {
    pub fn new(config: ServerConfig, log: &Logger) -> io::Result<HttpServer> {
        let log = log.new(logging::o!("addr" => config.address.to_string()));

        let reactor = Rc::new(Reactor::new(&log)?);
        let listener = TcpListener::bind(config.address)?;
        let local_addr = listener.local_addr()?;

        let routes = Rc::new(Routes::new());
        let pool = BufferPool::handle(config.buffer_size, config.pool_capacity);

        let shared = Rc::new(RefCell::new(ServerShared {
            reactor: Rc::clone(&reactor),
            pool,
            routes: Rc::clone(&routes),
            worker: Rc::new(TaskExecutor::new()),
            tls: config.tls,
            buffer_size: config.buffer_size,
            conns: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            log: log.new(logging::o!()),
        }));

        let acceptor = Rc::new(RefCell::new(Acceptor {
            listener,
            shared: Rc::clone(&shared),
        }));

        let acceptor_slot = {
            let handler = Rc::clone(&acceptor) as Rc<RefCell<dyn ReadyHandler>>;
            let mut a = acceptor.borrow_mut();
            reactor.register(&mut a.listener, true, false, handler)?
        };

        logging::info!(log, "server listening"; "local_addr" => %local_addr);

        Ok(HttpServer {
            reactor,
            shared,
            routes,
            acceptor,
            acceptor_slot,
            local_addr,
            log,
        })
    }

    /// Registers a handler for an exact URI. No pattern matching.
    pub fn route<F>(&self, uri: &str, handler: F)
    where
        F: FnMut(&Request, &mut ResponseWriter) + 'static,
    {
        self.routes.insert(uri, Box::new(handler) as Handler);
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle that stops the run loop from any thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            remote: self.reactor.remote(),
        }
    }

    /// Runs the reactor until stopped, then closes every live connection and
    /// the listener.
    pub fn run(&self) -> io::Result<()> {
        let result = self.reactor.run();
        self.shutdown();
        result
    }

    fn shutdown(&self) {
        logging::info!(self.log, "server stopping");

        let slots: Vec<usize> = self.shared.borrow().live.iter().cloned().collect();
        for slot in slots {
            let transport = self
                .shared
                .borrow()
                .conns
                .get(slot)
                .and_then(Option::as_ref)
                .map(|live| live.transport.clone());

            if let Some(transport) = transport {
                transport.hard_close();
            }
            ServerShared::remove(&self.shared, slot);
        }

        let mut a = self.acceptor.borrow_mut();
        if let Err(err) = self.reactor.deregister(self.acceptor_slot, &mut a.listener) {
            logging::debug!(self.log, "listener deregistration failed"; "error" => %err);
        }
    }
}

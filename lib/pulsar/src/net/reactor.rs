use lumen::logging::{self, Logger};
use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

const WAKE_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;

/// Receiver of readiness events for one registered I/O source.
///
/// `on_ready` is only invoked for directions that intersect the currently
/// requested interest mask; stale kernel readiness on a deregistered or
/// re-purposed slot is dropped. `on_task_done` delivers cross-thread
/// completion notifications posted through [`Remote::notify`].
pub trait ReadyHandler {
    fn on_ready(&mut self, readable: bool, writable: bool);

    fn on_task_done(&mut self) {}
}

struct Entry {
    read: bool,
    write: bool,
    handler: Rc<RefCell<dyn ReadyHandler>>,
}

enum RemoteTask {
    Notify(usize),
    Run(Box<dyn FnOnce() + Send>),
}

/// A single-threaded readiness loop.
///
/// One thread owns the reactor and every handler registered on it. Sources
/// are registered once for both directions; the per-slot interest mask is a
/// reactor-local field, so interest changes never hit the kernel. Cross-thread
/// work enters through [`Remote`]: a task queue drained strictly before
/// handler dispatch on every iteration, and a waker that interrupts the poll.
pub struct Reactor {
    poll: RefCell<Poll>,
    registry: Registry,
    entries: RefCell<Vec<Option<Entry>>>,
    free: RefCell<Vec<usize>>,
    local: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    remote_rx: Receiver<RemoteTask>,
    remote_tx: Sender<RemoteTask>,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    log: Logger,
}

impl Reactor {
    pub fn new(log: &Logger) -> io::Result<Reactor> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (remote_tx, remote_rx) = channel();

        Ok(Reactor {
            poll: RefCell::new(poll),
            registry,
            entries: RefCell::new(Vec::new()),
            free: RefCell::new(Vec::new()),
            local: RefCell::new(VecDeque::new()),
            remote_rx,
            remote_tx,
            waker,
            stop: Arc::new(AtomicBool::new(false)),
            log: log.new(logging::o!()),
        })
    }

    /// Registers an I/O source and its handler, returning the slot token.
    /// The kernel registration covers both directions; `read`/`write` set the
    /// initial reactor-side interest mask.
    pub fn register(
        &self,
        source: &mut dyn Source,
        read: bool,
        write: bool,
        handler: Rc<RefCell<dyn ReadyHandler>>,
    ) -> io::Result<usize> {
        let slot = match self.free.borrow_mut().pop() {
            Some(slot) => slot,
            None => {
                let mut entries = self.entries.borrow_mut();
                entries.push(None);
                entries.len() - 1
            }
        };

        self.registry
            .register(source, Token(slot + 1), Interest::READABLE | Interest::WRITABLE)?;
        self.entries.borrow_mut()[slot] = Some(Entry { read, write, handler });

        logging::trace!(self.log, "source registered"; "slot" => slot);
        Ok(slot)
    }

    /// Updates the interest mask for a slot. Invalid slots are ignored.
    pub fn set_interest(&self, slot: usize, read: bool, write: bool) {
        if let Some(Some(entry)) = self.entries.borrow_mut().get_mut(slot) {
            entry.read = read;
            entry.write = write;
        }
    }

    /// Removes a slot and its kernel registration. Idempotent: a slot that is
    /// already vacant is left alone.
    pub fn deregister(&self, slot: usize, source: &mut dyn Source) -> io::Result<()> {
        let removed = {
            let mut entries = self.entries.borrow_mut();
            match entries.get_mut(slot) {
                Some(entry) if entry.is_some() => {
                    *entry = None;
                    true
                }
                _ => false,
            }
        };

        if removed {
            self.free.borrow_mut().push(slot);
            self.registry.deregister(source)?;
            logging::trace!(self.log, "source deregistered"; "slot" => slot);
        }

        Ok(())
    }

    /// Queues a closure to run on the reactor thread after the current
    /// dispatch pass. Used to resume work that exhausted its sequential-op
    /// budget without recursing.
    pub fn defer(&self, task: Box<dyn FnOnce()>) {
        self.local.borrow_mut().push_back(task);
    }

    /// A cloneable, thread-safe handle for posting work and stopping the
    /// loop.
    pub fn remote(&self) -> Remote {
        Remote {
            tx: self.remote_tx.clone(),
            waker: Arc::clone(&self.waker),
            stop: Arc::clone(&self.stop),
        }
    }

    /// Runs the loop until a stop request is observed after a wake.
    pub fn run(&self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            // Deferred work queued outside a dispatch pass (for example from
            // an immediate send attempt) must not wait for kernel events.
            let timeout = match self.local.borrow().is_empty() {
                true => None,
                false => Some(Duration::from_millis(0)),
            };

            match self.poll.borrow_mut().poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }

            self.drain_remote();

            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                self.dispatch(token.0 - 1, event.is_readable(), event.is_writable());
            }

            self.drain_local();

            if self.stop.load(Ordering::Acquire) {
                logging::debug!(self.log, "reactor stopping");
                return Ok(());
            }
        }
    }

    fn dispatch(&self, slot: usize, readable: bool, writable: bool) {
        // Clone the handler out so registrations from within the handler do
        // not alias the entry table, and gate on the current interest mask
        // rather than the reported readiness alone.
        let (handler, read, write) = {
            let entries = self.entries.borrow();
            match entries.get(slot).and_then(Option::as_ref) {
                Some(entry) => {
                    let read = readable && entry.read;
                    let write = writable && entry.write;
                    if !read && !write {
                        return;
                    }
                    (Rc::clone(&entry.handler), read, write)
                }
                None => return,
            }
        };

        handler.borrow_mut().on_ready(read, write);
    }

    fn drain_remote(&self) {
        while let Ok(task) = self.remote_rx.try_recv() {
            match task {
                RemoteTask::Notify(slot) => {
                    let handler = {
                        let entries = self.entries.borrow();
                        entries
                            .get(slot)
                            .and_then(Option::as_ref)
                            .map(|entry| Rc::clone(&entry.handler))
                    };
                    if let Some(handler) = handler {
                        handler.borrow_mut().on_task_done();
                    }
                }
                RemoteTask::Run(task) => task(),
            }
        }
    }

    fn drain_local(&self) {
        loop {
            let task = self.local.borrow_mut().pop_front();
            match task {
                Some(task) => task(),
                None => return,
            }
        }
    }
}

/// Thread-safe handle to a [`Reactor`]: posts tasks, wakes the loop, requests
/// a stop. Clone one per thread that needs it.
#[derive(Clone)]
pub struct Remote {
    tx: Sender<RemoteTask>,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
}

impl Remote {
    /// Delivers `on_task_done` to the handler registered at `slot` on the
    /// next loop iteration.
    pub fn notify(&self, slot: usize) {
        let _ = self.tx.send(RemoteTask::Notify(slot));
        let _ = self.waker.wake();
    }

    /// Runs a closure on the reactor thread before the next dispatch pass.
    pub fn run<F: FnOnce() + Send + 'static>(&self, task: F) {
        let _ = self.tx.send(RemoteTask::Run(Box::new(task)));
        let _ = self.waker.wake();
    }

    /// Requests the loop to exit and wakes it.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }

    pub fn wake(&self) {
        let _ = self.waker.wake();
    }
}

//! The completion core: one poller thread turning OS readiness into
//! completion events, and a pool of workers draining them.
//!
//! Sockets register with a token and are looked up through a weak
//! back-reference; a completion whose owner is already gone is silently
//! ignored. A handler error marks the owning socket close-requested via
//! [`IoHandler::on_error`] and never propagates, so one bad connection
//! cannot take the pool down.

use crate::support::{Error, NetResult};
use crossbeam_channel::{unbounded, Receiver, Sender};
use hashbrown::HashMap;
use mio::{Evented, Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use slog::{o, Discard, Logger};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

/// Token reserved for waking the poller on shutdown.
const WAKE_TOKEN: usize = 0;

/// Receiver side of a socket registration. Calls arrive on completion
/// worker threads; implementations serialize their own state.
pub trait IoHandler: Send + Sync {
    /// New data (or EOF) is readable on the socket.
    fn readable(&self) -> NetResult<()>;

    /// The socket can accept more outgoing data.
    fn writable(&self) -> NetResult<()>;

    /// A handler call failed; the owner should arrange teardown. Must not
    /// block and must not close the socket inline (close from a completion
    /// worker can self-deadlock when the pool has one thread).
    fn on_error(&self, error: Error);
}

enum Completion {
    Event {
        token: usize,
        readable: bool,
        writable: bool,
    },
    Shutdown,
}

struct IoShared {
    poll: Poll,
    registry: Mutex<HashMap<usize, Weak<dyn IoHandler>>>,
    next_token: AtomicUsize,
    shutdown: AtomicBool,
    log: Logger,
}

/// The process completion queue and its worker pool. Instances share one
/// core through the runtime context.
pub struct IoCore {
    shared: Arc<IoShared>,
    queue: Sender<Completion>,
    waker: SetReadiness,
    threads: Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
}

impl IoCore {
    /// Starts the poller and `workers` completion workers.
    pub fn start<'a, L: Into<Option<&'a Logger>>>(
        workers: usize,
        log: L,
    ) -> io::Result<Arc<IoCore>> {
        assert!(workers > 0, "completion core needs at least one worker");

        let log = match log.into() {
            Some(log) => log.new(o!("subsystem" => "iocore")),
            None => Logger::root(Discard, o!()),
        };

        let poll = Poll::new()?;
        let (registration, waker) = Registration::new2();
        poll.register(
            &registration,
            Token(WAKE_TOKEN),
            Ready::readable(),
            PollOpt::edge(),
        )?;

        let shared = Arc::new(IoShared {
            poll,
            registry: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(WAKE_TOKEN + 1),
            shutdown: AtomicBool::new(false),
            log,
        });

        let (tx, rx) = unbounded::<Completion>();

        let mut threads = Vec::with_capacity(workers + 1);
        threads.push(Self::spawn_poller(shared.clone(), tx.clone(), registration)?);
        for n in 0..workers {
            threads.push(Self::spawn_worker(shared.clone(), rx.clone(), n)?);
        }

        Ok(Arc::new(IoCore {
            shared,
            queue: tx,
            waker,
            threads: Mutex::new(threads),
            workers,
        }))
    }

    fn spawn_poller(
        shared: Arc<IoShared>,
        queue: Sender<Completion>,
        registration: Registration,
    ) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(String::from("io-poller"))
            .spawn(move || {
                // The registration must stay alive for the wake token to
                // keep firing.
                let _registration = registration;
                let mut events = Events::with_capacity(1024);

                loop {
                    if let Err(err) = shared.poll.poll(&mut events, None) {
                        slog::error!(shared.log, "poll failed"; "error" => %err);
                        break;
                    }

                    for event in &events {
                        let token = event.token().0;

                        if token == WAKE_TOKEN {
                            if shared.shutdown.load(Ordering::Acquire) {
                                slog::debug!(shared.log, "poller exiting");
                                return;
                            }
                            continue;
                        }

                        let readiness = event.readiness();
                        let _ = queue.send(Completion::Event {
                            token,
                            readable: readiness.is_readable(),
                            writable: readiness.is_writable(),
                        });
                    }
                }
            })
    }

    fn spawn_worker(
        shared: Arc<IoShared>,
        queue: Receiver<Completion>,
        index: usize,
    ) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("io-worker-{}", index))
            .spawn(move || {
                for completion in queue.iter() {
                    let (token, readable, writable) = match completion {
                        // Each worker consumes exactly one shutdown
                        // sentinel.
                        Completion::Shutdown => break,
                        Completion::Event {
                            token,
                            readable,
                            writable,
                        } => (token, readable, writable),
                    };

                    let handler = shared
                        .registry
                        .lock()
                        .unwrap()
                        .get(&token)
                        .and_then(Weak::upgrade);

                    // A completion for a socket that is already gone is
                    // ignored.
                    let handler = match handler {
                        Some(handler) => handler,
                        None => continue,
                    };

                    if writable {
                        if let Err(error) = handler.writable() {
                            slog::debug!(shared.log, "send completion failed";
                                         "token" => token, "error" => %error);
                            handler.on_error(error);
                            continue;
                        }
                    }

                    if readable {
                        if let Err(error) = handler.readable() {
                            slog::debug!(shared.log, "receive handling failed";
                                         "token" => token, "error" => %error);
                            handler.on_error(error);
                        }
                    }
                }
            })
    }

    /// Registers `evented` for edge-triggered read/write readiness routed to
    /// `handler`. Returns the registration token.
    pub fn register<E: Evented>(
        &self,
        evented: &E,
        handler: Weak<dyn IoHandler>,
    ) -> io::Result<usize> {
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);

        self.shared
            .registry
            .lock()
            .unwrap()
            .insert(token, handler);

        if let Err(err) = self.shared.poll.register(
            evented,
            Token(token),
            Ready::readable() | Ready::writable(),
            PollOpt::edge(),
        ) {
            self.shared.registry.lock().unwrap().remove(&token);
            return Err(err);
        }

        slog::trace!(self.shared.log, "socket registered"; "token" => token);
        Ok(token)
    }

    /// Removes a registration. Pending completions for the token become
    /// no-ops.
    pub fn deregister<E: Evented>(&self, evented: &E, token: usize) {
        let _ = self.shared.poll.deregister(evented);
        self.shared.registry.lock().unwrap().remove(&token);
        slog::trace!(self.shared.log, "socket deregistered"; "token" => token);
    }

    /// False once shutdown has begun; pending sends are dropped rather than
    /// drained when the core is no longer running.
    #[inline]
    pub fn is_running(&self) -> bool {
        !self.shared.shutdown.load(Ordering::Acquire)
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl Drop for IoCore {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.waker.set_readiness(Ready::readable());

        // One sentinel per worker; a worker never consumes more than one,
        // so every worker observes its own.
        for _ in 0..self.workers {
            let _ = self.queue.send(Completion::Shutdown);
        }

        for thread in self.threads.lock().unwrap().drain(..) {
            let _ = thread.join();
        }
    }
}

//! # Dispatcher (Reactor)
//! src/server/dispatcher.rs
//!
//! Un solo thread dueño del `mio::Poll` y del socket de escucha. Nunca lee
//! requests: acepta conexiones, espera readiness y entrega cada conexión
//! lista al executor. Antes de entregarla la saca del multiplexor, así que
//! una conexión la atiende a lo sumo un worker a la vez.
//!
//! ```text
//!   ┌──────────────── loop ────────────────┐
//!   │ 1. re-armar conexiones pendientes    │
//!   │ 2. poll(poll_interval)               │
//!   │ 3. procesar ResponseCompleted        │
//!   │ 4. accept / readiness → executor     │
//!   └──────────────────────────────────────┘
//! ```

use super::connection::{Connection, State};
use super::exchange::ExchangeTask;
use super::executor::Executor;
use super::registry::ConnectionRegistry;
use crate::config::ServerConfig;
use crate::router::Router;
use crate::transport::Transport;
use mio::net::TcpListener;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

pub(crate) const LISTENER: Token = Token(0);
pub(crate) const WAKER: Token = Token(1);

/// Primer id disponible para conexiones (los tokens 0 y 1 están reservados)
const FIRST_CONNECTION_ID: u64 = 2;

/// Mensajes de los workers hacia el reactor
pub(crate) enum Event {
    /// La respuesta terminó (o el exchange falló, con `close = true`)
    ResponseCompleted { conn: Arc<Connection>, close: bool },
}

/// Cola de eventos entre threads; el waker saca al reactor del poll
pub(crate) struct EventQueue {
    queue: Mutex<VecDeque<Event>>,
    waker: Waker,
}

impl EventQueue {
    pub(crate) fn new(waker: Waker) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            waker,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn post(&self, event: Event) {
        self.lock().push_back(event);
        self.wake();
    }

    pub(crate) fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake reactor");
        }
    }

    fn drain(&self) -> Vec<Event> {
        self.lock().drain(..).collect()
    }
}

/// Estado compartido entre el reactor, los workers, los timers y el facade
pub(crate) struct ServerShared {
    pub config: ServerConfig,
    pub router: Arc<Router>,
    pub registry: Arc<ConnectionRegistry>,
    pub events: EventQueue,
    pub transport: Arc<dyn Transport>,
    pub executor: Arc<dyn Executor>,
    /// Exchanges creados cuya finalización el reactor todavía no procesó
    pub exchange_count: AtomicUsize,
    pub terminating: Arc<AtomicBool>,
    pub finished: AtomicBool,
}

impl ServerShared {
    /// Entrega una conexión al executor; si la rechaza, se cierra
    pub(crate) fn submit(self: &Arc<Self>, conn: Arc<Connection>) {
        let task = ExchangeTask::new(Arc::clone(&conn), Arc::clone(self));
        if let Err(e) = self.executor.execute(Box::new(move || task.run())) {
            warn!(conn = conn.id(), error = %e, "executor rejected exchange");
            self.registry.close(&conn);
        }
    }
}

/// El loop del reactor y todo lo que solo él toca
pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    shared: Arc<ServerShared>,
    /// Conexiones registradas en el multiplexor
    armed: HashMap<Token, Arc<Connection>>,
    /// Conexiones que vuelven a esperar readiness en la próxima vuelta
    pending: VecDeque<Arc<Connection>>,
    next_id: u64,
}

impl Reactor {
    pub(crate) fn new(
        poll: Poll,
        mut listener: TcpListener,
        shared: Arc<ServerShared>,
    ) -> io::Result<Self> {
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            listener: Some(listener),
            shared,
            armed: HashMap::new(),
            pending: VecDeque::new(),
            next_id: FIRST_CONNECTION_ID,
        })
    }

    pub(crate) fn run(mut self) {
        info!("reactor started");
        let poll_interval = self.shared.config.poll_interval();
        let mut last_purge = Instant::now();

        while !self.shared.finished.load(Ordering::Acquire) {
            // 1. Re-armar
            while let Some(conn) = self.pending.pop_front() {
                self.arm(conn);
            }

            // 2. Esperar eventos
            if let Err(e) = self.poll.poll(&mut self.events, Some(poll_interval)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poll failed");
                break;
            }

            // 3. Finalizaciones enviadas por los workers
            for event in self.shared.events.drain() {
                self.handle_event(event);
            }

            if self.shared.terminating.load(Ordering::Acquire) {
                self.stop_accepting();
            }

            // 4. Readiness
            let ready: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
            for token in ready {
                match token {
                    LISTENER => self.accept(),
                    WAKER => {}
                    token => self.dispatch(token),
                }
            }

            if last_purge.elapsed() >= poll_interval {
                self.purge_closed();
                last_purge = Instant::now();
            }
        }

        self.shutdown();
    }

    fn handle_event(&mut self, event: Event) {
        let Event::ResponseCompleted { conn, close } = event;
        self.shared.exchange_count.fetch_sub(1, Ordering::SeqCst);

        let registry = &self.shared.registry;
        registry.response_completed(&conn);

        if close || conn.is_closed() || registry.idle_full() {
            trace!(conn = conn.id(), close, "closing after response");
            registry.close(&conn);
            return;
        }

        // Pipelining: el siguiente request ya está en el buffer del wire y
        // el multiplexor no va a avisar por esos bytes
        if conn.has_buffered_data() {
            registry.request_started(&conn);
            self.shared.submit(conn);
            return;
        }

        registry.enter_idle(&conn);
        self.pending.push_back(conn);
    }

    /// Acepta hasta `WouldBlock`
    fn accept(&mut self) {
        loop {
            let listener = match self.listener.as_ref() {
                Some(listener) => listener,
                None => return,
            };
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => match e.kind() {
                    io::ErrorKind::WouldBlock => return,
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => {
                        debug!(error = %e, "transient accept error");
                        continue;
                    }
                    _ => {
                        error!(error = %e, "accept failed");
                        return;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                trace!(error = %e, "set nodelay failed");
            }

            // El resto del servidor trabaja con sockets de std
            let socket = unsafe { std::net::TcpStream::from_raw_fd(stream.into_raw_fd()) };

            let id = self.next_id;
            self.next_id += 1;
            let conn = Arc::new(Connection::new(id, socket));
            debug!(conn = id, %peer, "accepted connection");

            self.shared.registry.request_started(&conn);
            self.arm(conn);
        }
    }

    /// Registra la conexión para readiness de lectura
    fn arm(&mut self, conn: Arc<Connection>) {
        if conn.is_closed() {
            return;
        }
        let token = Token(conn.id() as usize);
        let registered = conn.set_blocking(false).and_then(|_| {
            self.poll.registry().register(
                &mut SourceFd(&conn.raw_fd()),
                token,
                Interest::READABLE,
            )
        });

        match registered {
            Ok(()) => {
                self.armed.insert(token, conn);
            }
            Err(e) => {
                debug!(conn = conn.id(), error = %e, "failed to register connection");
                self.shared.registry.close(&conn);
            }
        }
    }

    /// Saca la conexión del multiplexor y la entrega a un worker
    fn dispatch(&mut self, token: Token) {
        let conn = match self.armed.remove(&token) {
            Some(conn) => conn,
            None => return,
        };

        if let Err(e) = self
            .poll
            .registry()
            .deregister(&mut SourceFd(&conn.raw_fd()))
        {
            trace!(conn = conn.id(), error = %e, "deregister failed");
        }

        if conn.is_closed() {
            return;
        }

        if let Err(e) = conn.set_blocking(true) {
            debug!(conn = conn.id(), error = %e, "failed to switch socket to blocking");
            self.shared.registry.close(&conn);
            return;
        }

        let registry = &self.shared.registry;
        if conn.state() == State::Idle && !registry.promote_idle(&conn) {
            // Un sweep la cerró mientras estaba idle
            return;
        }

        self.shared.submit(conn);
    }

    /// Quita del multiplexor las conexiones que otro thread cerró
    fn purge_closed(&mut self) {
        let closed: Vec<Token> = self
            .armed
            .iter()
            .filter(|(_, conn)| conn.is_closed())
            .map(|(token, _)| *token)
            .collect();

        for token in closed {
            if let Some(conn) = self.armed.remove(&token) {
                let _ = self
                    .poll
                    .registry()
                    .deregister(&mut SourceFd(&conn.raw_fd()));
            }
        }
    }

    fn stop_accepting(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = self.poll.registry().deregister(&mut listener) {
                trace!(error = %e, "listener deregister failed");
            }
            info!("listener closed");
        }
    }

    fn shutdown(&mut self) {
        self.stop_accepting();
        for (_, conn) in self.armed.drain() {
            let _ = self
                .poll
                .registry()
                .deregister(&mut SourceFd(&conn.raw_fd()));
            self.shared.registry.close(&conn);
        }
        for conn in self.pending.drain(..) {
            self.shared.registry.close(&conn);
        }
        let closed = self.shared.registry.close_all();
        info!(closed, "reactor stopped");
    }
}

//! # Conexión
//! src/server/connection.rs
//!
//! Estado compartido de un socket aceptado. El reactor, los workers y los
//! timers de mantenimiento tienen cada uno un `Arc<Connection>`; los campos
//! mutables son atómicos o van detrás de su propio mutex.
//!
//! ```text
//! Idle ──► AwaitingRequest ──► AwaitingResponse ──► Idle
//!   └────────────┴──────────────────┴──────► Closed
//! ```

use crate::router::HttpContext;
use crate::transport::Wire;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::trace;

/// Wire compartido entre el exchange y sus streams de body
pub type SharedWire = Arc<Mutex<Wire>>;

/// Bloquea un wire; un mutex envenenado se reporta como error de I/O
pub fn lock_wire(wire: &SharedWire) -> io::Result<MutexGuard<'_, Wire>> {
    wire.lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "wire poisoned"))
}

fn guard<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Estado de una conexión abierta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Keep-alive, esperando el siguiente request
    Idle = 0,
    /// Leyendo request line, headers o body
    AwaitingRequest = 1,
    /// El request terminó; la respuesta todavía no
    AwaitingResponse = 2,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Idle,
            2 => State::AwaitingResponse,
            _ => State::AwaitingRequest,
        }
    }
}

/// Una conexión TCP aceptada
pub struct Connection {
    id: u64,
    socket: TcpStream,
    peer_addr: Option<SocketAddr>,
    state: AtomicU8,
    creation_time: AtomicU64,
    response_started_time: AtomicU64,
    idle_deadline: AtomicU64,
    closed: AtomicBool,
    wire: Mutex<Option<SharedWire>>,
    context: Mutex<Option<Weak<HttpContext>>>,
    attributes: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Connection {
    pub fn new(id: u64, socket: TcpStream) -> Self {
        let peer_addr = socket.peer_addr().ok();
        Self {
            id,
            socket,
            peer_addr,
            state: AtomicU8::new(State::AwaitingRequest as u8),
            creation_time: AtomicU64::new(0),
            response_started_time: AtomicU64::new(0),
            idle_deadline: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            wire: Mutex::new(None),
            context: Mutex::new(None),
            attributes: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn socket(&self) -> &TcpStream {
        &self.socket
    }

    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn creation_time(&self) -> u64 {
        self.creation_time.load(Ordering::Acquire)
    }

    pub(crate) fn set_creation_time(&self, millis: u64) {
        self.creation_time.store(millis, Ordering::Release);
    }

    pub fn response_started_time(&self) -> u64 {
        self.response_started_time.load(Ordering::Acquire)
    }

    pub(crate) fn set_response_started_time(&self, millis: u64) {
        self.response_started_time.store(millis, Ordering::Release);
    }

    pub fn idle_deadline(&self) -> u64 {
        self.idle_deadline.load(Ordering::Acquire)
    }

    pub(crate) fn set_idle_deadline(&self, millis: u64) {
        self.idle_deadline.store(millis, Ordering::Release);
    }

    /// Modo del socket: no bloqueante mientras lo vigila el reactor
    pub fn set_blocking(&self, blocking: bool) -> io::Result<()> {
        self.socket.set_nonblocking(!blocking)
    }

    /// Saca el wire cacheado para reusarlo en el siguiente request
    pub(crate) fn take_wire(&self) -> Option<SharedWire> {
        guard(&self.wire).take()
    }

    pub(crate) fn cache_wire(&self, wire: SharedWire) {
        if !self.is_closed() {
            *guard(&self.wire) = Some(wire);
        }
    }

    /// El wire cacheado ya tiene bytes del siguiente request
    pub fn has_buffered_data(&self) -> bool {
        let slot = guard(&self.wire);
        let buffered = match slot.as_ref() {
            Some(wire) => match wire.try_lock() {
                Ok(wire) => wire.has_buffered_data(),
                Err(_) => false,
            },
            None => false,
        };
        buffered
    }

    /// Contexto del request actual o del último
    pub fn context(&self) -> Option<Arc<HttpContext>> {
        guard(&self.context).as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_context(&self, context: &Arc<HttpContext>) {
        *guard(&self.context) = Some(Arc::downgrade(context));
    }

    pub fn attribute(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        guard(&self.attributes).get(name).cloned()
    }

    pub fn set_attribute(&self, name: &str, value: Arc<dyn Any + Send + Sync>) {
        guard(&self.attributes).insert(name.to_string(), value);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cierra la conexión; solo la primera llamada tiene efecto
    ///
    /// El shutdown despierta a un worker bloqueado en el socket. El wire se
    /// suelta solo si nadie lo está usando.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        trace!(conn = self.id, "closing connection");

        if let Ok(mut slot) = self.wire.try_lock() {
            if let Some(wire) = slot.take() {
                if let Ok(mut wire) = wire.try_lock() {
                    wire.close();
                }
            }
        }

        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer_addr)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::net::TcpListener;

    /// Conexión sobre un par de sockets locales; devuelve también el cliente
    pub(crate) fn connection_pair(id: u64) -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        (Arc::new(Connection::new(id, server_side)), client)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::connection_pair;
    use super::*;
    use crate::transport::{PlainTransport, Transport};
    use std::io::Read;

    #[test]
    fn test_new_connection_awaits_request() {
        let (conn, _client) = connection_pair(7);
        assert_eq!(conn.id(), 7);
        assert_eq!(conn.state(), State::AwaitingRequest);
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_close_is_idempotent_and_shuts_socket() {
        let (conn, mut client) = connection_pair(1);
        conn.close();
        conn.close();
        assert!(conn.is_closed());

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_wire_cache_dropped_on_close() {
        let (conn, _client) = connection_pair(2);
        let wire = PlainTransport.open(conn.socket()).unwrap();
        conn.cache_wire(Arc::new(Mutex::new(wire)));
        assert!(!conn.has_buffered_data());

        conn.close();
        assert!(conn.take_wire().is_none());
    }

    #[test]
    fn test_state_round_trip() {
        let (conn, _client) = connection_pair(3);
        conn.set_state(State::Idle);
        assert_eq!(conn.state(), State::Idle);
        conn.set_state(State::AwaitingResponse);
        assert_eq!(conn.state(), State::AwaitingResponse);
    }

    #[test]
    fn test_attributes() {
        let (conn, _client) = connection_pair(4);
        conn.set_attribute("user", Arc::new(String::from("ana")));
        let value = conn.attribute("user").unwrap();
        assert_eq!(value.downcast_ref::<String>().map(String::as_str), Some("ana"));
    }
}

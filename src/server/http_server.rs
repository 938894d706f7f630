//! # Facade del Servidor
//! src/server/http_server.rs
//!
//! Punto de entrada para quien embebe el servidor:
//!
//! ```text
//! HttpServer::http(config) → bind(addr) → create_context(...) → start() → stop(grace)
//! ```
//!
//! `start` mueve el multiplexor y el socket de escucha al thread del
//! reactor y lanza los timers de mantenimiento.

use super::dispatcher::{EventQueue, Reactor, ServerShared, WAKER};
use super::executor::{Executor, ThreadPool};
use super::registry::ConnectionRegistry;
use super::timers::MaintenanceTimer;
use crate::clock::{Clock, SystemClock};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::router::{Handler, HttpContext, Router};
use crate::transport::{PlainTransport, Scheme, TlsTransport, Transport};
use mio::net::TcpListener;
use mio::{Poll, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Backlog usado cuando se pide 0
const DEFAULT_BACKLOG: u32 = 1024;

/// Paso de la espera de `stop` mientras quedan exchanges en curso
const STOP_POLL_STEP: Duration = Duration::from_millis(50);

/// Lo que existe solo mientras el servidor corre
struct Running {
    shared: Arc<ServerShared>,
    reactor: JoinHandle<()>,
    idle_timer: MaintenanceTimer,
    slow_peer_timer: Option<MaintenanceTimer>,
    pool: Option<Arc<ThreadPool>>,
}

/// Servidor HTTP o HTTPS
pub struct HttpServer {
    config: ServerConfig,
    scheme: Scheme,
    router: Arc<Router>,
    clock: Arc<dyn Clock>,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    executor: Option<Arc<dyn Executor>>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    running: Option<Running>,
    started: bool,
}

impl HttpServer {
    /// Servidor http sin bind
    pub fn http(config: ServerConfig) -> Result<Self, ServerError> {
        Self::with_scheme(config, Scheme::Http)
    }

    /// Servidor https sin bind; la configuración TLS se da con
    /// [`HttpServer::set_tls_config`]
    pub fn https(config: ServerConfig) -> Result<Self, ServerError> {
        Self::with_scheme(config, Scheme::Https)
    }

    fn with_scheme(config: ServerConfig, scheme: Scheme) -> Result<Self, ServerError> {
        config.validate()?;
        Ok(Self {
            config,
            scheme,
            router: Arc::new(Router::new()),
            clock: SystemClock::shared(),
            listener: None,
            local_addr: None,
            executor: None,
            tls_config: None,
            running: None,
            started: false,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Asocia el socket de escucha; `backlog` 0 usa el valor por defecto
    pub fn bind<A: ToSocketAddrs>(&mut self, addr: A, backlog: u32) -> Result<(), ServerError> {
        if self.listener.is_some() || self.started {
            return Err(ServerError::AlreadyBound);
        }

        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "no address to bind")
        })?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        let backlog = if backlog == 0 { DEFAULT_BACKLOG } else { backlog };
        socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
        socket.set_nonblocking(true)?;
        let listener = TcpListener::from_std(socket.into());

        self.local_addr = Some(listener.local_addr()?);
        self.listener = Some(listener);
        info!(addr = %addr, backlog, "bound");
        Ok(())
    }

    /// Dirección real de escucha (útil con puerto 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Executor para las tareas de exchange; solo antes de `start`
    pub fn set_executor(&mut self, executor: Arc<dyn Executor>) -> Result<(), ServerError> {
        if self.started {
            return Err(ServerError::WrongState("executor must be set before start"));
        }
        self.executor = Some(executor);
        Ok(())
    }

    /// Configuración rustls para un servidor https; solo antes de `start`
    pub fn set_tls_config(&mut self, tls: Arc<rustls::ServerConfig>) -> Result<(), ServerError> {
        if self.started {
            return Err(ServerError::WrongState("TLS config must be set before start"));
        }
        if self.scheme != Scheme::Https {
            return Err(ServerError::WrongState("TLS config requires an https server"));
        }
        self.tls_config = Some(tls);
        Ok(())
    }

    /// Reloj para los timestamps de las conexiones; solo antes de `start`
    pub fn set_clock(&mut self, clock: Arc<dyn Clock>) -> Result<(), ServerError> {
        if self.started {
            return Err(ServerError::WrongState("clock must be set before start"));
        }
        self.clock = clock;
        Ok(())
    }

    pub fn create_context(
        &self,
        path: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<Arc<HttpContext>, ServerError> {
        let context = self.router.create(path, self.scheme, Some(handler))?;
        debug!(path, "context created");
        Ok(context)
    }

    /// Contexto cuyo handler se asigna después; mientras tanto responde 500
    pub fn create_context_without_handler(
        &self,
        path: &str,
    ) -> Result<Arc<HttpContext>, ServerError> {
        self.router.create(path, self.scheme, None)
    }

    pub fn remove_context(&self, path: &str) -> Result<(), ServerError> {
        self.router.remove(path, self.scheme)?;
        debug!(path, "context removed");
        Ok(())
    }

    /// Lanza el reactor y los timers
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.started {
            return Err(ServerError::WrongState("server already started"));
        }
        let listener = self.listener.take().ok_or(ServerError::NotBound)?;

        let transport: Arc<dyn Transport> = match self.scheme {
            Scheme::Http => Arc::new(PlainTransport),
            Scheme::Https => {
                if self.tls_config.is_none() {
                    warn!("https server started without TLS config; connections will fail");
                }
                Arc::new(TlsTransport::new(self.tls_config.clone()))
            }
        };

        let (executor, pool): (Arc<dyn Executor>, Option<Arc<ThreadPool>>) =
            match self.executor.clone() {
                Some(executor) => (executor, None),
                None => {
                    let pool = Arc::new(ThreadPool::new(self.config.workers)?);
                    let executor: Arc<dyn Executor> = pool.clone();
                    (executor, Some(pool))
                }
            };

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        let registry = Arc::new(ConnectionRegistry::new(&self.config, Arc::clone(&self.clock)));
        let shared = Arc::new(ServerShared {
            config: self.config.clone(),
            router: Arc::clone(&self.router),
            registry: Arc::clone(&registry),
            events: EventQueue::new(waker),
            transport,
            executor,
            exchange_count: AtomicUsize::new(0),
            terminating: Arc::new(AtomicBool::new(false)),
            finished: AtomicBool::new(false),
        });

        let reactor = Reactor::new(poll, listener, Arc::clone(&shared))?;
        let reactor = thread::Builder::new()
            .name("reactor".to_string())
            .spawn(move || reactor.run())?;

        let idle_registry = Arc::clone(&registry);
        let idle_timer = MaintenanceTimer::spawn("idle-sweep", self.config.clock_tick(), move || {
            idle_registry.sweep_idle();
        })?;

        let slow_peer_timer = if self.config.slow_peer_sweep_enabled() {
            let slow_registry = Arc::clone(&registry);
            Some(MaintenanceTimer::spawn(
                "slow-peer-sweep",
                self.config.timer_period(),
                move || {
                    slow_registry.sweep_slow_peers();
                },
            )?)
        } else {
            None
        };

        self.running = Some(Running {
            shared,
            reactor,
            idle_timer,
            slow_peer_timer,
            pool,
        });
        self.started = true;
        info!(scheme = %self.scheme, addr = ?self.local_addr, "server started");
        Ok(())
    }

    /// Deja de aceptar conexiones, espera hasta `grace` a que terminen los
    /// exchanges en curso y cierra todo
    pub fn stop(&mut self, grace: Duration) -> Result<(), ServerError> {
        let running = match self.running.take() {
            Some(running) => running,
            None => {
                // Con bind pero sin start solo hay que soltar el socket
                self.listener = None;
                return Err(ServerError::WrongState("server not running"));
            }
        };
        let Running {
            shared,
            reactor,
            mut idle_timer,
            slow_peer_timer,
            pool,
        } = running;

        info!(grace_ms = grace.as_millis() as u64, "stopping server");
        shared.terminating.store(true, Ordering::Release);
        shared.events.wake();

        let deadline = Instant::now() + grace;
        while shared.exchange_count.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            thread::sleep(STOP_POLL_STEP);
        }

        let in_flight = shared.exchange_count.load(Ordering::SeqCst);
        if in_flight > 0 {
            warn!(in_flight, "grace period elapsed with exchanges in flight");
        }

        shared.finished.store(true, Ordering::Release);
        shared.events.wake();
        if reactor.join().is_err() {
            warn!("reactor thread panicked");
        }
        shared.registry.close_all();

        idle_timer.cancel();
        if let Some(mut timer) = slow_peer_timer {
            timer.cancel();
        }
        // Sin join: un handler colgado no puede retener a stop
        if let Some(pool) = pool {
            pool.shutdown();
        }

        info!("server stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Exchanges en curso (0 si el servidor no corre)
    pub fn active_exchanges(&self) -> usize {
        self.running
            .as_ref()
            .map(|r| r.shared.exchange_count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        if self.running.is_some() {
            let _ = self.stop(Duration::ZERO);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::exchange::Exchange;
    use crate::server::executor::Task;
    use std::io;

    fn noop() -> Arc<dyn Handler> {
        Arc::new(|_: &mut Exchange| -> io::Result<()> { Ok(()) })
    }

    #[test]
    fn test_start_requires_bind() {
        let mut server = HttpServer::http(ServerConfig::default()).unwrap();
        assert!(matches!(server.start(), Err(ServerError::NotBound)));
    }

    #[test]
    fn test_bind_twice_fails() {
        let mut server = HttpServer::http(ServerConfig::default()).unwrap();
        server.bind("127.0.0.1:0", 0).unwrap();
        assert!(server.local_addr().is_some());
        assert!(matches!(
            server.bind("127.0.0.1:0", 0),
            Err(ServerError::AlreadyBound)
        ));
    }

    #[test]
    fn test_bind_with_backlog_accepts_connections() {
        let mut server = HttpServer::http(ServerConfig::default()).unwrap();
        server.bind("127.0.0.1:0", 8).unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        // El kernel completa el handshake aunque nadie haya llamado accept
        let client = std::net::TcpStream::connect(addr);
        assert!(client.is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ServerConfig {
            workers: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(HttpServer::http(config), Err(ServerError::Config(_))));
    }

    #[test]
    fn test_lifecycle_state_errors() {
        let mut server = HttpServer::http(ServerConfig::default()).unwrap();
        server.bind("127.0.0.1:0", 16).unwrap();
        server.start().unwrap();
        assert!(server.is_running());

        assert!(matches!(server.start(), Err(ServerError::WrongState(_))));
        assert!(matches!(
            server.set_executor(Arc::new(|task: Task| task())),
            Err(ServerError::WrongState(_))
        ));

        server.stop(Duration::from_millis(10)).unwrap();
        assert!(!server.is_running());
        assert!(server.stop(Duration::ZERO).is_err());
    }

    #[test]
    fn test_contexts_by_path() {
        let server = HttpServer::http(ServerConfig::default()).unwrap();
        server.create_context("/a", noop()).unwrap();
        assert!(matches!(
            server.create_context("/a", noop()),
            Err(ServerError::ContextExists(_))
        ));
        server.remove_context("/a").unwrap();
        assert!(matches!(
            server.remove_context("/a"),
            Err(ServerError::ContextNotFound(_))
        ));
    }

    #[test]
    fn test_tls_config_only_for_https() {
        let mut server = HttpServer::http(ServerConfig::default()).unwrap();
        let err = server
            .set_tls_config(Arc::new(
                rustls::ServerConfig::builder()
                    .with_no_client_auth()
                    .with_cert_resolver(Arc::new(NoCerts)),
            ))
            .unwrap_err();
        assert!(matches!(err, ServerError::WrongState(_)));
    }

    #[derive(Debug)]
    struct NoCerts;

    impl rustls::server::ResolvesServerCert for NoCerts {
        fn resolve(
            &self,
            _hello: rustls::server::ClientHello<'_>,
        ) -> Option<Arc<rustls::sign::CertifiedKey>> {
            None
        }
    }
}

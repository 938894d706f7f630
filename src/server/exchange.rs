//! # Tarea de Exchange
//! src/server/exchange.rs
//!
//! Procesa un request completo en un worker, con el socket en modo
//! bloqueante:
//!
//! ```text
//! wire → request line → headers → framing → contexto → filtros → handler
//!                                                                  │
//!        reactor ◄── ResponseCompleted ◄── finish() ◄──────────────┘
//! ```
//!
//! Los errores de parseo se contestan aquí mismo con una respuesta mínima
//! y la conexión se cierra; nunca llegan al pipeline.

use super::connection::{lock_wire, Connection, SharedWire};
use super::dispatcher::{Event, ServerShared};
use super::registry::ConnectionRegistry;
use crate::config::ServerConfig;
use crate::error::{ExchangeError, RequestError};
use crate::http::request::{read_headers, read_request_line};
use crate::http::response::{encode_head, error_reply, http_date, CONTINUE_RESPONSE};
use crate::http::status::forbids_body;
use crate::http::{
    BodyDecoder, BodyEncoder, BodyFraming, Headers, RequestLine, ResponseLength, Target,
};
use crate::router::{Chain, HttpContext, LinkHandler};
use crate::transport::TransportMetadata;
use std::any::Any;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, trace};

fn lock<T>(mutex: &Mutex<T>) -> io::Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "exchange state poisoned"))
}

/// Stream de salida para el body de la respuesta
///
/// Los filtros pueden envolverlo; `finish` cierra la cadena de envoltorios
/// de afuera hacia adentro.
pub trait ResponseBody: Write + Send {
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Body de request leído desde el wire
struct RequestStream {
    wire: SharedWire,
    decoder: Arc<Mutex<BodyDecoder>>,
    on_eof: Option<Box<dyn FnOnce() + Send>>,
}

impl Read for RequestStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (n, eof) = {
            let mut decoder = lock(&self.decoder)?;
            let mut wire = lock_wire(&self.wire)?;
            let n = decoder.read(&mut *wire, buf)?;
            (n, decoder.is_eof())
        };
        if eof {
            if let Some(hook) = self.on_eof.take() {
                hook();
            }
        }
        Ok(n)
    }
}

/// Body de respuesta escrito al wire con el encoder elegido al enviar el head
struct WireBody {
    wire: SharedWire,
    encoder: Arc<Mutex<Option<BodyEncoder>>>,
}

impl Write for WireBody {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut encoder = lock(&self.encoder)?;
        match encoder.as_mut() {
            Some(encoder) => {
                let mut wire = lock_wire(&self.wire)?;
                encoder.write(&mut *wire, buf)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "response headers not sent",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        lock_wire(&self.wire)?.flush()
    }
}

impl ResponseBody for WireBody {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut encoder = lock(&self.encoder)?;
        match encoder.as_mut() {
            Some(encoder) => {
                let mut wire = lock_wire(&self.wire)?;
                encoder.finish(&mut *wire)
            }
            None => Ok(()),
        }
    }
}

/// Lugar del body mientras un filtro lo envuelve, y después de `finish`
struct ClosedBody;

impl Write for ClosedBody {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "response body already closed",
        ))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ResponseBody for ClosedBody {
    fn finish(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}

/// Request ya parseado, antes de resolver el contexto
pub(crate) struct ParsedRequest {
    pub line: RequestLine,
    pub target: Target,
    pub headers: Headers,
    pub framing: BodyFraming,
}

fn read_request(
    wire: &SharedWire,
    max_headers: usize,
) -> Result<Option<ParsedRequest>, ExchangeError> {
    let mut wire = lock_wire(wire)?;

    let line = match read_request_line(&mut *wire)? {
        Some(line) => line,
        None => return Ok(None),
    };
    let line = RequestLine::parse(&line)?;
    let target = Target::parse(&line.target)?;
    let headers = read_headers(&mut *wire, max_headers)?;
    let framing = BodyFraming::from_headers(&headers)?;

    Ok(Some(ParsedRequest {
        line,
        target,
        headers,
        framing,
    }))
}

/// Un par request/respuesta visto desde los filtros y el handler
pub struct Exchange {
    conn: Arc<Connection>,
    registry: Arc<ConnectionRegistry>,
    context: Arc<HttpContext>,
    wire: SharedWire,
    metadata: TransportMetadata,
    request: ParsedRequest,
    response_headers: Headers,
    decoder: Arc<Mutex<BodyDecoder>>,
    request_body: Box<dyn Read + Send>,
    encoder: Arc<Mutex<Option<BodyEncoder>>>,
    response_body: Box<dyn ResponseBody>,
    status: Option<u16>,
    close_after_response: bool,
    http10: bool,
    length_indeterminate: bool,
    terminating: Arc<AtomicBool>,
    drain_amount: u64,
    attributes: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Exchange {
    fn assemble(
        conn: Arc<Connection>,
        registry: Arc<ConnectionRegistry>,
        context: Arc<HttpContext>,
        wire: SharedWire,
        request: ParsedRequest,
        terminating: Arc<AtomicBool>,
        config: &ServerConfig,
    ) -> io::Result<Self> {
        let metadata = lock_wire(&wire)?.metadata().clone();
        let http10 = request.line.is_http10();

        // Semántica de keep-alive según versión y header Connection
        let mut response_headers = Headers::new();
        let mut close = request.headers.value_is("Connection", "close")
            || terminating.load(Ordering::Acquire);
        if http10 && !close {
            if !request.headers.contains("Connection") {
                close = true;
            } else if request.headers.value_is("Connection", "keep-alive") {
                response_headers.set("Connection", "keep-alive");
                response_headers.set("Keep-Alive", &config.keep_alive_hint());
            }
        }
        if close {
            response_headers.set("Connection", "close");
        }

        let decoder = Arc::new(Mutex::new(BodyDecoder::new(request.framing)));
        let on_eof: Option<Box<dyn FnOnce() + Send>> = match request.framing {
            BodyFraming::Empty => {
                registry.request_completed(&conn);
                None
            }
            _ => {
                let registry = Arc::clone(&registry);
                let conn = Arc::clone(&conn);
                Some(Box::new(move || registry.request_completed(&conn)))
            }
        };
        let request_body = Box::new(RequestStream {
            wire: Arc::clone(&wire),
            decoder: Arc::clone(&decoder),
            on_eof,
        });

        let encoder = Arc::new(Mutex::new(None));
        let response_body = Box::new(WireBody {
            wire: Arc::clone(&wire),
            encoder: Arc::clone(&encoder),
        });

        Ok(Self {
            conn,
            registry,
            context,
            wire,
            metadata,
            request,
            response_headers,
            decoder,
            request_body,
            encoder,
            response_body,
            status: None,
            close_after_response: close,
            http10,
            length_indeterminate: false,
            terminating,
            drain_amount: config.drain_amount,
            attributes: HashMap::new(),
        })
    }

    pub fn request_method(&self) -> &str {
        &self.request.line.method
    }

    /// Target tal como llegó en la request line
    pub fn request_uri(&self) -> &str {
        &self.request.line.target
    }

    /// Path ya decodificado
    pub fn request_path(&self) -> &str {
        &self.request.target.path
    }

    pub fn request_query(&self) -> Option<&str> {
        self.request.target.query.as_deref()
    }

    /// Versión del request, por ejemplo `HTTP/1.1`
    pub fn protocol(&self) -> &str {
        &self.request.line.version
    }

    pub fn is_http10(&self) -> bool {
        self.http10
    }

    pub fn request_headers(&self) -> &Headers {
        &self.request.headers
    }

    /// Framing del body del request
    pub fn request_framing(&self) -> BodyFraming {
        self.request.framing
    }

    pub fn response_headers(&self) -> &Headers {
        &self.response_headers
    }

    /// Headers de la respuesta; los cambios posteriores al head no se envían
    pub fn response_headers_mut(&mut self) -> &mut Headers {
        &mut self.response_headers
    }

    pub fn request_body(&mut self) -> &mut (dyn Read + Send) {
        self.request_body.as_mut()
    }

    /// Stream del body; escribir antes de `send_response_headers` falla
    pub fn response_body(&mut self) -> &mut dyn ResponseBody {
        self.response_body.as_mut()
    }

    /// Código enviado, si el head ya salió
    pub fn response_code(&self) -> Option<u16> {
        self.status
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn http_context(&self) -> &Arc<HttpContext> {
        &self.context
    }

    pub fn transport_metadata(&self) -> &TransportMetadata {
        &self.metadata
    }

    pub fn attribute(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.attributes.get(name).cloned()
    }

    pub fn set_attribute(&mut self, name: &str, value: Arc<dyn Any + Send + Sync>) {
        self.attributes.insert(name.to_string(), value);
    }

    /// La conexión se cierra después de esta respuesta
    pub fn will_close(&self) -> bool {
        self.close_after_response
    }

    pub fn set_close_after_response(&mut self) {
        self.close_after_response = true;
    }

    /// Un filtro transforma el body: un `Fixed(n)` posterior pasa a `Unknown`
    pub fn mark_length_indeterminate(&mut self) {
        self.length_indeterminate = true;
    }

    pub fn wrap_request_body<F>(&mut self, wrap: F)
    where
        F: FnOnce(Box<dyn Read + Send>) -> Box<dyn Read + Send>,
    {
        let inner = mem::replace(&mut self.request_body, Box::new(io::empty()));
        self.request_body = wrap(inner);
    }

    pub fn wrap_response_body<F>(&mut self, wrap: F)
    where
        F: FnOnce(Box<dyn ResponseBody>) -> Box<dyn ResponseBody>,
    {
        let inner = mem::replace(&mut self.response_body, Box::new(ClosedBody));
        self.response_body = wrap(inner);
    }

    /// Envía status line y headers, y fija el framing del body
    pub fn send_response_headers(
        &mut self,
        status: impl Into<u16>,
        length: ResponseLength,
    ) -> io::Result<()> {
        if self.status.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "response headers already sent",
            ));
        }
        let code = status.into();

        let length = match length {
            ResponseLength::Fixed(_) if self.length_indeterminate => ResponseLength::Unknown,
            other => other,
        };

        let head_request = self.request.line.method.eq_ignore_ascii_case("HEAD");
        let encoder = if forbids_body(code) {
            self.response_headers.remove("Content-Length");
            self.response_headers.remove("Transfer-Encoding");
            BodyEncoder::empty()
        } else if head_request {
            if let ResponseLength::Fixed(n) = length {
                self.response_headers.set("Content-Length", &n.to_string());
            }
            BodyEncoder::empty()
        } else {
            match length {
                ResponseLength::Empty => {
                    self.response_headers.set("Content-Length", "0");
                    BodyEncoder::empty()
                }
                ResponseLength::Fixed(n) => {
                    self.response_headers.set("Content-Length", &n.to_string());
                    BodyEncoder::fixed(n)
                }
                ResponseLength::Unknown if self.http10 => {
                    // HTTP/1.0 no tiene chunked: el cierre marca el final
                    self.close_after_response = true;
                    self.response_headers.remove("Content-Length");
                    BodyEncoder::until_close()
                }
                ResponseLength::Unknown => {
                    self.response_headers.remove("Content-Length");
                    self.response_headers.set("Transfer-Encoding", "chunked");
                    BodyEncoder::chunked()
                }
            }
        };

        if self.terminating.load(Ordering::Acquire) {
            self.close_after_response = true;
        }
        if self.close_after_response {
            self.response_headers.remove("Keep-Alive");
            self.response_headers.set("Connection", "close");
        }
        // Sin body no hay nada codificado
        if forbids_body(code) || (!head_request && matches!(length, ResponseLength::Empty)) {
            self.response_headers.remove("Content-Encoding");
        }
        if !self.response_headers.contains("Date") {
            self.response_headers.set("Date", &http_date());
        }

        let bodyless = matches!(length, ResponseLength::Empty) || head_request || forbids_body(code);
        {
            let mut wire = lock_wire(&self.wire)?;
            wire.write_all(&encode_head(code, &self.response_headers))?;
            if bodyless {
                wire.flush()?;
            }
        }

        *lock(&self.encoder)? = Some(encoder);
        self.status = Some(code);
        self.registry.request_completed(&self.conn);
        Ok(())
    }

    /// Cierra el body, descarta lo que quede del request y devuelve el wire
    /// a la conexión
    ///
    /// Retorna si la conexión debe cerrarse.
    pub(crate) fn finish(mut self) -> io::Result<bool> {
        if self.status.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "handler returned without sending response headers",
            ));
        }

        let body = mem::replace(&mut self.response_body, Box::new(ClosedBody));
        body.finish()?;

        let drained = {
            let mut decoder = lock(&self.decoder)?;
            let mut wire = lock_wire(&self.wire)?;
            decoder.drain(&mut *wire, self.drain_amount)
        };
        match drained {
            Ok(true) => {}
            Ok(false) => {
                debug!(conn = self.conn.id(), "unread request body exceeds drain limit");
                self.close_after_response = true;
            }
            Err(e) => {
                trace!(conn = self.conn.id(), error = %e, "draining request body failed");
                self.close_after_response = true;
            }
        }

        if self.close_after_response {
            // En TLS sale el close_notify antes de que el reactor corte el socket
            lock_wire(&self.wire)?.close();
        } else {
            self.conn.cache_wire(Arc::clone(&self.wire));
        }
        Ok(self.close_after_response)
    }
}

/// Avisa al reactor que el exchange terminó, aunque sea por error o panic
struct CompletionGuard<'a> {
    conn: &'a Arc<Connection>,
    shared: &'a ServerShared,
    posted: bool,
}

impl<'a> CompletionGuard<'a> {
    fn new(conn: &'a Arc<Connection>, shared: &'a ServerShared) -> Self {
        shared.exchange_count.fetch_add(1, Ordering::SeqCst);
        Self {
            conn,
            shared,
            posted: false,
        }
    }

    fn complete(mut self, close: bool) {
        self.post(close);
    }

    fn post(&mut self, close: bool) {
        if self.posted {
            return;
        }
        self.posted = true;
        self.shared.events.post(Event::ResponseCompleted {
            conn: Arc::clone(self.conn),
            close,
        });
    }
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.post(true);
    }
}

/// Trabajo entregado al executor por cada conexión lista
pub(crate) struct ExchangeTask {
    conn: Arc<Connection>,
    shared: Arc<ServerShared>,
}

impl ExchangeTask {
    pub(crate) fn new(conn: Arc<Connection>, shared: Arc<ServerShared>) -> Self {
        Self { conn, shared }
    }

    /// Nunca propaga errores ni panics: en ambos casos se cierra la conexión
    pub(crate) fn run(self) {
        let conn = Arc::clone(&self.conn);
        let registry = Arc::clone(&self.shared.registry);

        match panic::catch_unwind(AssertUnwindSafe(|| self.process())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(conn = conn.id(), error = %e, "exchange failed");
                registry.close(&conn);
            }
            Err(_) => {
                error!(conn = conn.id(), "panic while processing exchange");
                registry.close(&conn);
            }
        }
    }

    fn process(&self) -> Result<(), ExchangeError> {
        let shared = &self.shared;

        // 1. Wire cacheado o uno nuevo
        let wire = match self.conn.take_wire() {
            Some(wire) => wire,
            None => Arc::new(Mutex::new(shared.transport.open(self.conn.socket())?)),
        };

        // 2-4. Request line, headers y framing
        let request = match read_request(&wire, shared.config.max_req_headers) {
            Ok(Some(request)) => request,
            Ok(None) => {
                trace!(conn = self.conn.id(), "peer closed connection");
                shared.registry.close(&self.conn);
                return Ok(());
            }
            Err(ExchangeError::Rejected(e)) => {
                self.reject(&wire, &e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // 5. Contexto y handler
        let context = match shared
            .router
            .resolve(shared.transport.scheme(), &request.target.path)
        {
            Some(context) => context,
            None => {
                self.reject(&wire, &RequestError::RoutingMiss);
                return Ok(());
            }
        };
        let handler = match context.handler() {
            Some(handler) => handler,
            None => {
                self.reject(&wire, &RequestError::NoHandler);
                return Ok(());
            }
        };
        self.conn.set_context(&context);

        trace!(
            conn = self.conn.id(),
            method = %request.line.method,
            path = %request.target.path,
            "dispatching request"
        );

        // 6. Exchange
        let expect_continue = request.headers.value_is("Expect", "100-continue");
        let guard = CompletionGuard::new(&self.conn, shared);
        let mut exchange = Exchange::assemble(
            Arc::clone(&self.conn),
            Arc::clone(&shared.registry),
            Arc::clone(&context),
            Arc::clone(&wire),
            request,
            Arc::clone(&shared.terminating),
            &shared.config,
        )?;

        // 7. 100-continue antes de que el handler lea el body
        if expect_continue {
            let mut wire = lock_wire(&wire)?;
            wire.write_all(CONTINUE_RESPONSE)?;
            wire.flush()?;
        }

        // 8. Filtros de usuario → filtros de sistema → handler
        let filters = context.filters();
        let system_filters = context.system_filters();
        let system_chain = Chain::new(&system_filters, handler.as_ref());
        let link = LinkHandler::new(system_chain);
        Chain::new(&filters, &link).do_filter(&mut exchange)?;

        // 9. Cierre del exchange
        let close = exchange.finish()?;
        guard.complete(close);
        Ok(())
    }

    /// Respuesta sintetizada para un request inválido, y cierre
    fn reject(&self, wire: &SharedWire, error: &RequestError) {
        let code = error.status().as_u16();
        debug!(conn = self.conn.id(), code, reason = %error, "rejecting request");

        if let Ok(mut wire) = lock_wire(wire) {
            let _ = wire.write_all(&error_reply(code, &error.to_string()));
            wire.close();
        }
        self.shared.registry.close(&self.conn);
    }
}

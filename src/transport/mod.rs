//! # Transporte
//! src/transport/mod.rs
//!
//! Convierte un socket aceptado en un par de streams de texto plano
//! (el "wire"). El dispatcher y las tareas de exchange tratan igual un
//! socket plano y uno TLS una vez abierto.
//!
//! ```text
//! TcpStream ──open()──► Wire { reader: BufReader, writer, metadata }
//! ```

pub mod tls;

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};

pub use tls::{load_server_config, TlsTransport};

/// Tamaño del buffer de lectura del wire
const READ_BUFFER: usize = 8 * 1024;

/// Protocolo servido por un socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Datos del transporte visibles para los handlers
#[derive(Debug, Clone)]
pub struct TransportMetadata {
    pub scheme: Scheme,
    pub peer_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
}

impl TransportMetadata {
    fn of(socket: &TcpStream, scheme: Scheme) -> Self {
        Self {
            scheme,
            peer_addr: socket.peer_addr().ok(),
            local_addr: socket.local_addr().ok(),
        }
    }
}

/// Streams abiertos sobre un socket
pub struct Wire {
    reader: BufReader<Box<dyn Read + Send>>,
    writer: Box<dyn Write + Send>,
    metadata: TransportMetadata,
    tls: Option<tls::SharedTlsStream>,
}

impl Wire {
    /// Arma un wire a partir de un reader y un writer ya separados
    pub fn new(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        metadata: TransportMetadata,
    ) -> Self {
        Self {
            reader: BufReader::with_capacity(READ_BUFFER, reader),
            writer,
            metadata,
            tls: None,
        }
    }

    /// Sesión TLS compartida por las dos mitades del wire
    pub(crate) fn with_tls_session(mut self, session: tls::SharedTlsStream) -> Self {
        self.tls = Some(session);
        self
    }

    pub fn reader(&mut self) -> &mut BufReader<Box<dyn Read + Send>> {
        &mut self.reader
    }

    pub fn writer(&mut self) -> &mut (dyn Write + Send) {
        self.writer.as_mut()
    }

    pub fn metadata(&self) -> &TransportMetadata {
        &self.metadata
    }

    /// Hay bytes de un siguiente request ya leídos del socket
    ///
    /// Permite al dispatcher re-despachar una conexión con pipelining sin
    /// esperar otra notificación del multiplexor: esos bytes ya no van a
    /// disparar readiness.
    pub fn has_buffered_data(&self) -> bool {
        if !self.reader.buffer().is_empty() {
            return true;
        }
        match &self.tls {
            Some(session) => tls::plaintext_pending(session),
            None => false,
        }
    }

    /// Vacía el writer y en TLS envía `close_notify`
    ///
    /// Los errores se ignoran: el socket se cierra igual.
    pub fn close(&mut self) {
        if let Some(session) = &self.tls {
            tls::send_close_notify(session);
        }
        let _ = self.writer.flush();
    }
}

impl fmt::Debug for Wire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wire")
            .field("metadata", &self.metadata)
            .field("buffered", &self.reader.buffer().len())
            .finish()
    }
}

impl Read for Wire {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl BufRead for Wire {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.reader.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.reader.consume(amt)
    }
}

impl Write for Wire {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Adaptador de transporte: abre el wire de un socket recién despachado
pub trait Transport: Send + Sync {
    fn scheme(&self) -> Scheme;

    /// Se llama en un worker con el socket ya en modo bloqueante
    fn open(&self, socket: &TcpStream) -> io::Result<Wire>;
}

/// Transporte TCP sin cifrar
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTransport;

impl Transport for PlainTransport {
    fn scheme(&self) -> Scheme {
        Scheme::Http
    }

    fn open(&self, socket: &TcpStream) -> io::Result<Wire> {
        let reader = socket.try_clone()?;
        let writer = socket.try_clone()?;
        Ok(Wire::new(
            Box::new(reader),
            Box::new(writer),
            TransportMetadata::of(socket, Scheme::Http),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::TcpListener;

    fn wire_over(bytes: &[u8]) -> Wire {
        Wire::new(
            Box::new(Cursor::new(bytes.to_vec())),
            Box::new(Vec::new()),
            TransportMetadata {
                scheme: Scheme::Http,
                peer_addr: None,
                local_addr: None,
            },
        )
    }

    #[test]
    fn test_has_buffered_data() {
        let mut wire = wire_over(b"GET / HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\n");
        assert!(!wire.has_buffered_data());

        let mut line = String::new();
        wire.read_line(&mut line).unwrap();
        assert_eq!(line, "GET / HTTP/1.1\r\n");
        assert!(wire.has_buffered_data());
    }

    #[test]
    fn test_plain_transport_open() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let mut wire = PlainTransport.open(&server_side).unwrap();
        assert_eq!(wire.metadata().scheme, Scheme::Http);
        assert_eq!(wire.metadata().local_addr, Some(addr));

        (&client).write_all(b"ping\n").unwrap();
        let mut line = String::new();
        wire.read_line(&mut line).unwrap();
        assert_eq!(line, "ping\n");
    }

    #[test]
    fn test_scheme_display() {
        assert_eq!(Scheme::Http.to_string(), "http");
        assert_eq!(Scheme::Https.as_str(), "https");
    }
}

//! # Transporte TLS
//! src/transport/tls.rs
//!
//! Envuelve el socket aceptado en una sesión rustls. El handshake se hace
//! de forma perezosa en el primer read del worker, con el socket ya en
//! modo bloqueante.

use super::{Scheme, Transport, TransportMetadata, Wire};
use crate::error::ServerError;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub(crate) type SharedTlsStream = Arc<Mutex<StreamOwned<ServerConnection, TcpStream>>>;

/// Carga certificado y llave privada en formato PEM
pub fn load_server_config(cert: &Path, key: &Path) -> Result<Arc<ServerConfig>, ServerError> {
    let certs = CertificateDer::pem_file_iter(cert)
        .map_err(|e| ServerError::Tls(format!("{}: {}", cert.display(), e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("{}: {}", cert.display(), e)))?;

    if certs.is_empty() {
        return Err(ServerError::Tls(format!(
            "{}: no certificates found",
            cert.display()
        )));
    }

    let key = PrivateKeyDer::from_pem_file(key)
        .map_err(|e| ServerError::Tls(format!("{}: {}", key.display(), e)))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Transporte HTTPS
///
/// Sin configuración TLS el servidor arranca igual, pero cada conexión
/// falla al abrirse.
#[derive(Default)]
pub struct TlsTransport {
    config: Option<Arc<ServerConfig>>,
}

impl TlsTransport {
    pub fn new(config: Option<Arc<ServerConfig>>) -> Self {
        Self { config }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }
}

impl Transport for TlsTransport {
    fn scheme(&self) -> Scheme {
        Scheme::Https
    }

    fn open(&self, socket: &TcpStream) -> io::Result<Wire> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "No SSL context established"))?;

        let conn = ServerConnection::new(config)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let session: SharedTlsStream =
            Arc::new(Mutex::new(StreamOwned::new(conn, socket.try_clone()?)));

        let metadata = TransportMetadata::of(socket, Scheme::Https);
        let wire = Wire::new(
            Box::new(TlsHalf(Arc::clone(&session))),
            Box::new(TlsHalf(Arc::clone(&session))),
            metadata,
        );
        Ok(wire.with_tls_session(session))
    }
}

/// Mitad de lectura o escritura sobre la sesión compartida
struct TlsHalf(SharedTlsStream);

impl TlsHalf {
    fn lock(&self) -> io::Result<MutexGuard<'_, StreamOwned<ServerConnection, TcpStream>>> {
        self.0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "tls session poisoned"))
    }
}

impl Read for TlsHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.lock()?.read(buf)
    }
}

impl Write for TlsHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.flush()
    }
}

/// Texto plano ya descifrado que todavía nadie leyó
pub(crate) fn plaintext_pending(session: &SharedTlsStream) -> bool {
    match session.lock() {
        Ok(mut stream) => stream
            .conn
            .process_new_packets()
            .map(|state| state.plaintext_bytes_to_read() > 0)
            .unwrap_or(false),
        Err(_) => false,
    }
}

pub(crate) fn send_close_notify(session: &SharedTlsStream) {
    if let Ok(mut stream) = session.lock() {
        stream.conn.send_close_notify();
        let _ = stream.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_open_without_config_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let transport = TlsTransport::default();
        assert!(!transport.is_configured());
        assert_eq!(transport.scheme(), Scheme::Https);

        let err = transport.open(&server_side).unwrap_err();
        assert_eq!(err.to_string(), "No SSL context established");
    }

    #[test]
    fn test_load_missing_files() {
        let result = load_server_config(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        );
        assert!(matches!(result, Err(ServerError::Tls(_))));
    }
}

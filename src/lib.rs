//! # Reactor HTTP
//! src/lib.rs
//!
//! Servidor HTTP/HTTPS embebible: un reactor mio multiplexa muchas
//! conexiones y las reparte entre un pool pequeño de workers que procesan
//! cada request de forma bloqueante. El servidor maneja el ciclo de vida de
//! las conexiones: keep-alive, expiración de idle, límites de tiempo por
//! request y respuesta, y apagado ordenado.
//!
//! ## Arquitectura
//!
//! El servidor está dividido en módulos especializados:
//! - `http`: Parsing y serialización del protocolo HTTP/1.x
//! - `server`: Reactor, registro de conexiones, exchanges y facade
//! - `router`: Contextos, filtros y handlers
//! - `transport`: Sockets planos y TLS (rustls)
//! - `config`: Configuración por CLI, entorno o JSON
//! - `clock`: Fuente de tiempo inyectable
//! - `error`: Tipos de error
//!
//! ## Ejemplo de uso
//!
//! ```no_run
//! use reactor_http::config::ServerConfig;
//! use reactor_http::http::ResponseLength;
//! use reactor_http::server::{Exchange, HttpServer};
//! use std::io::Write;
//! use std::sync::Arc;
//!
//! let mut server = HttpServer::http(ServerConfig::default()).unwrap();
//! server.bind("127.0.0.1:8080", 0).unwrap();
//! server
//!     .create_context("/hello", Arc::new(|ex: &mut Exchange| {
//!         ex.send_response_headers(200u16, ResponseLength::Fixed(5))?;
//!         ex.response_body().write_all(b"hello")
//!     }))
//!     .unwrap();
//! server.start().unwrap();
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod router;
pub mod server;
pub mod transport;

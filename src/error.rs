//! # Errores del Servidor
//! src/error.rs
//!
//! Tres familias de errores:
//!
//! - [`ServerError`]: ciclo de vida del facade (bind/start/stop, contextos)
//! - [`RequestError`]: rechazos durante el parseo de un request; cada uno
//!   se traduce a una respuesta sintetizada antes de cerrar la conexión
//! - [`ConfigError`]: configuración inválida
//! - [`RejectedExecution`]: el executor no aceptó una tarea
//!
//! Los errores de transporte (lecturas/escrituras) viajan como `io::Error`
//! y nunca llegan al código de la aplicación.

use crate::http::StatusCode;
use std::io;
use thiserror::Error;

/// Errores del facade del servidor
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server already bound")]
    AlreadyBound,

    #[error("server not bound")]
    NotBound,

    #[error("server in wrong state: {0}")]
    WrongState(&'static str),

    #[error("context already exists: {0}")]
    ContextExists(String),

    #[error("context not found: {0}")]
    ContextNotFound(String),

    #[error("invalid context path: {0}")]
    InvalidPath(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Rechazos detectados antes de que exista un Exchange
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// Falta un separador en la request line
    #[error("Bad request line")]
    MalformedRequestLine,

    /// Target con sintaxis inválida o escapes `%` rotos
    #[error("Invalid request target")]
    InvalidTarget,

    /// `Content-Length` no numérico
    #[error("Malformed Content-Length")]
    MalformedLength,

    /// Línea de header sin `:` o demasiado larga
    #[error("Malformed header line")]
    MalformedHeader,

    /// Más headers de los permitidos
    #[error("Too many request headers")]
    TooManyHeaders,

    /// Ningún contexto para (scheme, path)
    #[error("No context found for request")]
    RoutingMiss,

    /// Contexto sin handler asociado
    #[error("No handler for context")]
    NoHandler,
}

impl RequestError {
    /// Código de estado de la respuesta sintetizada
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::MalformedRequestLine
            | RequestError::InvalidTarget
            | RequestError::MalformedLength
            | RequestError::MalformedHeader
            | RequestError::TooManyHeaders => StatusCode::BadRequest,
            RequestError::RoutingMiss => StatusCode::NotFound,
            RequestError::NoHandler => StatusCode::InternalServerError,
        }
    }
}

/// Resultado de la fase de parseo dentro de una tarea de exchange
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Fallo del transporte: la conexión se cierra sin respuesta
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// Violación de protocolo: se responde con un error y se cierra
    #[error("request rejected: {0}")]
    Rejected(#[from] RequestError),
}

/// El executor rechazó una tarea (pool apagado o saturado)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task rejected: {reason}")]
pub struct RejectedExecution {
    pub reason: String,
}

impl RejectedExecution {
    pub fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }
}

/// Errores de validación de [`crate::config::ServerConfig`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be >= 1")]
    MustBePositive(&'static str),

    #[error("{0} must be -1 (disabled) or >= 0")]
    InvalidTimeout(&'static str),

    #[error("https requires both tls_cert and tls_key")]
    IncompleteTls,

    #[error("cannot parse configuration: {0}")]
    Parse(String),
}

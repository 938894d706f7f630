//! # Módulo HTTP
//!
//! Piezas del protocolo HTTP/1.x que usa el dispatcher, implementadas
//! sobre streams bloqueantes:
//!
//! - Lectura de la request line y los headers
//! - Framing del body (`Content-Length`, chunked)
//! - Serialización del head de la respuesta y respuestas de error
//! - Códigos de estado
//!
//! ### Formato de Request
//!
//! ```text
//! GET /path?query=value HTTP/1.1\r\n
//! Host: localhost\r\n
//! \r\n
//! ```

pub mod body; // Framing de bodies de request y respuesta
pub mod headers; // Mapa de headers insensible a mayúsculas
pub mod request; // Request line, headers y framing
pub mod response; // Head de respuestas y respuestas sintetizadas
pub mod status; // Códigos de estado HTTP

pub use body::{BodyDecoder, BodyEncoder, ResponseLength};
pub use headers::Headers;
pub use request::{BodyFraming, RequestLine, Target};
pub use status::StatusCode;

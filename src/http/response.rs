//! # Construcción de Respuestas HTTP
//!
//! Serialización del head de una respuesta y de las respuestas que el
//! servidor sintetiza por su cuenta (rechazos y `100 Continue`).
//!
//! ## Formato
//!
//! ```text
//! HTTP/1.1 200 OK\r\n
//! Date: Mon, 19 Oct 2026 10:00:00 GMT\r\n
//! Content-Length: 13\r\n
//! \r\n
//! {"ok": true}
//! ```
//!
//! ## Ejemplo de uso
//!
//! ```
//! use reactor_http::http::response::error_reply;
//!
//! let bytes = error_reply(404, "No context found for request");
//! let text = String::from_utf8(bytes).unwrap();
//! assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
//! ```

use super::status::reason_phrase;
use super::Headers;
use std::time::SystemTime;

/// Respuesta interina para `Expect: 100-continue`
pub const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Status line: `HTTP/1.1 <code> <reason>\r\n`
pub fn status_line(code: u16) -> String {
    format!("HTTP/1.1 {} {}\r\n", code, reason_phrase(code))
}

/// Valor actual para el header `Date`
pub fn http_date() -> String {
    httpdate::fmt_http_date(SystemTime::now())
}

/// Serializa status line + headers + línea vacía
pub fn encode_head(code: u16, headers: &Headers) -> Vec<u8> {
    let mut result = Vec::with_capacity(256);

    // 1. Status line
    result.extend_from_slice(status_line(code).as_bytes());

    // 2. Headers
    for (name, value) in headers.iter() {
        result.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }

    // 3. Línea vacía que separa headers del body
    result.extend_from_slice(b"\r\n");

    result
}

/// Respuesta mínima de error con body HTML
///
/// Siempre anuncia `Connection: close`: quien la envía cierra el socket
/// justo después.
pub fn error_reply(code: u16, message: &str) -> Vec<u8> {
    let body = format!("<h1>{} {}</h1>{}", code, reason_phrase(code), message);

    let mut headers = Headers::new();
    headers.add("Content-Length", &body.len().to_string());
    headers.add("Content-Type", "text/html");
    headers.add("Connection", "close");

    let mut result = encode_head(code, &headers);
    result.extend_from_slice(body.as_bytes());
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_line() {
        assert_eq!(status_line(200), "HTTP/1.1 200 OK\r\n");
        assert_eq!(status_line(400), "HTTP/1.1 400 Bad Request\r\n");
    }

    #[test]
    fn test_encode_head() {
        let mut headers = Headers::new();
        headers.add("Content-Type", "text/plain");
        headers.add("Content-Length", "4");

        let text = String::from_utf8(encode_head(200, &headers)).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.ends_with("Content-Length: 4\r\n\r\n"));
    }

    #[test]
    fn test_error_reply() {
        let text = String::from_utf8(error_reply(400, "Bad request line")).unwrap();
        let body = "<h1>400 Bad Request</h1>Bad request line";

        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains(&format!("Content-Length: {}\r\n", body.len())));
        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with(body));
    }

    #[test]
    fn test_http_date_format() {
        let date = http_date();
        assert!(date.ends_with("GMT"));
    }
}

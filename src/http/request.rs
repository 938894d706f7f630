//! # Parsing de Requests HTTP/1.x
//! src/http/request.rs
//!
//! Lectura incremental del head de un request desde un stream bloqueante.
//!
//! ## Formato de un Request
//!
//! ```text
//! GET /path?param1=value1 HTTP/1.1\r\n
//! Host: localhost:8080\r\n
//! Content-Length: 5\r\n
//! \r\n
//! hello
//! ```
//!
//! ## Componentes
//!
//! 1. **Request Line**: `METHOD target VERSION`, separados por un espacio
//! 2. **Headers**: Pares `Name: Value` hasta la línea vacía
//! 3. **Framing del body**: `Transfer-Encoding: chunked`, `Content-Length` o vacío

use super::Headers;
use crate::error::{ExchangeError, RequestError};
use std::io::{self, BufRead, Read};

/// Longitud máxima de una línea del head (request line o header)
pub const MAX_LINE: usize = 8 * 1024;

/// Resultado de leer una línea terminada en CRLF
#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    /// El peer cerró antes de enviar un byte
    Eof,
    /// Línea sin el terminador
    Text(String),
    /// La línea excede [`MAX_LINE`]
    TooLong,
}

/// Lee una línea terminada en `\n` (el `\r` previo se descarta)
///
/// Los bytes se interpretan como ISO-8859-1, igual que en el wire.
pub fn read_line<R: BufRead + ?Sized>(src: &mut R) -> io::Result<Line> {
    let mut raw = Vec::new();
    let mut limited = src.take(MAX_LINE as u64 + 1);
    limited.read_until(b'\n', &mut raw)?;

    if raw.is_empty() {
        return Ok(Line::Eof);
    }
    if raw.last() == Some(&b'\n') {
        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
    } else if raw.len() > MAX_LINE {
        return Ok(Line::TooLong);
    }

    Ok(Line::Text(raw.iter().map(|&b| b as char).collect()))
}

/// Request line ya separada en sus tres partes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
}

impl RequestLine {
    /// Separa `METHOD target VERSION`
    ///
    /// # Ejemplo
    /// ```
    /// use reactor_http::http::request::RequestLine;
    ///
    /// let line = RequestLine::parse("GET /echo HTTP/1.1").unwrap();
    /// assert_eq!(line.method, "GET");
    /// assert_eq!(line.target, "/echo");
    /// assert_eq!(line.version, "HTTP/1.1");
    /// assert!(RequestLine::parse("BADLINE").is_err());
    /// ```
    pub fn parse(line: &str) -> Result<Self, RequestError> {
        let (method, rest) = line
            .split_once(' ')
            .ok_or(RequestError::MalformedRequestLine)?;
        let (target, version) = rest
            .split_once(' ')
            .ok_or(RequestError::MalformedRequestLine)?;

        Ok(RequestLine {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
        })
    }

    /// HTTP/1.0 (comparación sin mayúsculas)
    pub fn is_http10(&self) -> bool {
        self.version.eq_ignore_ascii_case("HTTP/1.0")
    }
}

/// Target del request: path decodificado y query sin decodificar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub path: String,
    pub query: Option<String>,
}

impl Target {
    /// Acepta origin-form (`/a/b?q`), absolute-form (`http://host/a`) y `*`
    pub fn parse(target: &str) -> Result<Self, RequestError> {
        if target.bytes().any(|b| b.is_ascii_control()) {
            return Err(RequestError::InvalidTarget);
        }

        // El fragmento nunca se envía al servidor, pero si llega se ignora
        let target = target.split('#').next().unwrap_or_default();

        let origin = if target == "*" {
            return Ok(Target {
                path: "*".to_string(),
                query: None,
            });
        } else if target.starts_with('/') {
            target
        } else if let Some(rest) = strip_scheme(target) {
            match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => match rest.find('?') {
                    Some(q) => &rest[q..],
                    None => "",
                },
            }
        } else {
            return Err(RequestError::InvalidTarget);
        };

        let (raw_path, query) = match origin.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (origin, None),
        };
        let raw_path = if raw_path.is_empty() { "/" } else { raw_path };
        let path = percent_decode(raw_path).ok_or(RequestError::InvalidTarget)?;

        Ok(Target { path, query })
    }
}

fn strip_scheme(target: &str) -> Option<&str> {
    let (scheme, rest) = target.split_once("://")?;
    let valid = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if valid && !rest.is_empty() {
        Some(rest)
    } else {
        None
    }
}

/// Decodifica escapes `%XX`; `None` si un escape está incompleto o el
/// resultado no es UTF-8
pub fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).ok()
}

/// Lee la request line saltando líneas vacías previas
///
/// `Ok(None)` significa que el peer cerró sin enviar un request.
pub fn read_request_line<R: BufRead + ?Sized>(src: &mut R) -> Result<Option<String>, ExchangeError> {
    loop {
        match read_line(src)? {
            Line::Eof => return Ok(None),
            Line::TooLong => return Err(RequestError::MalformedRequestLine.into()),
            Line::Text(line) if line.is_empty() => continue,
            Line::Text(line) => return Ok(Some(line)),
        }
    }
}

/// Lee los headers hasta la línea vacía
pub fn read_headers<R: BufRead + ?Sized>(
    src: &mut R,
    max_headers: usize,
) -> Result<Headers, ExchangeError> {
    let mut headers = Headers::new();

    loop {
        let line = match read_line(src)? {
            Line::Eof => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside request headers",
                )
                .into())
            }
            Line::TooLong => return Err(RequestError::MalformedHeader.into()),
            Line::Text(line) => line,
        };

        if line.is_empty() {
            return Ok(headers);
        }

        // Continuación obsoleta (obs-fold)
        if line.starts_with(' ') || line.starts_with('\t') {
            if !headers.extend_last(&line) {
                return Err(RequestError::MalformedHeader.into());
            }
            continue;
        }

        let (name, value) = line
            .split_once(':')
            .ok_or(RequestError::MalformedHeader)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(RequestError::MalformedHeader.into());
        }
        if headers.len() >= max_headers {
            return Err(RequestError::TooManyHeaders.into());
        }
        headers.append_raw(name.to_string(), value.trim().to_string());
    }
}

/// Cómo se delimita el body del request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// Sin body
    Empty,
    /// `Content-Length: n` con n > 0
    Fixed(u64),
    /// `Transfer-Encoding: chunked`; longitud indeterminada
    Chunked,
}

impl BodyFraming {
    /// `chunked` tiene prioridad sobre `Content-Length`
    pub fn from_headers(headers: &Headers) -> Result<Self, RequestError> {
        let chunked = headers
            .get("Transfer-Encoding")
            .map(|te| {
                te.split(',')
                    .last()
                    .map(|last| last.trim().eq_ignore_ascii_case("chunked"))
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        if chunked {
            return Ok(BodyFraming::Chunked);
        }

        match headers.get("Content-Length") {
            None => Ok(BodyFraming::Empty),
            Some(raw) => {
                let length: u64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| RequestError::MalformedLength)?;
                if length == 0 {
                    Ok(BodyFraming::Empty)
                } else {
                    Ok(BodyFraming::Fixed(length))
                }
            }
        }
    }

    /// Longitud declarada; `None` para chunked
    pub fn declared_length(&self) -> Option<u64> {
        match self {
            BodyFraming::Empty => Some(0),
            BodyFraming::Fixed(n) => Some(*n),
            BodyFraming::Chunked => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn headers_of(raw: &str) -> Headers {
        read_headers(&mut Cursor::new(raw.as_bytes().to_vec()), 200).unwrap()
    }

    // ==================== Request line ====================

    #[test]
    fn test_parse_request_line() {
        let line = RequestLine::parse("POST /upload?x=1 HTTP/1.0").unwrap();
        assert_eq!(line.method, "POST");
        assert_eq!(line.target, "/upload?x=1");
        assert!(line.is_http10());
    }

    #[test]
    fn test_request_line_missing_delimiters() {
        assert_eq!(RequestLine::parse("BADLINE"), Err(RequestError::MalformedRequestLine));
        assert_eq!(RequestLine::parse("GET /only"), Err(RequestError::MalformedRequestLine));
    }

    #[test]
    fn test_read_request_line_skips_blank_lines() {
        let mut src = Cursor::new(b"\r\n\r\nGET / HTTP/1.1\r\n".to_vec());
        let line = read_request_line(&mut src).unwrap();
        assert_eq!(line.as_deref(), Some("GET / HTTP/1.1"));
    }

    #[test]
    fn test_read_request_line_eof() {
        let mut src = Cursor::new(Vec::new());
        assert!(read_request_line(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_read_line_too_long() {
        let long = "A".repeat(MAX_LINE + 10);
        let mut src = Cursor::new(long.into_bytes());
        assert_eq!(read_line(&mut src).unwrap(), Line::TooLong);
    }

    // ==================== Target ====================

    #[test]
    fn test_target_origin_form() {
        let target = Target::parse("/fibonacci?num=10").unwrap();
        assert_eq!(target.path, "/fibonacci");
        assert_eq!(target.query.as_deref(), Some("num=10"));
    }

    #[test]
    fn test_target_absolute_form() {
        let target = Target::parse("http://example.com:8080/a/b?c").unwrap();
        assert_eq!(target.path, "/a/b");
        assert_eq!(target.query.as_deref(), Some("c"));

        let bare = Target::parse("http://example.com").unwrap();
        assert_eq!(bare.path, "/");
    }

    #[test]
    fn test_target_percent_decoding() {
        let target = Target::parse("/hello%20world").unwrap();
        assert_eq!(target.path, "/hello world");
    }

    #[test]
    fn test_target_invalid() {
        assert_eq!(Target::parse("relative/path"), Err(RequestError::InvalidTarget));
        assert_eq!(Target::parse("/bad%zz"), Err(RequestError::InvalidTarget));
        assert_eq!(Target::parse("/cut%2"), Err(RequestError::InvalidTarget));
    }

    #[test]
    fn test_target_asterisk() {
        assert_eq!(Target::parse("*").unwrap().path, "*");
    }

    // ==================== Headers ====================

    #[test]
    fn test_read_headers() {
        let headers = headers_of("Host: x\r\nContent-Length:  5 \r\n\r\n");
        assert_eq!(headers.get("host"), Some("x"));
        assert_eq!(headers.get("Content-Length"), Some("5"));
    }

    #[test]
    fn test_read_headers_continuation() {
        let headers = headers_of("X-Folded: a\r\n  b\r\n\r\n");
        assert_eq!(headers.get("X-Folded"), Some("a b"));
    }

    #[test]
    fn test_read_headers_malformed() {
        let mut src = Cursor::new(b"NoColonHere\r\n\r\n".to_vec());
        assert!(matches!(
            read_headers(&mut src, 200),
            Err(ExchangeError::Rejected(RequestError::MalformedHeader))
        ));
    }

    #[test]
    fn test_read_headers_limit() {
        let mut src = Cursor::new(b"A: 1\r\nB: 2\r\nC: 3\r\n\r\n".to_vec());
        assert!(matches!(
            read_headers(&mut src, 2),
            Err(ExchangeError::Rejected(RequestError::TooManyHeaders))
        ));
    }

    #[test]
    fn test_read_headers_truncated() {
        let mut src = Cursor::new(b"Host: x\r\n".to_vec());
        assert!(matches!(read_headers(&mut src, 200), Err(ExchangeError::Io(_))));
    }

    // ==================== Framing ====================

    #[test]
    fn test_framing_chunked_wins() {
        let headers = headers_of("Transfer-Encoding: chunked\r\nContent-Length: 10\r\n\r\n");
        assert_eq!(BodyFraming::from_headers(&headers), Ok(BodyFraming::Chunked));
        assert_eq!(BodyFraming::Chunked.declared_length(), None);
    }

    #[test]
    fn test_framing_content_length() {
        let headers = headers_of("Content-Length: 42\r\n\r\n");
        assert_eq!(BodyFraming::from_headers(&headers), Ok(BodyFraming::Fixed(42)));

        let zero = headers_of("Content-Length: 0\r\n\r\n");
        assert_eq!(BodyFraming::from_headers(&zero), Ok(BodyFraming::Empty));

        let absent = headers_of("\r\n");
        assert_eq!(BodyFraming::from_headers(&absent), Ok(BodyFraming::Empty));
    }

    #[test]
    fn test_framing_malformed_length() {
        let headers = headers_of("Content-Length: ten\r\n\r\n");
        assert_eq!(
            BodyFraming::from_headers(&headers),
            Err(RequestError::MalformedLength)
        );
        let negative = headers_of("Content-Length: -1\r\n\r\n");
        assert_eq!(
            BodyFraming::from_headers(&negative),
            Err(RequestError::MalformedLength)
        );
    }
}

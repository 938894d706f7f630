//! # Filtro de Compresión
//! src/router/gzip.rs
//!
//! Comprime el body de la respuesta con gzip cuando el cliente lo acepta.
//! La longitud final no se conoce de antemano, así que el exchange pasa a
//! chunked (o hasta el cierre en HTTP/1.0).

use super::filter::{Chain, Filter};
use crate::server::exchange::{Exchange, ResponseBody};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Write};

/// Filtro gzip para respuestas
#[derive(Debug, Clone)]
pub struct GzipFilter {
    level: Compression,
}

impl GzipFilter {
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }

    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }
}

impl Default for GzipFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// `Accept-Encoding` incluye `gzip` con q distinto de cero
fn accepts_gzip(exchange: &Exchange) -> bool {
    exchange
        .request_headers()
        .get_all("Accept-Encoding")
        .flat_map(|value| value.split(','))
        .any(|token| {
            let mut parts = token.split(';');
            let coding = parts.next().unwrap_or("").trim();
            let refused = parts.any(|p| {
                let p = p.trim();
                p == "q=0" || p == "q=0.0" || p == "q=0.000"
            });
            coding.eq_ignore_ascii_case("gzip") && !refused
        })
}

impl Filter for GzipFilter {
    fn description(&self) -> &str {
        "gzip"
    }

    fn do_filter(&self, exchange: &mut Exchange, chain: Chain<'_>) -> io::Result<()> {
        if exchange.request_method().eq_ignore_ascii_case("HEAD") || !accepts_gzip(exchange) {
            return chain.do_filter(exchange);
        }

        exchange.response_headers_mut().set("Content-Encoding", "gzip");
        exchange.response_headers_mut().add("Vary", "Accept-Encoding");
        exchange.mark_length_indeterminate();

        let level = self.level;
        exchange.wrap_response_body(move |inner| Box::new(GzipBody::new(inner, level)));

        chain.do_filter(exchange)
    }
}

/// Body comprimido sobre el body original
///
/// El encoder se crea en el primer write: una respuesta sin body (204,
/// 304) no escribe nada comprimido, y `send_response_headers` le quita el
/// `Content-Encoding`.
struct GzipBody {
    inner: Option<Box<dyn ResponseBody>>,
    encoder: Option<GzEncoder<Box<dyn ResponseBody>>>,
    level: Compression,
}

impl GzipBody {
    fn new(inner: Box<dyn ResponseBody>, level: Compression) -> Self {
        Self {
            inner: Some(inner),
            encoder: None,
            level,
        }
    }

    fn encoder(&mut self) -> io::Result<&mut GzEncoder<Box<dyn ResponseBody>>> {
        if self.encoder.is_none() {
            let inner = self.inner.take().ok_or_else(|| {
                io::Error::new(io::ErrorKind::BrokenPipe, "response body already closed")
            })?;
            self.encoder = Some(GzEncoder::new(inner, self.level));
        }
        self.encoder
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "response body already closed"))
    }
}

impl Write for GzipBody {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.encoder()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.encoder.as_mut() {
            Some(encoder) => encoder.flush(),
            None => Ok(()),
        }
    }
}

impl ResponseBody for GzipBody {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let GzipBody { inner, encoder, .. } = *self;
        match (encoder, inner) {
            (Some(encoder), _) => encoder.finish()?.finish(),
            (None, Some(inner)) => inner.finish(),
            (None, None) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ResponseLength;
    use crate::router::filter::Chain;
    use crate::server::exchange::testing::{exchange_for, split_response};
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::sync::Arc;

    fn hello(exchange: &mut Exchange) -> io::Result<()> {
        let body = b"hello hello hello hello";
        exchange.send_response_headers(200u16, ResponseLength::Fixed(body.len() as u64))?;
        exchange.response_body().write_all(body)
    }

    #[test]
    fn test_compresses_when_accepted() {
        let filters: Vec<Arc<dyn Filter>> = vec![Arc::new(GzipFilter::new())];
        let (mut exchange, out) =
            exchange_for("GET /x HTTP/1.1", &[("Accept-Encoding", "deflate, gzip")], b"");

        Chain::new(&filters, &hello).do_filter(&mut exchange).unwrap();
        exchange.finish().unwrap();

        let raw = out.lock().unwrap().clone();
        let (head, body) = split_response(&raw);
        assert!(head.contains("Content-Encoding: gzip\r\n"));
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!head.contains("Content-Length"));

        let compressed = decode_chunked(body);
        let mut text = String::new();
        GzDecoder::new(&compressed[..]).read_to_string(&mut text).unwrap();
        assert_eq!(text, "hello hello hello hello");
    }

    #[test]
    fn test_passthrough_without_accept_encoding() {
        let filters: Vec<Arc<dyn Filter>> = vec![Arc::new(GzipFilter::new())];
        let (mut exchange, out) = exchange_for("GET /x HTTP/1.1", &[], b"");

        Chain::new(&filters, &hello).do_filter(&mut exchange).unwrap();
        exchange.finish().unwrap();

        let raw = out.lock().unwrap().clone();
        let (head, body) = split_response(&raw);
        assert!(!head.contains("Content-Encoding"));
        assert!(head.contains("Content-Length: 23\r\n"));
        assert_eq!(body, b"hello hello hello hello");
    }

    #[test]
    fn test_no_content_drops_encoding() {
        let filters: Vec<Arc<dyn Filter>> = vec![Arc::new(GzipFilter::new())];
        let (mut exchange, out) =
            exchange_for("POST /x HTTP/1.1", &[("Accept-Encoding", "gzip")], b"");

        let empty = |exchange: &mut Exchange| -> io::Result<()> {
            exchange.send_response_headers(204u16, ResponseLength::Empty)
        };
        Chain::new(&filters, &empty).do_filter(&mut exchange).unwrap();
        exchange.finish().unwrap();

        let raw = out.lock().unwrap().clone();
        let (head, body) = split_response(&raw);
        assert!(head.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(!head.contains("Content-Encoding"));
        assert!(body.is_empty());
    }

    #[test]
    fn test_refused_with_q_zero() {
        let filters: Vec<Arc<dyn Filter>> = vec![Arc::new(GzipFilter::new())];
        let (mut exchange, out) =
            exchange_for("GET /x HTTP/1.1", &[("Accept-Encoding", "gzip;q=0")], b"");

        Chain::new(&filters, &hello).do_filter(&mut exchange).unwrap();
        exchange.finish().unwrap();

        let raw = out.lock().unwrap().clone();
        let (head, _) = split_response(&raw);
        assert!(!head.contains("Content-Encoding"));
    }

    fn decode_chunked(mut body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let line_end = body.windows(2).position(|w| w == b"\r\n").unwrap();
            let size = usize::from_str_radix(std::str::from_utf8(&body[..line_end]).unwrap(), 16)
                .unwrap();
            body = &body[line_end + 2..];
            if size == 0 {
                return out;
            }
            out.extend_from_slice(&body[..size]);
            body = &body[size + 2..];
        }
    }
}

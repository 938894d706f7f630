//! # Framing de Bodies
//! src/http/body.rs
//!
//! Máquinas de estado que leen el body de un request y escriben el body de
//! una respuesta sobre un stream bloqueante:
//!
//! - [`BodyDecoder`]: `Content-Length` o `Transfer-Encoding: chunked`
//! - [`BodyEncoder`]: longitud fija, chunked o "hasta cerrar" (HTTP/1.0)
//!
//! No poseen el stream; quien las usa les presta el reader/writer en cada
//! llamada.

use super::request::{read_line, BodyFraming, Line};
use std::io::{self, BufRead, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Fixed { remaining: u64 },
    Chunked(ChunkState),
    Done,
}

/// Decodifica el body de un request
#[derive(Debug)]
pub struct BodyDecoder {
    state: DecodeState,
}

impl BodyDecoder {
    pub fn new(framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::Empty => DecodeState::Done,
            BodyFraming::Fixed(n) => DecodeState::Fixed { remaining: n },
            BodyFraming::Chunked => DecodeState::Chunked(ChunkState::Size),
        };
        Self { state }
    }

    /// El body fue consumido por completo
    pub fn is_eof(&self) -> bool {
        self.state == DecodeState::Done
    }

    /// Lee bytes del body; `Ok(0)` al llegar al final
    pub fn read<R: BufRead + ?Sized>(&mut self, src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            match self.state {
                DecodeState::Done => return Ok(0),
                DecodeState::Fixed { remaining } => {
                    let n = read_some(src, buf, remaining)?;
                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 {
                        DecodeState::Done
                    } else {
                        DecodeState::Fixed { remaining }
                    };
                    return Ok(n);
                }
                DecodeState::Chunked(ChunkState::Size) => {
                    let size = read_chunk_size(src)?;
                    if size == 0 {
                        skip_trailers(src)?;
                        self.state = DecodeState::Done;
                        return Ok(0);
                    }
                    self.state = DecodeState::Chunked(ChunkState::Data { remaining: size });
                }
                DecodeState::Chunked(ChunkState::Data { remaining }) => {
                    let n = read_some(src, buf, remaining)?;
                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 {
                        DecodeState::Chunked(ChunkState::DataEnd)
                    } else {
                        DecodeState::Chunked(ChunkState::Data { remaining })
                    };
                    return Ok(n);
                }
                DecodeState::Chunked(ChunkState::DataEnd) => {
                    match read_line(src)? {
                        Line::Text(line) if line.is_empty() => {}
                        _ => return Err(invalid("missing CRLF after chunk data")),
                    }
                    self.state = DecodeState::Chunked(ChunkState::Size);
                }
            }
        }
    }

    /// Descarta hasta `limit` bytes; `true` si se alcanzó el final del body
    pub fn drain<R: BufRead + ?Sized>(&mut self, src: &mut R, limit: u64) -> io::Result<bool> {
        let mut scratch = [0u8; 4096];
        let mut drained = 0u64;

        while !self.is_eof() && drained < limit {
            let max = scratch.len().min((limit - drained) as usize);
            let n = self.read(src, &mut scratch[..max])?;
            if n == 0 && !self.is_eof() {
                break;
            }
            drained += n as u64;
        }

        Ok(self.is_eof())
    }
}

fn read_some<R: BufRead + ?Sized>(src: &mut R, buf: &mut [u8], remaining: u64) -> io::Result<usize> {
    let max = buf.len().min(remaining.min(usize::MAX as u64) as usize);
    let n = src.read(&mut buf[..max])?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before end of request body",
        ));
    }
    Ok(n)
}

fn read_chunk_size<R: BufRead + ?Sized>(src: &mut R) -> io::Result<u64> {
    let line = match read_line(src)? {
        Line::Text(line) => line,
        Line::Eof => {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before chunk size",
            ))
        }
        Line::TooLong => return Err(invalid("chunk size line too long")),
    };
    // Las extensiones (`;name=value`) se ignoran
    let hex = line.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(hex, 16).map_err(|_| invalid("invalid chunk size"))
}

fn skip_trailers<R: BufRead + ?Sized>(src: &mut R) -> io::Result<()> {
    loop {
        match read_line(src)? {
            Line::Text(line) if line.is_empty() => return Ok(()),
            Line::Text(_) => continue,
            // Algunos clientes cierran justo después del chunk final
            Line::Eof => return Ok(()),
            Line::TooLong => return Err(invalid("trailer line too long")),
        }
    }
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Cómo se delimita el body de una respuesta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseLength {
    /// Sin body (`Content-Length: 0`, o códigos que lo prohíben)
    Empty,
    /// Exactamente n bytes
    Fixed(u64),
    /// Longitud desconocida: chunked en HTTP/1.1
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncodeState {
    Empty,
    Fixed { remaining: u64 },
    Chunked,
    UntilClose,
    Finished,
}

/// Codifica el body de una respuesta
#[derive(Debug)]
pub struct BodyEncoder {
    state: EncodeState,
}

impl BodyEncoder {
    pub fn empty() -> Self {
        Self {
            state: EncodeState::Empty,
        }
    }

    pub fn fixed(length: u64) -> Self {
        Self {
            state: EncodeState::Fixed { remaining: length },
        }
    }

    pub fn chunked() -> Self {
        Self {
            state: EncodeState::Chunked,
        }
    }

    /// HTTP/1.0 sin longitud: el final lo marca el cierre de la conexión
    pub fn until_close() -> Self {
        Self {
            state: EncodeState::UntilClose,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == EncodeState::Finished
    }

    pub fn write<W: Write + ?Sized>(&mut self, dst: &mut W, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        match self.state {
            EncodeState::Empty => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "response declared without a body",
            )),
            EncodeState::Finished => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "response body already closed",
            )),
            EncodeState::Fixed { remaining } => {
                if data.len() as u64 > remaining {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "too many bytes to write to stream",
                    ));
                }
                dst.write_all(data)?;
                self.state = EncodeState::Fixed {
                    remaining: remaining - data.len() as u64,
                };
                Ok(data.len())
            }
            EncodeState::Chunked => {
                write!(dst, "{:X}\r\n", data.len())?;
                dst.write_all(data)?;
                dst.write_all(b"\r\n")?;
                Ok(data.len())
            }
            EncodeState::UntilClose => {
                dst.write_all(data)?;
                Ok(data.len())
            }
        }
    }

    /// Cierra el body: chunk final o verificación de longitud
    pub fn finish<W: Write + ?Sized>(&mut self, dst: &mut W) -> io::Result<()> {
        match self.state {
            EncodeState::Finished => return Ok(()),
            EncodeState::Fixed { remaining } if remaining > 0 => {
                self.state = EncodeState::Finished;
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "insufficient bytes written to stream",
                ));
            }
            EncodeState::Chunked => dst.write_all(b"0\r\n\r\n")?,
            _ => {}
        }
        self.state = EncodeState::Finished;
        dst.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    fn decode_all(framing: BodyFraming, raw: &[u8]) -> io::Result<(Vec<u8>, Cursor<Vec<u8>>)> {
        let mut src = Cursor::new(raw.to_vec());
        let mut decoder = BodyDecoder::new(framing);
        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = decoder.read(&mut src, &mut buf)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert!(decoder.is_eof());
        Ok((out, src))
    }

    // ==================== Decoder ====================

    #[test]
    fn test_decode_fixed_leaves_pipelined_bytes() {
        let (body, mut rest) = decode_all(BodyFraming::Fixed(5), b"helloGET /next").unwrap();
        assert_eq!(body, b"hello");
        let mut tail = String::new();
        rest.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "GET /next");
    }

    #[test]
    fn test_decode_empty() {
        let (body, _) = decode_all(BodyFraming::Empty, b"ignored").unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn test_decode_chunked_with_extension_and_trailer() {
        let raw = b"5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: y\r\n\r\nNEXT";
        let (body, mut rest) = decode_all(BodyFraming::Chunked, raw).unwrap();
        assert_eq!(body, b"hello world");
        let mut tail = String::new();
        rest.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "NEXT");
    }

    #[test]
    fn test_decode_truncated_fixed() {
        let err = decode_all(BodyFraming::Fixed(10), b"short").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_decode_bad_chunk_size() {
        let err = decode_all(BodyFraming::Chunked, b"zz\r\nhello\r\n0\r\n\r\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_drain_respects_limit() {
        let mut src = Cursor::new(vec![b'x'; 100]);
        let mut decoder = BodyDecoder::new(BodyFraming::Fixed(100));
        assert!(!decoder.drain(&mut src, 40).unwrap());
        assert!(decoder.drain(&mut src, 1000).unwrap());
    }

    // ==================== Encoder ====================

    #[test]
    fn test_encode_fixed() {
        let mut out = Vec::new();
        let mut encoder = BodyEncoder::fixed(4);
        encoder.write(&mut out, b"ab").unwrap();
        encoder.write(&mut out, b"cd").unwrap();
        assert!(encoder.write(&mut out, b"e").is_err());
        encoder.finish(&mut out).unwrap();
        assert_eq!(out, b"abcd");
        assert!(encoder.is_finished());
    }

    #[test]
    fn test_encode_fixed_short_body_fails() {
        let mut out = Vec::new();
        let mut encoder = BodyEncoder::fixed(4);
        encoder.write(&mut out, b"ab").unwrap();
        assert!(encoder.finish(&mut out).is_err());
    }

    #[test]
    fn test_encode_chunked() {
        let mut out = Vec::new();
        let mut encoder = BodyEncoder::chunked();
        encoder.write(&mut out, b"hello world, 16b").unwrap();
        encoder.finish(&mut out).unwrap();
        assert_eq!(out, b"10\r\nhello world, 16b\r\n0\r\n\r\n");
    }

    #[test]
    fn test_encode_empty_rejects_data() {
        let mut out = Vec::new();
        let mut encoder = BodyEncoder::empty();
        assert!(encoder.write(&mut out, b"x").is_err());
        encoder.finish(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_chunked_roundtrip_through_decoder() {
        let mut wire = Vec::new();
        let mut encoder = BodyEncoder::chunked();
        encoder.write(&mut wire, b"abc").unwrap();
        encoder.write(&mut wire, b"defgh").unwrap();
        encoder.finish(&mut wire).unwrap();

        let (body, _) = decode_all(BodyFraming::Chunked, &wire).unwrap();
        assert_eq!(body, b"abcdefgh");
    }
}

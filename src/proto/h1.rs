//! The framed HTTP/1.x transport: a byte pipe plus message framing.
//!
//! Reading produces complete `http::Request`s (head parsed with `httparse`,
//! any `Content-Length` body buffered in full — handlers never stream).
//! Writing is split into a head write and a body write, so a session can
//! answer `HEAD` with the exact headers of `GET` and no body bytes.

use std::fmt;
use std::time::SystemTime;

use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, DATE, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Request, Response, Uri, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use crate::error::Parse;
use crate::upgrade::Io;

/// The initial buffer size allocated before trying to read from IO.
const INIT_BUFFER_SIZE: usize = 8192;

/// If the buffer gets this big and a request head is still not complete,
/// parsing is abandoned with a `TooLarge` error.
const MAX_HEAD_SIZE: usize = 32 * 1024;

const MAX_HEADERS: usize = 100;

/// Bodies over this size are refused rather than buffered.
const MAX_BODY_SIZE: usize = 1024 * 1024;

pub(crate) struct Transport {
    io: Box<dyn Io + Send>,
    read_buf: BytesMut,
}

impl Transport {
    pub(crate) fn new(io: Box<dyn Io + Send>) -> Transport {
        Transport {
            io,
            read_buf: BytesMut::with_capacity(0),
        }
    }

    /// Reads the next request off the connection.
    ///
    /// `Ok(None)` is a clean EOF at a message boundary — the peer is done.
    /// EOF mid-message is an `IncompleteMessage` error.
    pub(crate) async fn read_request(&mut self) -> crate::Result<Option<Request<Bytes>>> {
        let (mut request, body_len) = loop {
            if let Some(head) = self.parse_head()? {
                break head;
            }
            if self.read_buf.len() >= MAX_HEAD_SIZE {
                return Err(Parse::TooLarge.into());
            }
            self.read_buf.reserve(INIT_BUFFER_SIZE);
            let n = self
                .io
                .read_buf(&mut self.read_buf)
                .await
                .map_err(crate::Error::new_io)?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(crate::Error::new_incomplete());
            }
        };

        if body_len > 0 {
            if body_len > MAX_BODY_SIZE {
                return Err(crate::Error::new_body_refused());
            }
            while self.read_buf.len() < body_len {
                self.read_buf.reserve(body_len - self.read_buf.len());
                let n = self
                    .io
                    .read_buf(&mut self.read_buf)
                    .await
                    .map_err(crate::Error::new_io)?;
                if n == 0 {
                    return Err(crate::Error::new_incomplete());
                }
            }
            *request.body_mut() = self.read_buf.split_to(body_len).freeze();
        }

        trace!(
            "read {} {} ({} body bytes)",
            request.method(),
            request.uri(),
            body_len
        );
        Ok(Some(request))
    }

    fn parse_head(&mut self) -> crate::Result<Option<(Request<Bytes>, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        let head_len = match parsed.parse(&self.read_buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(httparse::Error::Version) => return Err(self.reject_version()),
            Err(e) => return Err(Parse::from(e).into()),
        };

        let method = match parsed.method {
            Some(m) => Method::from_bytes(m.as_bytes()).map_err(Parse::from)?,
            None => return Err(Parse::Method.into()),
        };
        let uri: Uri = match parsed.path {
            Some(p) => p.parse().map_err(Parse::from)?,
            None => return Err(Parse::Uri.into()),
        };
        let version = match parsed.version {
            Some(1) => Version::HTTP_11,
            Some(0) => Version::HTTP_10,
            _ => return Err(Parse::Version.into()),
        };

        let mut header_map = HeaderMap::with_capacity(parsed.headers.len());
        for header in parsed.headers.iter() {
            let name =
                HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| Parse::Header)?;
            let value = HeaderValue::from_bytes(header.value).map_err(|_| Parse::Header)?;
            header_map.append(name, value);
        }

        // Chunked ingress is not accepted; bodies are Content-Length only.
        if header_map.contains_key(TRANSFER_ENCODING) {
            return Err(Parse::TransferEncoding.into());
        }
        let body_len = content_length(&header_map)?;

        let mut request = Request::new(Bytes::new());
        *request.method_mut() = method;
        *request.uri_mut() = uri;
        *request.version_mut() = version;
        *request.headers_mut() = header_map;

        self.read_buf.advance(head_len);
        Ok(Some((request, body_len)))
    }

    /// `httparse` only accepts `HTTP/1.x` request lines. Distinguish an
    /// old-protocol request (400) from a newer one we refuse (505) by
    /// sniffing the version digit on the raw request line.
    fn reject_version(&self) -> crate::Error {
        let line_end = self
            .read_buf
            .iter()
            .position(|&b| b == b'\n')
            .unwrap_or_else(|| self.read_buf.len());
        let line = &self.read_buf[..line_end];
        if let Some(pos) = line.windows(5).position(|w| w == b"HTTP/") {
            if let Some(&digit) = line.get(pos + 5) {
                if digit.is_ascii_digit() && digit >= b'2' {
                    return Parse::VersionUnsupported.into();
                }
            }
        }
        Parse::Version.into()
    }

    /// Writes the status line and headers. `Content-Length` (computed from
    /// the body the caller intends to send) and `Date` are filled in when
    /// the response doesn't carry them.
    pub(crate) async fn write_head(
        &mut self,
        response: &Response<Bytes>,
        body_len: usize,
    ) -> crate::Result<()> {
        let mut buf = BytesMut::with_capacity(256);
        let mut fmt = itoa::Buffer::new();

        buf.extend_from_slice(b"HTTP/1.1 ");
        buf.extend_from_slice(fmt.format(response.status().as_u16()).as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(
            response
                .status()
                .canonical_reason()
                .unwrap_or("Unknown")
                .as_bytes(),
        );
        buf.extend_from_slice(b"\r\n");

        for (name, value) in response.headers() {
            buf.extend_from_slice(name.as_str().as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        if !response.headers().contains_key(CONTENT_LENGTH) {
            buf.extend_from_slice(b"content-length: ");
            buf.extend_from_slice(fmt.format(body_len).as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        if !response.headers().contains_key(DATE) {
            buf.extend_from_slice(b"date: ");
            buf.extend_from_slice(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");

        self.io
            .write_all(&buf)
            .await
            .map_err(crate::Error::new_io)?;
        self.io.flush().await.map_err(crate::Error::new_io)
    }

    pub(crate) async fn write_body(&mut self, body: &Bytes) -> crate::Result<()> {
        self.io
            .write_all(body)
            .await
            .map_err(crate::Error::new_io)?;
        self.io.flush().await.map_err(crate::Error::new_io)
    }

    pub(crate) async fn write_raw(&mut self, buf: &[u8]) -> crate::Result<()> {
        self.io
            .write_all(buf)
            .await
            .map_err(crate::Error::new_io)?;
        self.io.flush().await.map_err(crate::Error::new_io)
    }

    pub(crate) async fn shutdown(&mut self) {
        let _ = self.io.shutdown().await;
    }

    /// Releases the byte pipe and any bytes read past the last message.
    pub(crate) fn into_parts(self) -> (Box<dyn Io + Send>, Bytes) {
        (self.io, self.read_buf.freeze())
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("read_buf", &self.read_buf.len())
            .finish()
    }
}

fn content_length(headers: &HeaderMap) -> Result<usize, Parse> {
    let mut values = headers.get_all(CONTENT_LENGTH).iter();
    let value = match values.next() {
        Some(v) => v,
        None => return Ok(0),
    };
    if values.next().is_some() {
        return Err(Parse::ContentLength);
    }
    let s = value.to_str().map_err(|_| Parse::ContentLength)?;
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Parse::ContentLength);
    }
    s.parse().map_err(|_| Parse::ContentLength)
}

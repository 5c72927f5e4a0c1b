//! Minimal blocking HTTP/1.1 client used by the REST object stores.
//!
//! One connection per request (`Connection: close`), a hard deadline
//! covering connect, send and receive, TLS through rustls when the
//! scheme is https. Responses are parsed with httparse and bounded in
//! header and body size.

use crate::error::{ErrorKind, HelperError};
use std::io::{self, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_RESPONSE_HEADER_BYTES: usize = 64 * 1024;
const MAX_RESPONSE_BODY_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn parse(raw: &str) -> Result<Self, HelperError> {
        match raw {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(HelperError::invalid_argument(format!(
                "unsupported scheme `{other}` (expected http or https)"
            ))),
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

pub struct HttpRequest {
    pub method: &'static str,
    /// Path plus optional query, already percent-encoded.
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: &'static str, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub struct HttpClient {
    host: String,
    port: u16,
    host_header: String,
    timeout: Duration,
    tls: Option<TlsContext>,
}

struct TlsContext {
    config: Arc<rustls::ClientConfig>,
    server_name: rustls::client::ServerName,
}

impl HttpClient {
    /// `ca_bundle` is required for https; the stack carries no ambient
    /// trust roots.
    pub fn new(
        scheme: Scheme,
        host: impl Into<String>,
        port: Option<u16>,
        ca_bundle: Option<&Path>,
        timeout: Duration,
    ) -> Result<Self, HelperError> {
        let host = host.into();
        let port = port.unwrap_or_else(|| scheme.default_port());
        let host_header = if port == scheme.default_port() {
            host.clone()
        } else {
            format!("{host}:{port}")
        };
        let tls = match scheme {
            Scheme::Http => None,
            Scheme::Https => {
                let bundle = ca_bundle.ok_or_else(|| {
                    HelperError::invalid_argument(
                        "https endpoint requires the caBundlePath parameter",
                    )
                })?;
                let config = Arc::new(tls_client_config(bundle)?);
                let server_name =
                    rustls::client::ServerName::try_from(host.as_str()).map_err(|_| {
                        HelperError::invalid_argument(format!(
                            "hostname `{host}` is not a valid TLS server name"
                        ))
                    })?;
                Some(TlsContext {
                    config,
                    server_name,
                })
            }
        };
        Ok(Self {
            host,
            port,
            host_header,
            timeout,
            tls,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn host_header(&self) -> &str {
        &self.host_header
    }

    pub fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, HelperError> {
        let deadline = Instant::now() + self.timeout;
        let mut stream = self.connect(deadline)?;
        let head = self.request_head(request);
        match &self.tls {
            Some(tls) => {
                let mut conn = rustls::ClientConnection::new(
                    tls.config.clone(),
                    tls.server_name.clone(),
                )
                .map_err(|err| {
                    HelperError::new(
                        ErrorKind::HostUnreachable,
                        format!("TLS session setup for {}: {err}", self.host),
                    )
                })?;
                let mut tls_stream = rustls::Stream::new(&mut conn, &mut stream);
                exchange(&mut tls_stream, &head, request, deadline)
            }
            None => exchange(&mut stream, &head, request, deadline),
        }
    }

    fn connect(&self, deadline: Instant) -> Result<TcpStream, HelperError> {
        let target = (self.host.as_str(), self.port);
        let addrs: Vec<SocketAddr> = target
            .to_socket_addrs()
            .map_err(|err| map_io_error(&err, format!("resolve {}", self.host)))?
            .collect();
        if addrs.is_empty() {
            return Err(HelperError::new(
                ErrorKind::HostUnreachable,
                format!("no addresses resolved for {}", self.host),
            ));
        }
        let mut last_err = None;
        for addr in addrs {
            let connect_timeout = remaining(deadline)?;
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(stream) => {
                    let io_timeout = remaining(deadline)?;
                    stream
                        .set_read_timeout(Some(io_timeout))
                        .and_then(|_| stream.set_write_timeout(Some(io_timeout)))
                        .map_err(|err| map_io_error(&err, format!("configure {addr}")))?;
                    return Ok(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }
        let err = last_err.expect("connect attempted at least once");
        Err(map_io_error(&err, format!("connect {}:{}", self.host, self.port)))
    }

    fn request_head(&self, request: &HttpRequest) -> Vec<u8> {
        let mut head = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nContent-Length: {}\r\n",
            request.method,
            request.target,
            self.host_header,
            request.body.len()
        );
        for (name, value) in &request.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        head.into_bytes()
    }
}

fn exchange(
    stream: &mut impl ReadWrite,
    head: &[u8],
    request: &HttpRequest,
    deadline: Instant,
) -> Result<HttpResponse, HelperError> {
    stream
        .write_all(head)
        .and_then(|_| stream.write_all(&request.body))
        .and_then(|_| stream.flush())
        .map_err(|err| map_io_error(&err, format!("{} send", request.method)))?;
    enforce(deadline)?;
    read_response(stream, request.method, deadline)
}

trait ReadWrite: Read + Write {}

impl<S: Read + Write> ReadWrite for S {}

fn read_response(
    stream: &mut impl ReadWrite,
    method: &str,
    deadline: Instant,
) -> Result<HttpResponse, HelperError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_header_terminator(&buffer) {
            break pos + 4;
        }
        if buffer.len() > MAX_RESPONSE_HEADER_BYTES {
            return Err(HelperError::new(
                ErrorKind::IoError,
                "response headers exceed limit",
            ));
        }
        enforce(deadline)?;
        let read = stream
            .read(&mut chunk)
            .map_err(|err| map_io_error(&err, "read response headers"))?;
        if read == 0 {
            return Err(HelperError::new(
                ErrorKind::IoError,
                "connection closed while reading response headers",
            ));
        }
        buffer.extend_from_slice(&chunk[..read]);
    };

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut headers);
    match parsed.parse(&buffer[..header_end]) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => {
            return Err(HelperError::new(
                ErrorKind::IoError,
                "failed to parse HTTP response",
            ))
        }
    }
    let status = parsed.code.ok_or_else(|| {
        HelperError::new(ErrorKind::IoError, "HTTP response missing status code")
    })?;
    let header_pairs: Vec<(String, String)> = parsed
        .headers
        .iter()
        .map(|header| {
            (
                header.name.to_string(),
                String::from_utf8_lossy(header.value).into_owned(),
            )
        })
        .collect();

    let mut response = HttpResponse {
        status,
        headers: header_pairs,
        body: Vec::new(),
    };
    if method == "HEAD" || status == 204 || status == 304 {
        return Ok(response);
    }

    let already = buffer[header_end..].to_vec();
    let transfer_encoding = response
        .header("Transfer-Encoding")
        .map(|value| value.to_ascii_lowercase());
    let content_length = match response.header("Content-Length") {
        Some(value) => Some(value.trim().parse::<usize>().map_err(|_| {
            HelperError::new(ErrorKind::IoError, "invalid Content-Length header")
        })?),
        None => None,
    };

    response.body = if transfer_encoding.as_deref() == Some("chunked") {
        decode_chunked(stream, already, deadline)?
    } else if let Some(length) = content_length {
        if length > MAX_RESPONSE_BODY_BYTES {
            return Err(HelperError::new(
                ErrorKind::IoError,
                "response body exceeds limit",
            ));
        }
        read_exact_body(stream, already, length, deadline)?
    } else {
        // Connection: close delimits the body.
        read_to_end_body(stream, already, deadline)?
    };
    Ok(response)
}

fn read_exact_body(
    stream: &mut impl ReadWrite,
    mut body: Vec<u8>,
    length: usize,
    deadline: Instant,
) -> Result<Vec<u8>, HelperError> {
    body.truncate(length.min(body.len()));
    let mut chunk = [0u8; 16 * 1024];
    while body.len() < length {
        enforce(deadline)?;
        let read = stream
            .read(&mut chunk)
            .map_err(|err| map_io_error(&err, "read response body"))?;
        if read == 0 {
            return Err(HelperError::new(ErrorKind::IoError, "truncated response body"));
        }
        let wanted = (length - body.len()).min(read);
        body.extend_from_slice(&chunk[..wanted]);
    }
    Ok(body)
}

fn read_to_end_body(
    stream: &mut impl ReadWrite,
    mut body: Vec<u8>,
    deadline: Instant,
) -> Result<Vec<u8>, HelperError> {
    let mut chunk = [0u8; 16 * 1024];
    loop {
        enforce(deadline)?;
        let read = match stream.read(&mut chunk) {
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => 0,
            Err(err) => return Err(map_io_error(&err, "read response body")),
        };
        if read == 0 {
            return Ok(body);
        }
        body.extend_from_slice(&chunk[..read]);
        if body.len() > MAX_RESPONSE_BODY_BYTES {
            return Err(HelperError::new(
                ErrorKind::IoError,
                "response body exceeds limit",
            ));
        }
    }
}

/// Minimal chunked-transfer decoder; trailers are discarded.
fn decode_chunked(
    stream: &mut impl ReadWrite,
    mut pending: Vec<u8>,
    deadline: Instant,
) -> Result<Vec<u8>, HelperError> {
    let mut body = Vec::new();
    let mut chunk = [0u8; 16 * 1024];
    loop {
        // Ensure a full size line is buffered.
        let line_end = loop {
            if let Some(pos) = pending.windows(2).position(|window| window == b"\r\n") {
                break pos;
            }
            enforce(deadline)?;
            let read = stream
                .read(&mut chunk)
                .map_err(|err| map_io_error(&err, "read chunk size"))?;
            if read == 0 {
                return Err(HelperError::new(ErrorKind::IoError, "truncated chunked body"));
            }
            pending.extend_from_slice(&chunk[..read]);
        };
        let size_line = String::from_utf8_lossy(&pending[..line_end]).into_owned();
        pending.drain(..line_end + 2);
        let size = usize::from_str_radix(size_line.split(';').next().unwrap_or("").trim(), 16)
            .map_err(|_| HelperError::new(ErrorKind::IoError, "invalid chunk size"))?;
        if size == 0 {
            return Ok(body);
        }
        if body.len() + size > MAX_RESPONSE_BODY_BYTES {
            return Err(HelperError::new(
                ErrorKind::IoError,
                "response body exceeds limit",
            ));
        }
        while pending.len() < size + 2 {
            enforce(deadline)?;
            let read = stream
                .read(&mut chunk)
                .map_err(|err| map_io_error(&err, "read chunk data"))?;
            if read == 0 {
                return Err(HelperError::new(ErrorKind::IoError, "truncated chunked body"));
            }
            pending.extend_from_slice(&chunk[..read]);
        }
        body.extend_from_slice(&pending[..size]);
        pending.drain(..size + 2);
    }
}

fn find_header_terminator(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

fn enforce(deadline: Instant) -> Result<(), HelperError> {
    if Instant::now() >= deadline {
        Err(HelperError::timed_out("request deadline exceeded"))
    } else {
        Ok(())
    }
}

fn remaining(deadline: Instant) -> Result<Duration, HelperError> {
    let now = Instant::now();
    if now >= deadline {
        Err(HelperError::timed_out("request deadline exceeded"))
    } else {
        Ok(deadline - now)
    }
}

pub(crate) fn map_io_error(err: &io::Error, context: impl Into<String>) -> HelperError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => HelperError::timed_out(context),
        _ => HelperError::from_io(err, context),
    }
}

/// RFC 3986 percent-encoding; `keep_slash` leaves path separators as-is.
pub(crate) fn uri_encode(raw: &str, keep_slash: bool) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        let plain = byte.is_ascii_alphanumeric()
            || matches!(byte, b'-' | b'_' | b'.' | b'~')
            || (keep_slash && byte == b'/');
        if plain {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

fn tls_client_config(bundle: &Path) -> Result<rustls::ClientConfig, HelperError> {
    let file = std::fs::File::open(bundle)
        .map_err(|err| HelperError::from_io(&err, format!("open CA bundle {}", bundle.display())))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).map_err(|err| {
        HelperError::from_io(&err, format!("parse CA bundle {}", bundle.display()))
    })?;
    if certs.is_empty() {
        return Err(HelperError::invalid_argument(format!(
            "CA bundle {} contains no certificates",
            bundle.display()
        )));
    }
    let mut roots = rustls::RootCertStore::empty();
    for der in certs {
        roots.add(&rustls::Certificate(der)).map_err(|err| {
            HelperError::invalid_argument(format!(
                "CA bundle {}: invalid certificate: {err}",
                bundle.display()
            ))
        })?;
    }
    Ok(rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

//! Minimal HTTP/1.1 plumbing for the daemon: request-line parsing, JSON
//! rendering, and the route table. The whole API rides on query strings,
//! so request bodies are never read.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use idlease_bank::{Bank, BankError, LeaseId, Token};
use serde::Serialize;
use tracing::{debug, info, warn};

const READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Total bytes of request line plus headers one connection may send. The
/// whole API fits in one short line, so anything longer is cut off rather
/// than buffered.
const MAX_REQUEST_BYTES: u64 = 8 * 1024;

#[derive(Serialize)]
struct AllocResponse {
    id: LeaseId,
    client: String,
    timeout: u64,
    token: Token,
}

#[derive(Serialize)]
struct QueryResponse {
    id: LeaseId,
    client: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl ErrorResponse {
    fn success() -> Self {
        Self {
            error: "success".into(),
        }
    }
}

impl From<BankError> for ErrorResponse {
    fn from(err: BankError) -> Self {
        Self {
            error: err.to_string(),
        }
    }
}

/// Binds `addr` and serves the bank until the listener fails.
pub fn serve(addr: SocketAddr, bank: Bank) -> io::Result<()> {
    let listener = TcpListener::bind(addr)?;
    info!(%addr, "listening");
    serve_on(listener, bank)
}

/// Accept loop over an already-bound listener, one thread per connection.
pub fn serve_on(listener: TcpListener, bank: Bank) -> io::Result<()> {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let bank = bank.clone();
                thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &bank) {
                        debug!(%err, "connection error");
                    }
                });
            }
            Err(err) => warn!(%err, "accept failed"),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, bank: &Bank) -> io::Result<()> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    // A request cut off at the cap fails to parse and is answered 400.
    let mut reader = BufReader::new(stream.try_clone()?.take(MAX_REQUEST_BYTES));
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let request = parse_request_line(&line);
    // Drain the headers; everything the API needs is in the query string.
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 || header == "\r\n" || header == "\n" {
            break;
        }
    }
    match request {
        Some(request) => respond(&mut stream, bank, &request),
        None => write_status(&mut stream, 400),
    }
}

fn respond(stream: &mut TcpStream, bank: &Bank, request: &HttpRequest) -> io::Result<()> {
    debug!(method = %request.method, path = %request.path, "request");
    match request.path.as_str() {
        "/id/alloc" => handle_alloc(stream, bank, request),
        "/id/release" => handle_release(stream, bank, request),
        "/id/reset" => handle_reset(stream, bank, request),
        path => match path.strip_prefix("/id/") {
            Some(tail) => handle_query(stream, bank, request, tail),
            None => write_status(stream, 404),
        },
    }
}

fn handle_alloc(stream: &mut TcpStream, bank: &Bank, request: &HttpRequest) -> io::Result<()> {
    if request.method != "PUT" {
        return write_status(stream, 400);
    }
    let Some(name) = request.param("name").filter(|name| !name.is_empty()) else {
        return write_status(stream, 400);
    };
    let Some(ttl) = request.param("timeout").and_then(parse_seconds) else {
        return write_status(stream, 400);
    };
    match bank.allocate(name, ttl) {
        Ok(lease) => write_json(
            stream,
            200,
            &AllocResponse {
                id: lease.id,
                client: name.to_owned(),
                timeout: ttl.as_secs(),
                token: lease.token,
            },
        ),
        Err(err) => write_json(stream, 200, &ErrorResponse::from(err)),
    }
}

fn handle_release(stream: &mut TcpStream, bank: &Bank, request: &HttpRequest) -> io::Result<()> {
    if request.method != "PUT" {
        return write_status(stream, 400);
    }
    let (Some(id), Some(token)) = (
        request.param("id").and_then(parse_id),
        request.param("token").and_then(parse_token),
    ) else {
        return write_status(stream, 400);
    };
    match bank.release(id, token) {
        Ok(()) => write_json(stream, 200, &ErrorResponse::success()),
        Err(err) => write_json(stream, 406, &ErrorResponse::from(err)),
    }
}

fn handle_reset(stream: &mut TcpStream, bank: &Bank, request: &HttpRequest) -> io::Result<()> {
    if request.method != "PUT" {
        return write_status(stream, 400);
    }
    let (Some(id), Some(ttl), Some(token)) = (
        request.param("id").and_then(parse_id),
        request.param("timeout").and_then(parse_seconds),
        request.param("token").and_then(parse_token),
    ) else {
        return write_status(stream, 400);
    };
    match bank.reset(id, ttl, token) {
        Ok(()) => write_json(stream, 200, &ErrorResponse::success()),
        Err(err) => write_json(stream, 406, &ErrorResponse::from(err)),
    }
}

fn handle_query(
    stream: &mut TcpStream,
    bank: &Bank,
    request: &HttpRequest,
    tail: &str,
) -> io::Result<()> {
    if request.method != "GET" {
        return write_status(stream, 400);
    }
    let Some(id) = parse_id(tail) else {
        return write_status(stream, 400);
    };
    match bank.query(id) {
        Some(client) => write_json(stream, 200, &QueryResponse { id, client }),
        None => write_status(stream, 404),
    }
}

struct HttpRequest {
    method: String,
    path: String,
    params: Vec<(String, String)>,
}

impl HttpRequest {
    fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn parse_request_line(line: &str) -> Option<HttpRequest> {
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_owned();
    let target = parts.next()?;
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };
    let mut params = Vec::new();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.push((percent_decode(key)?, percent_decode(value)?));
    }
    Some(HttpRequest {
        method,
        path: percent_decode(path)?,
        params,
    })
}

fn percent_decode(raw: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(raw.len());
    let mut rest = raw.bytes();
    while let Some(byte) = rest.next() {
        match byte {
            b'+' => bytes.push(b' '),
            b'%' => {
                let hex = [rest.next()?, rest.next()?];
                let hex = std::str::from_utf8(&hex).ok()?;
                bytes.push(u8::from_str_radix(hex, 16).ok()?);
            }
            _ => bytes.push(byte),
        }
    }
    String::from_utf8(bytes).ok()
}

fn parse_id(raw: &str) -> Option<LeaseId> {
    raw.parse().ok()
}

fn parse_token(raw: &str) -> Option<Token> {
    raw.parse().ok()
}

fn parse_seconds(raw: &str) -> Option<Duration> {
    raw.parse().ok().map(Duration::from_secs)
}

fn write_json<T: Serialize>(stream: &mut TcpStream, status: u16, body: &T) -> io::Result<()> {
    let body = serde_json::to_string(body)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let response = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        status_text(status),
        body.len(),
    );
    stream.write_all(response.as_bytes())
}

fn write_status(stream: &mut TcpStream, status: u16) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status_text(status),
    );
    stream.write_all(response.as_bytes())
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        406 => "Not Acceptable",
        _ => "Internal Server Error",
    }
}

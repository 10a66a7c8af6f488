use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use tungstenite::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_MAX_AGE, HeaderValue,
};
use tungstenite::http::{Method, Response, StatusCode, Uri};

use crate::api::{self, empty_response};
use crate::frontend;
use crate::store::ChannelStore;

const MAX_HEAD: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpContext {
    pub store: Arc<ChannelStore>,
    pub frontend_dir: PathBuf,
}

#[derive(Debug)]
enum HeadError {
    TooLarge,
    Closed,
    Io(io::Error),
}

fn read_head(stream: &mut impl Read) -> Result<Vec<u8>, HeadError> {
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).map_err(HeadError::Io)?;
        if n == 0 {
            return Err(HeadError::Closed);
        }
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(head);
        }
        if head.len() > MAX_HEAD {
            return Err(HeadError::TooLarge);
        }
    }
}

/// Dispatch one request. CORS headers are added by the caller.
pub fn route(ctx: &HttpContext, method: &Method, target: &str) -> Response<Vec<u8>> {
    if *method == Method::OPTIONS {
        return empty_response(StatusCode::NO_CONTENT);
    }
    if *method != Method::GET && *method != Method::HEAD {
        return empty_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let Ok(uri) = target.parse::<Uri>() else {
        return empty_response(StatusCode::BAD_REQUEST);
    };

    match uri.path() {
        // HEAD must not change state
        "/set" | "/fade" if *method == Method::HEAD => {
            empty_response(StatusCode::METHOD_NOT_ALLOWED)
        }
        "/get" => api::get_channels(&ctx.store),
        "/set" => api::set_channels(&ctx.store, uri.query()).0,
        "/fade" => api::fade(&ctx.store, uri.query()),
        path => frontend::serve(&ctx.frontend_dir, path),
    }
}

/// Allow every origin, as the front-end may be hosted anywhere.
fn add_cors(response: &mut Response<Vec<u8>>, preflight: bool) {
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    if preflight {
        headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, HEAD, OPTIONS"),
        );
        headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
        headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("600"));
    }
}

fn encode(response: &Response<Vec<u8>>, head_only: bool) -> Vec<u8> {
    let status = response.status();
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes();
    for (name, value) in response.headers() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n", response.body().len()).as_bytes());
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    if !head_only {
        out.extend_from_slice(response.body());
    }
    out
}

/// Parse a request head and build the response to it. The flag is set for
/// HEAD requests, whose body must not be sent.
fn respond(ctx: &HttpContext, head: &[u8]) -> (Response<Vec<u8>>, bool) {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    let parsed = match request.parse(head) {
        Ok(httparse::Status::Complete(_)) => (request.method, request.path),
        Ok(httparse::Status::Partial) | Err(_) => (None, None),
    };
    let (Some(method), Some(target)) = parsed else {
        return (empty_response(StatusCode::BAD_REQUEST), false);
    };
    let Ok(method) = Method::from_bytes(method.as_bytes()) else {
        return (empty_response(StatusCode::BAD_REQUEST), false);
    };

    debug!("[HTTP] {} {}", method, target);
    let mut response = route(ctx, &method, target);
    add_cors(&mut response, method == Method::OPTIONS);
    (response, method == Method::HEAD)
}

fn handle_connection(ctx: &HttpContext, mut stream: TcpStream) {
    if let Err(e) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
        warn!("[HTTP] could not set read timeout: {}", e);
    }

    let (response, head_only) = match read_head(&mut stream) {
        Ok(head) => respond(ctx, &head),
        Err(HeadError::TooLarge) => (empty_response(StatusCode::PAYLOAD_TOO_LARGE), false),
        Err(HeadError::Closed) => return,
        Err(HeadError::Io(e)) => {
            debug!("[HTTP] read error: {}", e);
            return;
        }
    };

    if let Err(e) = stream.write_all(&encode(&response, head_only)) {
        debug!("[HTTP] write error: {}", e);
    }
}

/// Accept connections forever, one thread per connection.
pub fn http_thread(listener: TcpListener, ctx: Arc<HttpContext>) {
    if let Ok(addr) = listener.local_addr() {
        info!("[HTTP] listening on {}", addr);
    }

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!("[HTTP] connection error: {}", e);
                continue;
            }
        };

        let ctx = Arc::clone(&ctx);
        let spawned = thread::Builder::new()
            .name("http-conn".into())
            .spawn(move || handle_connection(&ctx, stream));
        if let Err(e) = spawned {
            warn!("[HTTP] could not spawn handler: {}", e);
        }
    }
}

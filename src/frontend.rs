use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use log::warn;
use tungstenite::http::header::{CONTENT_TYPE, HeaderValue};
use tungstenite::http::{Response, StatusCode};

use crate::api::empty_response;

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") | Some("mjs") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("ico") => "image/x-icon",
        Some("woff2") => "font/woff2",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Map a request path onto `root`. `None` when the path tries to leave it.
fn resolve(root: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = Path::new(request_path.trim_start_matches('/'));
    let mut path = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if path.is_dir() {
        path.push("index.html");
    }
    Some(path)
}

/// Serve a file from the operator front-end directory.
pub fn serve(root: &Path, request_path: &str) -> Response<Vec<u8>> {
    let Some(path) = resolve(root, request_path) else {
        return empty_response(StatusCode::FORBIDDEN);
    };

    match fs::read(&path) {
        Ok(bytes) => {
            let mut response = Response::new(bytes);
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type(&path)));
            response
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => empty_response(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!("[HTTP] could not read {}: {}", path.display(), e);
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// http.rs
//
// Minimal HTTP/1.1 protocol layer: request head parsing, the fixed route
// table and response framing. No I/O happens here.

use std::collections::HashMap;

use log::*;
use serde::Serialize;
use thiserror::Error;

use crate::KnownFileSet;

pub const INDEX_FILE: &str = "/index.html";

const HTML_ERROR: &str = "<!DOCTYPE html><html><head><title>{code} {reason}</title></head>\
<body><h1>{code} {message}</h1></body></html>\n";

const CACHE_IMMUTABLE: &str = "public, max-age=604800, immutable";

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("empty request")]
    EmptyRequest,
    #[error("malformed request line {0:?}")]
    MalformedRequestLine(String),
    #[error("request head too large")]
    HeadTooLarge,
    #[error("HTTP code ({0}) not found")]
    UnknownStatusCode(u16),
}

/// (reason phrase, error page message)
pub fn status_text(code: u16) -> Option<(&'static str, &'static str)> {
    match code {
        200 => Some(("OK", "OK")),
        303 => Some(("See Other", "Moved")),
        307 => Some(("Temporary Redirect", "Moved temporarily")),
        400 => Some(("Bad Request", "Bad request")),
        404 => Some(("Not Found", "File not found")),
        500 => Some(("Internal Server Error", "Server error")),
        _ => None,
    }
}

/// MIME type for a file extension. Anything unknown is served as HTML.
pub fn mime_type(label: &str) -> &'static str {
    match label {
        "css" => "text/css",
        "html" => "text/html",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "png" => "image/png",
        "ico" => "image/x-icon",
        _ => "text/html",
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub uri: Vec<u8>,
    pub protocol: String,
    pub headers: HashMap<String, String>,
}

/// Parse a request line and the header lines that follow it, up to the first
/// empty line. Header lines without a colon are logged and dropped.
pub fn parse_request_head<L: AsRef<[u8]>>(lines: &[L]) -> Result<HttpRequest, HttpError> {
    let mut lines = lines
        .iter()
        .map(|l| l.as_ref().trim_ascii())
        .take_while(|l| !l.is_empty());

    let first = lines.next().ok_or(HttpError::EmptyRequest)?;
    let parts = first
        .split(|b| b.is_ascii_whitespace())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>();
    let [method, uri, protocol] = parts.as_slice() else {
        return Err(HttpError::MalformedRequestLine(
            String::from_utf8_lossy(first).into_owned(),
        ));
    };

    let mut headers = HashMap::new();
    for line in lines {
        match line.iter().position(|&b| b == b':') {
            Some(i) => {
                let key = String::from_utf8_lossy(line[..i].trim_ascii()).into_owned();
                let val = String::from_utf8_lossy(line[i + 1..].trim_ascii()).into_owned();
                headers.insert(key, val);
            }
            None => warn!("header line warning: {:?}", String::from_utf8_lossy(line)),
        }
    }

    Ok(HttpRequest {
        method: String::from_utf8_lossy(method).into_owned(),
        uri: uri.to_vec(),
        protocol: String::from_utf8_lossy(protocol).into_owned(),
        headers,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiCommand {
    Status,
    On,
    Off,
    Auto,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    Api(ApiCommand),
    Reboot,
    File(String),
    NotFound,
}

const API_ROUTES: [(&[u8], ApiCommand); 4] = [
    (b"/api/v1/status", ApiCommand::Status),
    (b"/api/v1/on", ApiCommand::On),
    (b"/api/v1/off", ApiCommand::Off),
    (b"/api/v1/auto", ApiCommand::Auto),
];

const REBOOT_PREFIX: &[u8] = b"/api/v1/reboot";

/// Paths owned by the API, which a static file can never shadow.
pub fn is_api_path(path: &str) -> bool {
    let path = path.as_bytes();
    path.starts_with(REBOOT_PREFIX) || API_ROUTES.iter().any(|(p, _)| *p == path)
}

pub fn route(uri: &[u8], files: &KnownFileSet) -> Route {
    if let Some((_, cmd)) = API_ROUTES.iter().find(|(p, _)| *p == uri) {
        return Route::Api(*cmd);
    }
    if uri.starts_with(REBOOT_PREFIX) {
        return Route::Reboot;
    }

    let path = if uri == b"/" {
        INDEX_FILE
    } else {
        match std::str::from_utf8(uri) {
            Ok(p) => p,
            Err(_) => return Route::NotFound,
        }
    };
    if files.contains(path) {
        Route::File(path.to_string())
    } else {
        Route::NotFound
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheControl {
    /// Long-lived cache for static assets.
    Immutable,
    Directive(String),
}

/// Response header block, terminated by the blank line.
pub fn build_headers(
    code: u16,
    mime: Option<&str>,
    location: Option<&str>,
    content_len: Option<usize>,
    cache: Option<&CacheControl>,
) -> Result<Vec<u8>, HttpError> {
    let (reason, _) = status_text(code).ok_or(HttpError::UnknownStatusCode(code))?;

    let mut head = format!("HTTP/1.1 {code} {reason}\r\n");
    head.push_str(&format!(
        "Content-Type: {}\r\n",
        mime_type(mime.unwrap_or_default())
    ));
    if let Some(location) = location {
        head.push_str(&format!("Location: {location}\r\n"));
    }
    if let Some(len) = content_len {
        head.push_str(&format!("Content-Length: {len}\r\n"));
    }
    match cache {
        Some(CacheControl::Immutable) => {
            head.push_str(&format!("Cache-Control: {CACHE_IMMUTABLE}\r\n"))
        }
        Some(CacheControl::Directive(d)) => head.push_str(&format!("Cache-Control: {d}\r\n")),
        None => {}
    }
    head.push_str("Connection: close\r\n\r\n");
    Ok(head.into_bytes())
}

/// Complete error reply. Codes missing from the status table become 400.
pub fn error_response(code: u16) -> Vec<u8> {
    let code = if status_text(code).is_some() { code } else { 400 };
    let (reason, message) = status_text(code).unwrap_or(("Bad Request", "Bad request"));
    let body = HTML_ERROR
        .replace("{code}", &code.to_string())
        .replace("{reason}", reason)
        .replace("{message}", message);

    let mut resp = match build_headers(code, Some("html"), None, Some(body.len()), None) {
        Ok(h) => h,
        Err(e) => {
            // status_text() said otherwise a moment ago
            error!("{e}");
            Vec::new()
        }
    };
    resp.extend_from_slice(body.as_bytes());
    resp
}

/// Complete `200` JSON reply.
pub fn json_response<T: Serialize>(data: &T) -> anyhow::Result<Vec<u8>> {
    let body = serde_json::to_vec(data)?;
    let mut resp = build_headers(200, Some("json"), None, Some(body.len()), None)?;
    resp.extend_from_slice(&body);
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn text(b: &[u8]) -> &str {
        std::str::from_utf8(b).unwrap()
    }

    #[test]
    fn json_headers() {
        let h = build_headers(200, Some("json"), None, Some(42), None).unwrap();
        let h = text(&h);
        assert!(h.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(h.contains("\r\nContent-Type: application/json\r\n"));
        assert!(h.contains("\r\nContent-Length: 42\r\n"));
        assert!(h.ends_with("Connection: close\r\n\r\n"));
        assert!(!h.contains("Cache-Control"));
        assert!(!h.contains("Location"));
    }

    #[test]
    fn header_order() {
        let h = build_headers(303, None, Some("/"), Some(7), Some(&CacheControl::Immutable)).unwrap();
        assert_eq!(
            text(&h),
            "HTTP/1.1 303 See Other\r\n\
             Content-Type: text/html\r\n\
             Location: /\r\n\
             Content-Length: 7\r\n\
             Cache-Control: public, max-age=604800, immutable\r\n\
             Connection: close\r\n\r\n"
        );
    }

    #[test]
    fn custom_cache_directive() {
        let h = build_headers(200, Some("txt"), None, None, Some(&CacheControl::Directive("no-store".into())))
            .unwrap();
        assert!(text(&h).contains("\r\nCache-Control: no-store\r\n"));
        assert!(text(&h).contains("Content-Type: text/plain"));
    }

    #[test]
    fn unknown_mime_is_html() {
        let h = build_headers(200, Some("wasm"), None, None, None).unwrap();
        assert!(text(&h).contains("Content-Type: text/html\r\n"));
    }

    #[test]
    fn unknown_status_code() {
        assert!(matches!(
            build_headers(418, None, None, None, None),
            Err(HttpError::UnknownStatusCode(418))
        ));
        let resp = error_response(418);
        assert!(text(&resp).starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn not_found_page() {
        let resp = error_response(404);
        let resp = text(&resp);
        let (head, body) = resp.split_once("\r\n\r\n").unwrap();
        assert!(head.starts_with("HTTP/1.1 404 Not Found"));
        assert!(head.contains(&format!("Content-Length: {}", body.len())));
        assert!(body.contains("Not Found"));
        assert!(body.contains("<h1>404 File not found</h1>"));
    }

    #[test]
    fn parses_request_head() {
        let lines: [&[u8]; 7] = [
            b"GET /api/v1/status HTTP/1.1\r\n",
            b"Host: relay.local\r\n",
            b"User-Agent: curl/8.0\r\n",
            b"garbage line\r\n",
            b"X-Forwarded: a:b\r\n",
            b"\r\n",
            b"Ignored: after blank\r\n",
        ];
        let req = parse_request_head(&lines).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.uri, b"/api/v1/status");
        assert_eq!(req.protocol, "HTTP/1.1");
        assert_eq!(req.headers.len(), 3);
        assert_eq!(req.headers["Host"], "relay.local");
        assert_eq!(req.headers["X-Forwarded"], "a:b");
        assert!(!req.headers.contains_key("Ignored"));
    }

    #[test]
    fn rejects_bad_request_lines() {
        let empty: [&[u8]; 1] = [b"\r\n"];
        assert!(matches!(parse_request_head(&empty), Err(HttpError::EmptyRequest)));
        assert!(matches!(
            parse_request_head(&["GET /"]),
            Err(HttpError::MalformedRequestLine(_))
        ));
        assert!(matches!(
            parse_request_head(&["GET / HTTP/1.1 extra"]),
            Err(HttpError::MalformedRequestLine(_))
        ));
    }

    #[test]
    fn routes() {
        let files = KnownFileSet::from_names("/srv/html", ["/index.html", "/app.js"]);
        assert_eq!(route(b"/api/v1/on", &files), Route::Api(ApiCommand::On));
        assert_eq!(route(b"/api/v1/auto", &files), Route::Api(ApiCommand::Auto));
        assert_eq!(route(b"/api/v1/reboot", &files), Route::Reboot);
        assert_eq!(route(b"/api/v1/reboot?now=1", &files), Route::Reboot);
        assert_eq!(route(b"/", &files), Route::File(INDEX_FILE.into()));
        assert_eq!(route(b"/app.js", &files), Route::File("/app.js".into()));
        assert_eq!(route(b"/foo/bar", &files), Route::NotFound);
        assert_eq!(route(b"/../etc/passwd", &files), Route::NotFound);
        assert_eq!(route(b"/api/v1/on/", &files), Route::NotFound);
        assert_eq!(route(b"/api/v1/status?x", &files), Route::NotFound);
    }

    #[test]
    fn index_requires_file() {
        let files = KnownFileSet::default();
        assert_eq!(route(b"/", &files), Route::NotFound);
    }
}

// EOF

//! HTTP/1.x request parsing and re-emission.
//!
//! The proxy only needs the request line, the headers and a
//! `Content-Length` body, so parsing is done directly over the receive
//! buffer. A request is complete once the blank line ending the header
//! block has arrived together with the full body.

use std::collections::HashMap;

use bytes::Bytes;

use super::error::ProxyError;

const HEADER_END: &[u8] = b"\r\n\r\n";

/// A parsed proxy request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Request method, as sent (`GET`, `POST`, `CONNECT`, ...).
    pub method: String,
    /// Full URL (`http://host[:port]/path`); `host:port` for CONNECT.
    pub url: String,
    /// Protocol version (`HTTP/1.1`).
    pub version: String,
    /// Headers keyed by lowercase name.
    pub headers: HashMap<String, String>,
    /// Request body (empty when there is none).
    pub body: Bytes,
    host: String,
    port: u16,
    path: String,
}

impl HttpRequest {
    /// Try to parse a request from the start of `buf`.
    ///
    /// Returns `Ok(None)` while more bytes are needed, and
    /// [`ProxyError::MalformedRequest`] when the bytes cannot be a request.
    pub fn parse(buf: &[u8]) -> Result<Option<HttpRequest>, ProxyError> {
        let Some(head_len) = find_header_end(buf) else {
            return Ok(None);
        };

        let head = std::str::from_utf8(&buf[..head_len])
            .map_err(|_| ProxyError::MalformedRequest("header block is not UTF-8".into()))?;
        let mut lines = head.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ProxyError::MalformedRequest(format!(
                "bad request line: {request_line:?}"
            )));
        };
        if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(ProxyError::MalformedRequest(format!("bad method: {method:?}")));
        }
        if !version.starts_with("HTTP/1.") {
            return Err(ProxyError::MalformedRequest(format!(
                "unsupported version: {version:?}"
            )));
        }

        let mut headers = HashMap::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProxyError::MalformedRequest(format!("bad header: {line:?}")))?;
            let name = name.trim();
            if name.is_empty() || name.contains(' ') {
                return Err(ProxyError::MalformedRequest(format!("bad header: {line:?}")));
            }
            headers.insert(name.to_ascii_lowercase(), value.trim().to_string());
        }

        if headers
            .get("transfer-encoding")
            .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
        {
            return Err(ProxyError::MalformedRequest(
                "chunked request bodies are not supported".into(),
            ));
        }

        let content_length = match headers.get("content-length") {
            Some(v) => v
                .parse::<usize>()
                .map_err(|_| ProxyError::MalformedRequest(format!("bad content-length: {v:?}")))?,
            None => 0,
        };

        let body_start = head_len + HEADER_END.len();
        let body_end = body_start.checked_add(content_length).ok_or_else(|| {
            ProxyError::MalformedRequest(format!("content-length too large: {content_length}"))
        })?;
        if buf.len() < body_end {
            return Ok(None);
        }
        let body = Bytes::copy_from_slice(&buf[body_start..body_end]);

        let (host, port, path, url) = resolve_target(method, target, headers.get("host"))?;

        Ok(Some(HttpRequest {
            method: method.to_string(),
            url,
            version: version.to_string(),
            headers,
            body,
            host,
            port,
            path,
        }))
    }

    /// Target host, lowercase, without brackets or port.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Target port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Origin-form path (`/a/b?q`) used when re-emitting upstream.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether this is a CONNECT tunnel request.
    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    /// Look up a header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Serialize the request for the upstream server.
    ///
    /// The `Host` header is replaced, hop-by-hop connection headers are
    /// dropped, and `Connection: close` is added so the upstream ends the
    /// response by closing the socket.
    pub fn to_upstream_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.method, self.path, self.version).as_bytes(),
        );

        let mut names: Vec<&String> = self
            .headers
            .keys()
            .filter(|k| !matches!(k.as_str(), "host" | "connection" | "proxy-connection"))
            .collect();
        names.sort();
        for name in names {
            out.extend_from_slice(
                format!("{}: {}\r\n", title_case(name), self.headers[name]).as_bytes(),
            );
        }

        let host_header = if self.port == 80 {
            self.host_for_header()
        } else {
            format!("{}:{}", self.host_for_header(), self.port)
        };
        out.extend_from_slice(format!("Host: {}\r\n", host_header).as_bytes());
        out.extend_from_slice(b"Connection: close\r\n\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    fn host_for_header(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_END.len())
        .position(|window| window == HEADER_END)
}

/// Work out host, port, origin-form path and the full URL.
fn resolve_target(
    method: &str,
    target: &str,
    host_header: Option<&String>,
) -> Result<(String, u16, String, String), ProxyError> {
    if method == "CONNECT" {
        let (host, port) = parse_host_port(target, 443)?;
        return Ok((host, port, String::new(), target.to_string()));
    }

    let lower = target.to_ascii_lowercase();
    if let Some(scheme_len) = ["http://", "https://"]
        .iter()
        .find(|s| lower.starts_with(*s))
        .map(|s| s.len())
    {
        let default_port = if scheme_len == "https://".len() { 443 } else { 80 };
        let rest = &target[scheme_len..];
        let split = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, path) = rest.split_at(split);
        let path = match path {
            "" => "/".to_string(),
            p if p.starts_with('?') => format!("/{p}"),
            p => p.to_string(),
        };
        let (host, port) = parse_host_port(authority, default_port)?;
        return Ok((host, port, path, target.to_string()));
    }

    if !target.starts_with('/') {
        return Err(ProxyError::MalformedRequest(format!(
            "unsupported request target: {target:?}"
        )));
    }
    let authority = host_header
        .ok_or_else(|| ProxyError::MalformedRequest("origin-form request without Host".into()))?;
    let (host, port) = parse_host_port(authority, 80)?;
    let url = format!("http://{}{}", authority, target);
    Ok((host, port, target.to_string(), url))
}

/// Split `host[:port]` (or `[v6]:port`), lowercasing the host.
pub(crate) fn parse_host_port(authority: &str, default_port: u16) -> Result<(String, u16), ProxyError> {
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    if authority.is_empty() {
        return Err(ProxyError::MalformedRequest("empty authority".into()));
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| ProxyError::MalformedRequest(format!("bad authority: {authority}")))?;
        let port = match after.strip_prefix(':') {
            Some(p) => parse_port(p)?,
            None if after.is_empty() => default_port,
            None => {
                return Err(ProxyError::MalformedRequest(format!(
                    "bad authority: {authority}"
                )));
            }
        };
        return Ok((host.to_ascii_lowercase(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            Ok((host.to_ascii_lowercase(), parse_port(port)?))
        }
        _ => Ok((authority.to_ascii_lowercase(), default_port)),
    }
}

fn parse_port(s: &str) -> Result<u16, ProxyError> {
    s.parse::<u16>()
        .map_err(|_| ProxyError::MalformedRequest(format!("Invalid port: {s}")))
}

/// `content-type` → `Content-Type`.
fn title_case(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

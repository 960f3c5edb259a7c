//-
// Copyright (c) 2025, Briefbox developers
//
// This file is part of Briefbox.
//
// Briefbox is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Briefbox is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along
// with Briefbox. If not, see <http://www.gnu.org/licenses/>.

//! A deliberately small HTTP/1.1 responder: request line, headers,
//! `Content-Length` bodies, keep-alive. It serves exactly what the JSON API
//! needs and nothing more: no TLS (terminate in front), no chunked
//! requests, no upgrades.
//!
//! The line-loop shape is the same as the SMTP receiver's: bounded
//! `read_until` reads with an idle deadline, one parsed request per
//! iteration, and a buffered write of the whole response.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

const MAX_REQUEST_LINE: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_SESSIONS: usize = 512;

#[derive(Clone, Debug)]
pub struct Request {
    pub method: String,
    /// Path with the query string stripped, percent-decoded.
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names lower-cased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub peer_ip: IpAddr,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub content_type: String,
    pub extra_headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn json(status: u16, value: &impl Serialize) -> Response {
        Response {
            status,
            content_type: "application/json".to_owned(),
            extra_headers: Vec::new(),
            body: serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec()),
        }
    }

    pub fn text(status: u16, content_type: &str, body: String) -> Response {
        Response {
            status,
            content_type: content_type.to_owned(),
            extra_headers: Vec::new(),
            body: body.into_bytes(),
        }
    }

    pub fn binary(
        content_type: String,
        body: Vec<u8>,
        extra_headers: Vec<(String, String)>,
    ) -> Response {
        Response {
            status: 200,
            content_type,
            extra_headers,
            body,
        }
    }
}

/// Serves `handler` on `listener` until the task is aborted.
pub async fn serve<F, Fut>(listener: TcpListener, max_body: usize, handler: F)
where
    F: Fn(Request) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send,
{
    let sessions = Arc::new(Semaphore::new(MAX_SESSIONS));

    loop {
        let Ok(permit) = Arc::clone(&sessions).acquire_owned().await else {
            return;
        };

        match listener.accept().await {
            Ok((socket, peer)) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) =
                        serve_connection(socket, peer.ip(), max_body, handler)
                            .await
                    {
                        // EOF between requests is the normal way for a
                        // keep-alive client to leave.
                        if io::ErrorKind::UnexpectedEof != e.kind() {
                            info!("http:{} connection ended: {}", peer, e);
                        }
                    }
                });
            },
            Err(e) => {
                warn!("HTTP accept failed: {}", e);
            },
        }
    }
}

async fn serve_connection<F, Fut>(
    socket: TcpStream,
    peer_ip: IpAddr,
    max_body: usize,
    handler: F,
) -> io::Result<()>
where
    F: Fn(Request) -> Fut,
    Fut: Future<Output = Response>,
{
    let mut io = BufStream::new(socket);

    loop {
        let request =
            match tokio::time::timeout(
                IDLE_TIMEOUT,
                read_request(&mut io, peer_ip, max_body),
            )
            .await
            {
                Ok(Ok(Some(request))) => request,
                // Clean close or parse-level rejection already answered.
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) => return Ok(()),
            };

        let close = request
            .header("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);

        let response = handler(request).await;
        write_response(&mut io, &response, close).await?;

        if close {
            return Ok(());
        }
    }
}

/// Reads one request. `Ok(None)` means the connection should close quietly
/// (clean EOF, or a malformed request that was already answered).
async fn read_request(
    io: &mut BufStream<TcpStream>,
    peer_ip: IpAddr,
    max_body: usize,
) -> io::Result<Option<Request>> {
    let request_line = match read_crlf_line(io).await? {
        Some(line) => line,
        None => return Ok(None),
    };

    let mut parts = request_line.split(' ');
    let (Some(method), Some(target), Some(version)) =
        (parts.next(), parts.next(), parts.next())
    else {
        reject(io, 400, "malformed request line").await?;
        return Ok(None);
    };
    if !version.starts_with("HTTP/1.") {
        reject(io, 505, "unsupported HTTP version").await?;
        return Ok(None);
    }

    let mut headers = HashMap::new();
    loop {
        let Some(line) = read_crlf_line(io).await? else {
            return Ok(None);
        };
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADERS {
            reject(io, 431, "too many headers").await?;
            return Ok(None);
        }

        if let Some((name, value)) = line.split_once(':') {
            headers
                .insert(name.trim().to_lowercase(), value.trim().to_owned());
        }
    }

    if headers.contains_key("transfer-encoding") {
        reject(io, 501, "chunked requests are not supported").await?;
        return Ok(None);
    }

    let content_length = match headers
        .get("content-length")
        .map(|v| v.parse::<usize>())
        .transpose()
    {
        Ok(length) => length.unwrap_or(0),
        Err(_) => {
            reject(io, 400, "bad Content-Length").await?;
            return Ok(None);
        },
    };
    if content_length > max_body {
        reject(io, 413, "request body too large").await?;
        return Ok(None);
    }

    let mut body = vec![0u8; content_length];
    io.read_exact(&mut body).await?;

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (target, HashMap::new()),
    };

    Ok(Some(Request {
        method: method.to_owned(),
        path: percent_decode(path),
        query,
        headers,
        body,
        peer_ip,
    }))
}

async fn read_crlf_line(
    io: &mut BufStream<TcpStream>,
) -> io::Result<Option<String>> {
    let mut buffer = Vec::new();
    let nread = io
        .take(MAX_REQUEST_LINE as u64)
        .read_until(b'\n', &mut buffer)
        .await?;

    if 0 == nread {
        return Ok(None);
    }
    if !buffer.ends_with(b"\n") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "line too long or truncated",
        ));
    }

    while buffer.ends_with(b"\n") || buffer.ends_with(b"\r") {
        buffer.pop();
    }

    String::from_utf8(buffer)
        .map(Some)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8"))
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => {
                (percent_decode(name), percent_decode(value))
            },
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut ix = 0;

    while ix < bytes.len() {
        match bytes[ix] {
            b'%' => {
                match s
                    .get(ix + 1..ix + 3)
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                {
                    Some(byte) => {
                        out.push(byte);
                        ix += 3;
                    },
                    None => {
                        out.push(b'%');
                        ix += 1;
                    },
                }
            },
            b'+' => {
                out.push(b' ');
                ix += 1;
            },
            byte => {
                out.push(byte);
                ix += 1;
            },
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

async fn reject(
    io: &mut BufStream<TcpStream>,
    status: u16,
    message: &str,
) -> io::Result<()> {
    let response = Response::json(
        status,
        &serde_json::json!({
            "error": { "code": "VALIDATION_ERROR", "message": message }
        }),
    );
    write_response(io, &response, true).await
}

async fn write_response(
    io: &mut BufStream<TcpStream>,
    response: &Response,
    close: bool,
) -> io::Result<()> {
    use std::fmt::Write as _;

    let mut head = String::new();
    let _ = write!(
        head,
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: {}\r\n",
        response.status,
        reason_phrase(response.status),
        response.content_type,
        response.body.len(),
        if close { "close" } else { "keep-alive" },
    );
    for (name, value) in &response.extra_headers {
        let _ = write!(head, "{}: {}\r\n", name, value);
    }
    head.push_str("\r\n");

    io.write_all(head.as_bytes()).await?;
    io.write_all(&response.body).await?;
    io.flush().await
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        409 => "Conflict",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn query_parsing() {
        let query = parse_query("since_uid=u%201&fetch_new=true&flag");
        assert_eq!(Some(&"u 1".to_owned()), query.get("since_uid"));
        assert_eq!(Some(&"true".to_owned()), query.get("fetch_new"));
        assert_eq!(Some(&String::new()), query.get("flag"));
    }

    #[test]
    fn percent_decoding() {
        assert_eq!("a b", percent_decode("a%20b"));
        assert_eq!("a b", percent_decode("a+b"));
        assert_eq!("100%", percent_decode("100%"));
        assert_eq!("%zz", percent_decode("%zz"));
    }

    #[test]
    fn end_to_end_round_trip() {
        crate::init_test_log();
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(serve(listener, 1024, |request: Request| async move {
                Response::json(
                    200,
                    &serde_json::json!({
                        "method": request.method,
                        "path": request.path,
                        "body_len": request.body.len(),
                    }),
                )
            }));

            let socket = TcpStream::connect(addr).await.unwrap();
            let mut io = BufStream::new(socket);
            io.write_all(
                b"POST /v1/inboxes?x=1 HTTP/1.1\r\n\
                  Host: test\r\n\
                  Content-Length: 4\r\n\
                  Connection: close\r\n\
                  \r\n\
                  {\"\"}",
            )
            .await
            .unwrap();
            io.flush().await.unwrap();

            let mut response = Vec::new();
            io.read_to_end(&mut response).await.unwrap();
            let response = String::from_utf8_lossy(&response);
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
            assert!(response.contains("\"path\":\"/v1/inboxes\""));
            assert!(response.contains("\"body_len\":4"));
        });
    }
}

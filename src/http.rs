//! Request/response cycle against the gateway's HTTP/0.9-style API.
//!
//! The gateway's web server may omit the status line and never frames the
//! body reliably, so requests go over a raw socket and the response ends
//! when the peer closes the connection.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace};

use crate::logger::MessageLogger;
use crate::protocol::check_err;
use crate::{Error, Result};

/// Gateway replies are a few KiB at most.
const MAX_RESPONSE_BYTES: usize = 256 * 1024;

pub(crate) struct HttpTransport {
    host: String,
    port: u16,
    authorization: Option<String>,
    timeout: Duration,
    logger: Option<Arc<Mutex<MessageLogger>>>,
}

impl HttpTransport {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Self {
        let authorization = (!username.is_empty() || !password.is_empty())
            .then(|| format!("Basic {}", STANDARD.encode(format!("{username}:{password}"))));
        Self {
            host: host.into(),
            port,
            authorization,
            timeout,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: Option<Arc<Mutex<MessageLogger>>>) -> Self {
        self.logger = logger;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn request_bytes(&self, path_and_query: &str) -> Vec<u8> {
        let mut req = format!("GET {path_and_query} HTTP/1.0\r\nHost: {}\r\n", self.host);
        if let Some(auth) = &self.authorization {
            req.push_str(&format!("Authorization: {auth}\r\n"));
        }
        req.push_str("\r\n");
        req.into_bytes()
    }

    /// One GET on a fresh connection. Not retried.
    pub async fn request(&self, path_and_query: &str) -> Result<Value> {
        let addr = self.addr();
        let deadline = Instant::now() + self.timeout;
        debug!(addr = %addr, path = %path_and_query, "gateway request");

        if let Some(logger) = &self.logger {
            logger
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .log_request(path_and_query);
        }

        let mut stream = match timeout_at(deadline, TcpStream::connect(&addr)).await {
            Err(_) => return Err(Error::TransportTimeout),
            Ok(Err(source)) => return Err(Error::TransportConnectFailed { addr, source }),
            Ok(Ok(stream)) => stream,
        };

        let raw = match timeout_at(deadline, exchange(&mut stream, &self.request_bytes(path_and_query))).await {
            Err(_) => return Err(Error::TransportTimeout),
            Ok(result) => result?,
        };
        trace!(bytes = raw.len(), "gateway response received");

        let body = parse_response(&raw)?;
        if let Some(logger) = &self.logger {
            logger
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .log_response(path_and_query, &body);
        }

        check_err(&body)?;
        Ok(body)
    }
}

async fn exchange(stream: &mut TcpStream, request: &[u8]) -> Result<Vec<u8>> {
    stream.write_all(request).await?;
    stream.flush().await?;
    let mut raw = Vec::with_capacity(1024);
    stream
        .take(MAX_RESPONSE_BYTES as u64 + 1)
        .read_to_end(&mut raw)
        .await?;
    if raw.len() > MAX_RESPONSE_BYTES {
        return Err(Error::Protocol(format!(
            "response exceeds {MAX_RESPONSE_BYTES} bytes"
        )));
    }
    Ok(raw)
}

/// Strip an optional status line + header block and return the JSON body.
pub(crate) fn response_body(raw: &[u8]) -> &[u8] {
    if !raw.starts_with(b"HTTP/") {
        return raw;
    }
    if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
        return &raw[pos + 4..];
    }
    if let Some(pos) = raw.windows(2).position(|w| w == b"\n\n") {
        return &raw[pos + 2..];
    }
    // status line with no body
    &raw[raw.len()..]
}

pub(crate) fn parse_response(raw: &[u8]) -> Result<Value> {
    let body = response_body(raw);
    // tolerate stray bytes around the JSON object
    let start = body.iter().position(|b| *b == b'{');
    let end = body.iter().rposition(|b| *b == b'}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => Ok(serde_json::from_slice(&body[start..=end])?),
        _ => Err(Error::Protocol(format!(
            "no JSON object in response: {:?}",
            String::from_utf8_lossy(&raw[..raw.len().min(128)])
        ))),
    }
}

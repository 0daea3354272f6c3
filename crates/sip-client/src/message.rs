//! Minimal SIP message building and parsing
//!
//! Only the subset this client speaks: outbound INVITE/ACK/INFO/BYE
//! requests and inbound responses (plus the remote BYE a camera sends when
//! it tears the call down first). Messages are built as text, the way the
//! vendor's own clients do.

use std::fmt;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{Error, Result};

/// SIP methods used by the legacy negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Invite,
    Ack,
    Info,
    Bye,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Info => "INFO",
            Method::Bye => "BYE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outbound SIP request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, content_type: &str, body: impl Into<String>) -> Self {
        self.headers
            .push(("Content-Type".into(), content_type.into()));
        self.body = body.into();
        self
    }

    /// Serialize to wire form. Content-Length is always appended last.
    pub fn to_wire(&self) -> String {
        let mut out = format!("{} {} SIP/2.0\r\n", self.method, self.uri);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        out.push_str(&self.body);
        out
    }
}

/// An inbound SIP response
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Response {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True for 1xx provisional responses, which the transaction loop skips
    pub fn is_provisional(&self) -> bool {
        self.status < 200
    }

    /// The `tag` parameter of the To header, assigned by the remote
    pub fn to_tag(&self) -> Option<&str> {
        let to = self.header("To")?;
        to.split(';')
            .find_map(|param| param.trim().strip_prefix("tag="))
    }
}

/// Either kind of inbound message
#[derive(Debug)]
pub enum Incoming {
    Response(Response),
    /// A request from the remote (in practice only BYE); carries the
    /// method name and the headers needed to acknowledge it.
    Request {
        method: String,
        headers: Vec<(String, String)>,
    },
}

/// Read one SIP message off the stream: start line, headers through the
/// blank line, then exactly Content-Length bytes of body.
pub async fn read_message<R>(reader: &mut R) -> Result<Incoming>
where
    R: AsyncBufRead + Unpin,
{
    let start_line = read_line(reader).await?;
    let mut headers = Vec::new();
    loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::MalformedMessage(format!("bad header line: {line}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let content_length: usize = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;
    let body = String::from_utf8_lossy(&body).into_owned();

    if let Some(rest) = start_line.strip_prefix("SIP/2.0 ") {
        let (status, reason) = rest
            .split_once(' ')
            .map(|(s, r)| (s, r.to_string()))
            .unwrap_or((rest, String::new()));
        let status = status
            .parse()
            .map_err(|_| Error::MalformedMessage(format!("bad status line: {start_line}")))?;
        Ok(Incoming::Response(Response {
            status,
            reason,
            headers,
            body,
        }))
    } else {
        let method = start_line
            .split(' ')
            .next()
            .unwrap_or_default()
            .to_string();
        if method.is_empty() {
            return Err(Error::MalformedMessage(format!(
                "bad request line: {start_line}"
            )));
        }
        Ok(Incoming::Request { method, headers })
    }
}

async fn read_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(Error::RemoteHangup);
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

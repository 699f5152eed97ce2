use std::fmt;

use anyhow::{Result, bail};
use log::debug;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use url::{Host, Url};

use crate::reader::ReaderBuf;

/// Maximum number of headers accepted in a request head.
const MAX_HEADERS: usize = 96;
/// Same for response heads, which tend to carry more (cookies, etc.).
const MAX_RESPONSE_HEADERS: usize = 128;

/// Port used for CONNECT targets without an explicit one. Tunnels are mostly
/// used for TLS and 443 would make more sense, but 80 is what clients of this
/// proxy historically got.
const DEFAULT_TUNNEL_PORT: u16 = 80;

#[derive(Error, Debug)]
pub(crate) enum Error {
    #[error("invalid request head: {0}")]
    Parse(#[from] httparse::Error),
    #[error("incomplete request line")]
    RequestLine,
    #[error("incomplete status line")]
    StatusLine,
    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("connection closed before the end of the request head")]
    Truncated,
    #[error("invalid request target '{0}'")]
    InvalidTarget(String),
    #[error("unsupported scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("invalid message framing: {0}")]
    InvalidBody(String),
    #[error("invalid chunk size line")]
    ChunkSize,
    #[error("connection closed in the middle of a message body")]
    BodyTruncated,
}

impl Error {
    /// Status to report to the client, if it can still receive one.
    pub(crate) fn status(&self) -> Option<Status> {
        match self {
            Error::HeadTooLarge(_) => Some(Status::HeaderFieldsTooLarge),
            Error::Truncated | Error::BodyTruncated => None,
            _ => Some(Status::BadRequest),
        }
    }
}

/// Statuses the proxy generates by itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Status {
    BadRequest,
    RequestTimeout,
    HeaderFieldsTooLarge,
    BadGateway,
    GatewayTimeout,
}

impl Status {
    pub(crate) fn code(self) -> u16 {
        match self {
            Status::BadRequest => 400,
            Status::RequestTimeout => 408,
            Status::HeaderFieldsTooLarge => 431,
            Status::BadGateway => 502,
            Status::GatewayTimeout => 504,
        }
    }

    pub(crate) fn reason(self) -> &'static str {
        match self {
            Status::BadRequest => "Bad Request",
            Status::RequestTimeout => "Request Timeout",
            Status::HeaderFieldsTooLarge => "Request Header Fields Too Large",
            Status::BadGateway => "Bad Gateway",
            Status::GatewayTimeout => "Gateway Timeout",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Response sent to the client once a tunnel is established. Nothing else is
/// ever sent by the proxy itself on a tunnel.
pub(crate) fn established_response(agent: &str) -> String {
    format!("HTTP/1.1 200 Connection Established\r\nProxy-agent: {agent}\r\n\r\n")
}

/// Response sent to the client when the proxy can't handle its request. The
/// connection is closed right after.
pub(crate) fn error_response(status: Status, agent: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nProxy-agent: {agent}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    )
}

/// Write an error response to the client.
pub(crate) async fn reply<W>(w: &mut W, status: Status, agent: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(error_response(status, agent).as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Same as `reply`, for when the connection is closed right after anyway. The
/// client might be gone already, which is not worth more than a debug log.
pub(crate) async fn try_reply<W>(w: &mut W, status: Status, agent: &str)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = reply(w, status, agent).await {
        debug!("Could not send '{status}' to the client: {e}");
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Scheme {
    Http,
    Https,
}

/// Parsed request head. Headers are kept in order, with their names and raw
/// values as received, so they can be replayed unmodified.
#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) method: String,
    /// Request target, as found in the request line.
    pub(crate) target: String,
    /// HTTP/1.x minor version.
    pub(crate) version: u8,
    pub(crate) headers: Vec<(String, Vec<u8>)>,
}

impl Request {
    /// Try parsing a request head from `buf`. Returns the request and the
    /// length of its head in `buf`, or None if the head is not complete yet.
    pub(crate) fn parse(buf: &[u8]) -> Result<Option<(Request, usize)>, Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let len = match req.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };

        let (Some(method), Some(target), Some(version)) = (req.method, req.path, req.version)
        else {
            return Err(Error::RequestLine);
        };

        Ok(Some((
            Request {
                method: method.to_string(),
                target: target.to_string(),
                version,
                headers: req
                    .headers
                    .iter()
                    .map(|h| (h.name.to_string(), h.value.to_vec()))
                    .collect(),
            },
            len,
        )))
    }

    /// Is this a request for a tunnel?
    pub(crate) fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    /// How the request body is delimited. Requests can't be delimited by the
    /// end of the connection.
    pub(crate) fn body(&self) -> Result<Body, Error> {
        match framing(&self.headers)? {
            Some(Body::UntilClose) => Err(Error::InvalidBody(
                "transfer-encoding not ending with chunked".to_string(),
            )),
            Some(body) => Ok(body),
            None => Ok(Body::Empty),
        }
    }

    /// Describes a forward request, from its absolute URL target.
    pub(crate) fn forward_descriptor(&self) -> Result<RequestDescriptor, Error> {
        let url =
            Url::parse(&self.target).map_err(|_| Error::InvalidTarget(self.target.clone()))?;

        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            x => return Err(Error::UnsupportedScheme(x.to_string())),
        };

        let host = url_host(&url).ok_or_else(|| Error::InvalidTarget(self.target.clone()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::InvalidTarget(self.target.clone()))?;

        Ok(RequestDescriptor {
            method: self.method.clone(),
            scheme,
            host,
            port,
            path: Some(origin_form(&self.target)),
        })
    }

    /// Describes a tunnel request, from its <host>[:<port>] target.
    pub(crate) fn tunnel_descriptor(&self) -> Result<RequestDescriptor, Error> {
        // Only an authority is allowed here.
        if self.target.is_empty() || self.target.contains(['/', '?', '#', '@']) {
            return Err(Error::InvalidTarget(self.target.clone()));
        }

        let url = Url::parse(&format!("http://{}", self.target))
            .map_err(|_| Error::InvalidTarget(self.target.clone()))?;
        let host = url_host(&url).ok_or_else(|| Error::InvalidTarget(self.target.clone()))?;

        Ok(RequestDescriptor {
            method: self.method.clone(),
            scheme: Scheme::Http,
            host,
            port: url.port().unwrap_or(DEFAULT_TUNNEL_PORT),
            path: None,
        })
    }

    /// Builds the head of the request sent to the destination: the request
    /// line uses the origin form of the target, headers are replayed as-is.
    pub(crate) fn outbound_head(&self, path: &str) -> Vec<u8> {
        let mut head = format!("{} {path} HTTP/1.{}\r\n", self.method, self.version).into_bytes();
        for (name, value) in self.headers.iter() {
            head.extend_from_slice(name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value);
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");
        head
    }
}

/// Parsed response head.
#[derive(Debug)]
pub(crate) struct Response {
    /// HTTP/1.x minor version.
    pub(crate) version: u8,
    pub(crate) code: u16,
    pub(crate) headers: Vec<(String, Vec<u8>)>,
}

impl Response {
    /// Try parsing a response head from `buf`, see `Request::parse`.
    pub(crate) fn parse(buf: &[u8]) -> Result<Option<(Response, usize)>, Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);

        let len = match resp.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };

        let (Some(version), Some(code)) = (resp.version, resp.code) else {
            return Err(Error::StatusLine);
        };

        Ok(Some((
            Response {
                version,
                code,
                headers: resp
                    .headers
                    .iter()
                    .map(|h| (h.name.to_string(), h.value.to_vec()))
                    .collect(),
            },
            len,
        )))
    }

    /// 1xx responses are followed by another response to the same request.
    pub(crate) fn is_informational(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// How the response body is delimited, given the method of the request
    /// it answers.
    pub(crate) fn body(&self, method: &str) -> Result<Body, Error> {
        if method == "HEAD" || self.is_informational() || matches!(self.code, 204 | 304) {
            return Ok(Body::Empty);
        }
        Ok(framing(&self.headers)?.unwrap_or(Body::UntilClose))
    }
}

/// How a message body is delimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Body {
    Empty,
    Length(u64),
    Chunked,
    /// The body ends with the connection, responses only.
    UntilClose,
}

/// Finds out the body framing from the message headers, if they say anything
/// about it. Transfer-Encoding wins over Content-Length.
fn framing(headers: &[(String, Vec<u8>)]) -> Result<Option<Body>, Error> {
    if let Some(coding) = header_tokens(headers, "transfer-encoding").last() {
        return Ok(Some(match coding.eq_ignore_ascii_case(b"chunked") {
            true => Body::Chunked,
            false => Body::UntilClose,
        }));
    }

    let mut len = None;
    for value in header_tokens(headers, "content-length") {
        let parsed = match value.iter().all(u8::is_ascii_digit) {
            true => std::str::from_utf8(value).ok().and_then(|v| v.parse().ok()),
            false => None,
        };
        match (parsed, len) {
            (None, _) => {
                return Err(Error::InvalidBody(format!(
                    "content-length '{}'",
                    String::from_utf8_lossy(value)
                )));
            }
            (Some(x), Some(y)) if x != y => {
                return Err(Error::InvalidBody(
                    "conflicting content-length values".to_string(),
                ));
            }
            (x, _) => len = x,
        }
    }

    Ok(len.map(Body::Length))
}

/// Comma separated elements of all the `name` headers, in order.
fn header_tokens<'a>(
    headers: &'a [(String, Vec<u8>)],
    name: &'a str,
) -> impl Iterator<Item = &'a [u8]> + 'a {
    headers
        .iter()
        .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
        .flat_map(|(_, value)| value.split(|b| *b == b','))
        .map(|token| token.trim_ascii())
        .filter(|token| !token.is_empty())
}

/// Where and how to reach the destination of a request.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct RequestDescriptor {
    pub(crate) method: String,
    /// Always `Http` for tunnels, the proxy does not know what goes through.
    pub(crate) scheme: Scheme,
    /// Hostname or IP address, without brackets for IPv6 ones.
    pub(crate) host: String,
    pub(crate) port: u16,
    /// Path and query, for forward requests only.
    pub(crate) path: Option<String>,
}

impl RequestDescriptor {
    /// Destination in the <host>:<port> form.
    pub(crate) fn authority(&self) -> String {
        match self.host.contains(':') {
            true => format!("[{}]:{}", self.host, self.port),
            false => format!("{}:{}", self.host, self.port),
        }
    }
}

fn url_host(url: &Url) -> Option<String> {
    Some(match url.host()? {
        Host::Domain(domain) if domain.is_empty() => return None,
        Host::Domain(domain) => domain.to_string(),
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    })
}

/// Extract the path and query of an absolute URL, verbatim. The fragment is
/// dropped and an empty path becomes `/`.
fn origin_form(target: &str) -> String {
    // Skip the scheme and the authority.
    let rest = target.split_once("://").map_or(target, |(_, rest)| rest);
    let rest = rest.find(['/', '?', '#']).map_or("", |i| &rest[i..]);
    let rest = rest.split_once('#').map_or(rest, |(rest, _)| rest);

    match rest.starts_with('/') {
        true => rest.to_string(),
        false => format!("/{rest}"),
    }
}

/// Read a request head from the client, up to `max` bytes. Returns the parsed
/// request and the length of its head; data past the head (if any) stays in
/// the reader buffer.
pub(crate) async fn read_request<R>(rb: &mut ReaderBuf<R>, max: usize) -> Result<(Request, usize)>
where
    R: AsyncRead + Unpin,
{
    read_head(rb, max, Request::parse).await
}

/// Read a response head from a destination, see `read_request`.
pub(crate) async fn read_response<R>(
    rb: &mut ReaderBuf<R>,
    max: usize,
) -> Result<(Response, usize)>
where
    R: AsyncRead + Unpin,
{
    read_head(rb, max, Response::parse).await
}

async fn read_head<R, T, F>(rb: &mut ReaderBuf<R>, max: usize, parse: F) -> Result<(T, usize)>
where
    R: AsyncRead + Unpin,
    F: Fn(&[u8]) -> Result<Option<(T, usize)>, Error>,
{
    loop {
        if let Some(parsed) = parse(rb.buf())? {
            return Ok(parsed);
        }

        if rb.len() >= max {
            bail!(Error::HeadTooLarge(max));
        }
        if rb.fill(max - rb.len()).await? == 0 {
            bail!(Error::Truncated);
        }
    }
}

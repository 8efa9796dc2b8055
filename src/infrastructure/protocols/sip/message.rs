//! SIP message types and parsing
//!
//! Parsing is deliberately tolerant: header names are case-insensitive,
//! compact forms are expanded, folded lines are joined and a repeated
//! header keeps its last value. Unknown headers are kept, never rejected.

use super::auth::AuthError;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transaction timed out: {0}")]
    Timeout(String),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),
}

impl From<std::io::Error> for SipError {
    fn from(err: std::io::Error) -> Self {
        SipError::Transport(err.to_string())
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Publish => "PUBLISH",
        }
    }
}

impl FromStr for SipMethod {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "CANCEL" => SipMethod::Cancel,
            "BYE" => SipMethod::Bye,
            "OPTIONS" => SipMethod::Options,
            "INFO" => SipMethod::Info,
            "UPDATE" => SipMethod::Update,
            "PRACK" => SipMethod::Prack,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "REFER" => SipMethod::Refer,
            "MESSAGE" => SipMethod::Message,
            "PUBLISH" => SipMethod::Publish,
            other => return Err(SipError::Parse(format!("unknown method {}", other))),
        })
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// First line of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, uri: String },
    Status { code: u16, reason: String },
}

/// What a message means to the user agent.
///
/// Computed once at parse time so downstream code can match exhaustively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// 1xx other than ringing
    Provisional(u16),
    /// 180 Ringing or 183 Session Progress
    Ringing(u16),
    /// 2xx
    Success(u16),
    /// 401
    Unauthorized,
    /// 407
    ProxyAuthRequired,
    /// Any other final response
    Failure(u16),
    /// A request with a method we know
    Request(SipMethod),
    /// A request with a method we do not implement
    UnknownRequest(String),
}

impl MessageKind {
    fn classify(start_line: &StartLine) -> Self {
        match start_line {
            StartLine::Status { code, .. } => match *code {
                180 | 183 => MessageKind::Ringing(*code),
                100..=199 => MessageKind::Provisional(*code),
                200..=299 => MessageKind::Success(*code),
                401 => MessageKind::Unauthorized,
                407 => MessageKind::ProxyAuthRequired,
                code => MessageKind::Failure(code),
            },
            StartLine::Request { method, .. } => match method.parse::<SipMethod>() {
                Ok(method) => MessageKind::Request(method),
                Err(_) => MessageKind::UnknownRequest(method.clone()),
            },
        }
    }
}

/// Case-insensitive header map. A repeated header keeps its last value.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    headers: HashMap<String, String>,
}

impl HeaderMap {
    pub fn insert(&mut self, name: &str, value: String) {
        self.headers.insert(canonical_name(name), value);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(&canonical_name(name)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

/// Lowercase a header name and expand RFC 3261 §7.3.3 compact forms
fn canonical_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match lower.as_str() {
        "i" => "call-id".to_string(),
        "v" => "via".to_string(),
        "f" => "from".to_string(),
        "t" => "to".to_string(),
        "m" => "contact".to_string(),
        "l" => "content-length".to_string(),
        "c" => "content-type".to_string(),
        "k" => "supported".to_string(),
        _ => lower,
    }
}

/// A parsed SIP request or response
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub start_line: StartLine,
    pub kind: MessageKind,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ParsedMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request { .. })
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Status { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }

    pub fn reason_phrase(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Status { reason, .. } => Some(reason),
            StartLine::Request { .. } => None,
        }
    }

    pub fn request_uri(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Status { .. } => None,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("call-id")
    }

    /// CSeq number and method
    pub fn cseq(&self) -> Option<(u32, SipMethod)> {
        let value = self.header("cseq")?;
        let mut parts = value.split_whitespace();
        let number = parts.next()?.parse().ok()?;
        let method = parts.next()?.parse().ok()?;
        Some((number, method))
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.header("from").and_then(|v| header_param(v, "tag"))
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.header("to").and_then(|v| header_param(v, "tag"))
    }

    pub fn via_branch(&self) -> Option<&str> {
        self.header("via").and_then(|v| header_param(v, "branch"))
    }

    /// URI inside the From header, without display name or parameters
    pub fn from_uri(&self) -> Option<&str> {
        self.header("from").map(header_uri)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

/// Find `;name=value` after the URI part of a header value
pub fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    let params = match value.rfind('>') {
        Some(end) => &value[end + 1..],
        None => value,
    };
    params.split(';').skip(1).find_map(|param| {
        let (key, val) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(val.trim())
        } else {
            None
        }
    })
}

/// Strip display name, angle brackets and parameters from a name-addr
pub fn header_uri(value: &str) -> &str {
    if let (Some(start), Some(end)) = (value.find('<'), value.find('>')) {
        if start < end {
            return &value[start + 1..end];
        }
    }
    value.split(';').next().unwrap_or(value).trim()
}

/// Parse a datagram into a message.
///
/// Fails only when the start line is missing or malformed.
pub fn parse_message(data: &[u8]) -> Result<ParsedMessage, SipError> {
    let (head, body) = split_head_body(data);
    let head = String::from_utf8_lossy(head);
    let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

    let first = lines
        .next()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| SipError::Parse("missing start line".to_string()))?;
    let start_line = parse_start_line(first)?;

    let mut headers = HeaderMap::default();
    let mut current: Option<(String, String)> = None;
    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            // Folded continuation of the previous header
            if let Some((_, value)) = current.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = current.take() {
            headers.insert(&name, value);
        }
        if let Some((name, value)) = line.split_once(':') {
            current = Some((name.to_string(), value.trim().to_string()));
        }
    }
    if let Some((name, value)) = current {
        headers.insert(&name, value);
    }

    let mut body = Bytes::copy_from_slice(body);
    if let Some(length) = headers
        .get("content-length")
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        if length < body.len() {
            body.truncate(length);
        }
    }

    Ok(ParsedMessage {
        kind: MessageKind::classify(&start_line),
        start_line,
        headers,
        body,
    })
}

fn split_head_body(data: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find(data, b"\r\n\r\n") {
        return (&data[..pos], &data[pos + 4..]);
    }
    if let Some(pos) = find(data, b"\n\n") {
        return (&data[..pos], &data[pos + 2..]);
    }
    (data, &[])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_start_line(line: &str) -> Result<StartLine, SipError> {
    if let Some(rest) = line.strip_prefix("SIP/2.0") {
        let rest = rest.trim_start();
        let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        let code: u16 = code
            .parse()
            .ok()
            .filter(|c| (100..700).contains(c))
            .ok_or_else(|| SipError::Parse(format!("malformed status line: {}", line)))?;
        return Ok(StartLine::Status {
            code,
            reason: reason.trim().to_string(),
        });
    }

    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(uri), Some("SIP/2.0"), None) => Ok(StartLine::Request {
            method: method.to_string(),
            uri: uri.to_string(),
        }),
        _ => Err(SipError::Parse(format!("malformed request line: {}", line))),
    }
}

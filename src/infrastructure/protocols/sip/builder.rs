//! SIP message builder utilities
//!
//! Requests are built with a fixed header order so retransmissions and
//! tests see byte-identical layouts.

use super::message::{ParsedMessage, SipError, SipMethod};
use bytes::Bytes;
use std::fmt::Write as _;

pub const MAX_FORWARDS: u32 = 70;

/// Methods this agent handles, advertised in `Allow`
pub const ALLOWED_METHODS: &str = "INVITE, ACK, CANCEL, BYE, OPTIONS";

/// Everything needed to lay out an outgoing request besides method and target
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    pub username: String,
    pub server: String,
    /// Advertised `host:port` used in Via and Contact
    pub local_address: String,
    pub branch: String,
    pub local_tag: String,
    pub to_uri: String,
    pub to_tag: Option<String>,
    pub call_id: String,
    pub cseq: u32,
    /// Header name and value, e.g. `("Authorization", "Digest ...")`
    pub authorization: Option<(&'static str, String)>,
    pub content_type: Option<String>,
    /// Additional headers, emitted after authorization
    pub extra: Vec<(String, String)>,
}

/// Render a request.
///
/// Header order: Via, Max-Forwards, From, To, Call-ID, CSeq, Contact,
/// Authorization, extra headers, Content-Type, Content-Length.
pub fn build_request(
    method: SipMethod,
    target: &str,
    headers: &RequestHeaders,
    body: &[u8],
) -> Result<Bytes, SipError> {
    if headers.username.is_empty() {
        return Err(SipError::Encoding("username is empty".to_string()));
    }
    if headers.server.is_empty() {
        return Err(SipError::Encoding("server is empty".to_string()));
    }
    if target.is_empty() {
        return Err(SipError::Encoding("request target is empty".to_string()));
    }

    let mut out = String::with_capacity(512 + body.len());
    let _ = write!(out, "{} {} SIP/2.0\r\n", method, target);
    let _ = write!(
        out,
        "Via: SIP/2.0/UDP {};branch={}\r\n",
        headers.local_address, headers.branch
    );
    let _ = write!(out, "Max-Forwards: {}\r\n", MAX_FORWARDS);
    let _ = write!(
        out,
        "From: <sip:{}@{}>;tag={}\r\n",
        headers.username, headers.server, headers.local_tag
    );
    match &headers.to_tag {
        Some(tag) => {
            let _ = write!(out, "To: <{}>;tag={}\r\n", headers.to_uri, tag);
        }
        None => {
            let _ = write!(out, "To: <{}>\r\n", headers.to_uri);
        }
    }
    let _ = write!(out, "Call-ID: {}\r\n", headers.call_id);
    let _ = write!(out, "CSeq: {} {}\r\n", headers.cseq, method);
    let _ = write!(
        out,
        "Contact: <sip:{}@{}>\r\n",
        headers.username, headers.local_address
    );
    if let Some((name, value)) = &headers.authorization {
        let _ = write!(out, "{}: {}\r\n", name, value);
    }
    for (name, value) in &headers.extra {
        let _ = write!(out, "{}: {}\r\n", name, value);
    }
    if let Some(content_type) = &headers.content_type {
        let _ = write!(out, "Content-Type: {}\r\n", content_type);
    }
    let _ = write!(out, "Content-Length: {}\r\n\r\n", body.len());

    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(body);
    Ok(Bytes::from(bytes))
}

/// Standard reason phrase for the status codes this agent sends
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        603 => "Decline",
        _ => "Unknown",
    }
}

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    to_tag: Option<String>,
    headers: Vec<(String, String)>,
    content_type: Option<String>,
    body: Bytes,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            to_tag: None,
            headers: Vec::new(),
            content_type: None,
            body: Bytes::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    /// Local tag added to To when the request did not carry one
    pub fn to_tag(mut self, tag: &str) -> Self {
        self.to_tag = Some(tag.to_string());
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, content_type: &str, body: Bytes) -> Self {
        self.content_type = Some(content_type.to_string());
        self.body = body;
        self
    }

    /// Copy Via, From, To, Call-ID and CSeq from the request and render
    pub fn build_for_request(self, request: &ParsedMessage) -> Result<Bytes, SipError> {
        let required = |name: &str| {
            request
                .header(name)
                .ok_or_else(|| SipError::Encoding(format!("request has no {} header", name)))
        };
        let via = required("via")?;
        let from = required("from")?;
        let to = required("to")?;
        let call_id = required("call-id")?;
        let cseq = required("cseq")?;

        let mut out = String::with_capacity(512 + self.body.len());
        let _ = write!(
            out,
            "SIP/2.0 {} {}\r\n",
            self.status_code,
            reason_phrase(self.status_code)
        );
        let _ = write!(out, "Via: {}\r\n", via);
        let _ = write!(out, "From: {}\r\n", from);
        match &self.to_tag {
            Some(tag) if request.to_tag().is_none() => {
                let _ = write!(out, "To: {};tag={}\r\n", to, tag);
            }
            _ => {
                let _ = write!(out, "To: {}\r\n", to);
            }
        }
        let _ = write!(out, "Call-ID: {}\r\n", call_id);
        let _ = write!(out, "CSeq: {}\r\n", cseq);
        for (name, value) in &self.headers {
            let _ = write!(out, "{}: {}\r\n", name, value);
        }
        if let Some(content_type) = &self.content_type {
            let _ = write!(out, "Content-Type: {}\r\n", content_type);
        }
        let _ = write!(out, "Content-Length: {}\r\n\r\n", self.body.len());

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        Ok(Bytes::from(bytes))
    }
}

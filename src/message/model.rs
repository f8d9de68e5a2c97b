//! Message representation and copy-on-write edits.
//!
//! # Responsibilities
//! - Hold the structured view of one HTTP/1.1 request or response
//! - Keep the original head lines so untouched messages serialize unchanged
//! - Produce new versions on edit instead of mutating shared state
//! - Recompute `Content-Length` when the body changes (unless opted out)

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::message::parse::{self, BodyFraming, MalformedMessage};
use crate::session::CorrelationId;

/// Which way a message travels through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Client to origin.
    Request,
    /// Origin to client.
    Response,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Highlight colour attached to an intercepted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HighlightColor {
    Red,
    Orange,
    Yellow,
    Green,
    Cyan,
    Blue,
    Pink,
    Magenta,
    Gray,
}

/// Out-of-band metadata. Never written to the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations {
    pub highlight: Option<HighlightColor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

/// Line terminator observed on (or used for) a head line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineEnding {
    Crlf,
    Lf,
}

impl LineEnding {
    pub(crate) fn as_bytes(self) -> &'static [u8] {
        match self {
            LineEnding::Crlf => b"\r\n",
            LineEnding::Lf => b"\n",
        }
    }
}

/// A single header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    name: String,
    value: String,
    /// Exact source line including its terminator; `None` once edited.
    raw: Option<String>,
}

impl Header {
    /// Build a header, rejecting names that are not tokens and values that
    /// could not be written back as a single ISO-8859-1 line.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Result<Self, MalformedMessage> {
        let name = name.into();
        let value = value.into();
        if !is_token(&name) {
            return Err(MalformedMessage::InvalidField(format!("header name {:?}", name)));
        }
        if !is_field_text(&value) {
            return Err(MalformedMessage::InvalidField(format!("header value for {}", name)));
        }
        Ok(Self { name, value, raw: None })
    }

    pub(crate) fn parsed(name: String, value: String, raw: String) -> Self {
        Self {
            name,
            value,
            raw: Some(raw),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Case-insensitive name comparison.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Request line or status line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StartLine {
    Request {
        method: String,
        target: String,
        version: String,
    },
    Response {
        version: String,
        status: u16,
        reason: String,
    },
}

impl StartLine {
    pub fn request(method: impl Into<String>, target: impl Into<String>) -> Self {
        StartLine::Request {
            method: method.into(),
            target: target.into(),
            version: "HTTP/1.1".to_string(),
        }
    }

    pub fn response(status: u16, reason: impl Into<String>) -> Self {
        StartLine::Response {
            version: "HTTP/1.1".to_string(),
            status,
            reason: reason.into(),
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            StartLine::Request { .. } => Direction::Request,
            StartLine::Response { .. } => Direction::Response,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), MalformedMessage> {
        let ok = match self {
            StartLine::Request {
                method,
                target,
                version,
            } => {
                is_token(method)
                    && !target.is_empty()
                    && target.chars().all(|c| c > ' ' && c <= '\u{ff}' && c != '\u{7f}')
                    && is_version(version)
            }
            StartLine::Response {
                version,
                status,
                reason,
            } => is_version(version) && (100..=999).contains(status) && is_field_text(reason),
        };
        if ok {
            Ok(())
        } else {
            Err(MalformedMessage::StartLine(self.to_string()))
        }
    }
}

impl fmt::Display for StartLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartLine::Request {
                method,
                target,
                version,
            } => write!(f, "{} {} {}", method, target, version),
            StartLine::Response {
                version,
                status,
                reason,
            } => write!(f, "{} {} {}", version, status, reason),
        }
    }
}

/// One HTTP/1.1 message.
///
/// Cloning is cheap: the header list and body are reference counted and only
/// copied when an edit produces a new version.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    direction: Direction,
    start: StartLine,
    start_raw: Option<String>,
    line_ending: LineEnding,
    headers: Arc<Vec<Header>>,
    head_end: LineEnding,
    body: Bytes,
    /// Set for messages that never carry a body (HEAD responses, 1xx/204/304).
    bodiless: bool,
    correlation_id: Option<CorrelationId>,
    annotations: Annotations,
}

impl Message {
    /// Create an empty message from a start line.
    pub fn new(start: StartLine) -> Result<Self, MalformedMessage> {
        start.validate()?;
        let bodiless = match &start {
            StartLine::Response { status, .. } => status_is_bodiless(*status),
            StartLine::Request { .. } => false,
        };
        Ok(Self {
            direction: start.direction(),
            start,
            start_raw: None,
            line_ending: LineEnding::Crlf,
            headers: Arc::new(Vec::new()),
            head_end: LineEnding::Crlf,
            body: Bytes::new(),
            bodiless,
            correlation_id: None,
            annotations: Annotations::default(),
        })
    }

    /// Parse one complete message.
    pub fn parse(bytes: &[u8], direction: Direction) -> Result<Self, MalformedMessage> {
        parse::parse(bytes, direction, parse::ParseOptions::default())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        start: StartLine,
        start_raw: String,
        line_ending: LineEnding,
        headers: Vec<Header>,
        head_end: LineEnding,
        body: Bytes,
        bodiless: bool,
    ) -> Self {
        Self {
            direction: start.direction(),
            start,
            start_raw: Some(start_raw),
            line_ending,
            headers: Arc::new(headers),
            head_end,
            body,
            bodiless,
            correlation_id: None,
            annotations: Annotations::default(),
        }
    }

    /// Write the message back to bytes. Unedited lines are reproduced verbatim.
    pub fn serialize(&self) -> Bytes {
        let mut out = Vec::with_capacity(256 + self.body.len());
        match &self.start_raw {
            Some(raw) => encode_latin1(raw, &mut out),
            None => {
                encode_latin1(&self.start.to_string(), &mut out);
                out.extend_from_slice(self.line_ending.as_bytes());
            }
        }
        for header in self.headers.iter() {
            match &header.raw {
                Some(raw) => encode_latin1(raw, &mut out),
                None => {
                    encode_latin1(&header.name, &mut out);
                    out.extend_from_slice(b": ");
                    encode_latin1(&header.value, &mut out);
                    out.extend_from_slice(self.line_ending.as_bytes());
                }
            }
        }
        out.extend_from_slice(self.head_end.as_bytes());
        out.extend_from_slice(&self.body);
        Bytes::from(out)
    }

    // --- Accessors ---

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn start_line(&self) -> &StartLine {
        &self.start
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn target(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { target, .. } => Some(target),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn version(&self) -> &str {
        match &self.start {
            StartLine::Request { version, .. } | StartLine::Response { version, .. } => version,
        }
    }

    /// Scheme of an absolute-form request target (`http`/`https`).
    pub fn scheme(&self) -> Option<&str> {
        let target = self.target()?;
        let (scheme, _) = target.split_once("://")?;
        Some(scheme)
    }

    /// Request path with query and fragment stripped.
    pub fn path(&self) -> Option<&str> {
        let with_query = self.path_with_query()?;
        let end = with_query.find(['?', '#']).unwrap_or(with_query.len());
        Some(&with_query[..end])
    }

    /// Request path including the query string.
    pub fn path_with_query(&self) -> Option<&str> {
        let target = self.target()?;
        match target.split_once("://") {
            Some((_, rest)) => Some(rest.find('/').map(|idx| &rest[idx..]).unwrap_or("/")),
            None => Some(target),
        }
    }

    /// Raw query string (without the leading `?`).
    pub fn query(&self) -> Option<&str> {
        let with_query = self.path_with_query()?;
        let (_, query) = with_query.split_once('?')?;
        Some(query.split('#').next().unwrap_or(query))
    }

    /// `host[:port]` from the `Host` header, falling back to an absolute-form target.
    pub fn authority(&self) -> Option<&str> {
        if let Some(host) = self.header("host") {
            return Some(host);
        }
        let (_, rest) = self.target()?.split_once("://")?;
        let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let authority = &rest[..end];
        Some(authority.rsplit('@').next().unwrap_or(authority))
    }

    /// Host without port, lowercased.
    pub fn host(&self) -> Option<String> {
        let authority = self.authority()?;
        let host = if let Some(rest) = authority.strip_prefix('[') {
            rest.split(']').next().unwrap_or(rest)
        } else {
            authority.split(':').next().unwrap_or(authority)
        };
        Some(host.to_ascii_lowercase())
    }

    /// Explicit port from the authority, if any.
    pub fn port(&self) -> Option<u16> {
        let authority = self.authority()?;
        let after_host = match authority.rfind(']') {
            Some(idx) => &authority[idx + 1..],
            None => authority,
        };
        after_host.rsplit_once(':').and_then(|(_, p)| p.parse().ok())
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// First value of the named header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|h| h.is(name)).map(|h| h.value())
    }

    /// All values of the named header in order.
    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers.iter().filter(move |h| h.is(name)).map(|h| h.value())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h.is(name))
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body with transfer coding removed.
    pub fn decoded_body(&self) -> Result<Cow<'_, [u8]>, MalformedMessage> {
        if self.is_chunked() {
            let (decoded, _) = parse::decode_chunked(&self.body)?;
            Ok(Cow::Owned(decoded))
        } else {
            Ok(Cow::Borrowed(&self.body))
        }
    }

    /// True if the final transfer coding is `chunked`.
    pub fn is_chunked(&self) -> bool {
        parse::is_chunked(&self.headers)
    }

    pub fn is_bodiless(&self) -> bool {
        self.bodiless
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    /// How the body is delimited according to the current headers.
    pub fn framing(&self) -> Result<BodyFraming, MalformedMessage> {
        parse::resolve_framing(&self.start, &self.headers, self.bodiless)
    }

    /// Verify the body agrees with the declared length headers.
    pub fn check_framing(&self) -> Result<(), MalformedMessage> {
        match self.framing()? {
            BodyFraming::Empty if self.body.is_empty() => Ok(()),
            BodyFraming::Empty if self.direction == Direction::Request => {
                Err(MalformedMessage::UndeclaredBody)
            }
            BodyFraming::Empty => Err(MalformedMessage::LengthMismatch {
                declared: 0,
                actual: self.body.len(),
            }),
            BodyFraming::Length(declared) if declared == self.body.len() as u64 => Ok(()),
            BodyFraming::Length(declared) => Err(MalformedMessage::LengthMismatch {
                declared,
                actual: self.body.len(),
            }),
            BodyFraming::Chunked => {
                let (_, consumed) = parse::decode_chunked(&self.body)?;
                if consumed == self.body.len() {
                    Ok(())
                } else {
                    Err(MalformedMessage::Chunked("trailing bytes after last chunk"))
                }
            }
            BodyFraming::UntilClose => Ok(()),
        }
    }

    // --- Edits (each returns a new version) ---

    /// Replace every header with this name by a single new value.
    pub fn with_header(&self, name: &str, value: &str) -> Result<Message, MalformedMessage> {
        let header = Header::new(name, value)?;
        let mut next = self.clone();
        replace_header(Arc::make_mut(&mut next.headers), header);
        Ok(next)
    }

    /// Add another value for a multi-valued header.
    pub fn with_appended_header(&self, name: &str, value: &str) -> Result<Message, MalformedMessage> {
        let header = Header::new(name, value)?;
        let mut next = self.clone();
        Arc::make_mut(&mut next.headers).push(header);
        Ok(next)
    }

    pub fn without_header(&self, name: &str) -> Message {
        if !self.has_header(name) {
            return self.clone();
        }
        let mut next = self.clone();
        Arc::make_mut(&mut next.headers).retain(|h| !h.is(name));
        next
    }

    /// Replace the body and recompute framing headers.
    ///
    /// A chunked `Transfer-Encoding` is removed and `Content-Length` is set to
    /// the new length.
    pub fn with_body(&self, body: impl Into<Bytes>) -> Message {
        let body = body.into();
        let declared = self.has_header("content-length") || self.is_chunked();
        let mut next = self.clone();
        {
            let headers = Arc::make_mut(&mut next.headers);
            if self.is_chunked() {
                headers.retain(|h| !h.is("transfer-encoding"));
            }
            if declared || !body.is_empty() {
                replace_header(
                    headers,
                    Header {
                        name: "Content-Length".to_string(),
                        value: body.len().to_string(),
                        raw: None,
                    },
                );
            }
        }
        next.body = body;
        next
    }

    /// Replace the body without touching framing headers.
    ///
    /// Used when the caller supplies an already framed body (e.g. chunked).
    pub fn with_body_framed(&self, body: impl Into<Bytes>) -> Message {
        let mut next = self.clone();
        next.body = body.into();
        next
    }

    pub fn with_start_line(&self, start: StartLine) -> Result<Message, MalformedMessage> {
        if start.direction() != self.direction {
            return Err(MalformedMessage::InvalidField(format!(
                "{} start line on a {}",
                start.direction(),
                self.direction
            )));
        }
        start.validate()?;
        let mut next = self.clone();
        next.start = start;
        next.start_raw = None;
        Ok(next)
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_highlight(mut self, color: Option<HighlightColor>) -> Self {
        self.annotations.highlight = color;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.annotations.notes.push(note.into());
        self
    }

    pub(crate) fn with_bodiless(mut self, bodiless: bool) -> Self {
        self.bodiless = bodiless;
        self
    }

    /// True if the wire form differs from `other` (annotations ignored).
    pub fn wire_differs(&self, other: &Message) -> bool {
        self.start != other.start
            || self.start_raw != other.start_raw
            || self.headers != other.headers
            || self.body != other.body
    }
}

/// Statuses whose responses never carry a body.
pub(crate) fn status_is_bodiless(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

fn replace_header(headers: &mut Vec<Header>, header: Header) {
    let name = header.name.clone();
    match headers.iter().position(|h| h.is(&name)) {
        Some(idx) => {
            headers[idx] = header;
            let mut i = 0;
            headers.retain(|h| {
                let keep = i == idx || !h.is(&name);
                i += 1;
                keep
            });
        }
        None => headers.push(header),
    }
}

fn encode_latin1(s: &str, out: &mut Vec<u8>) {
    // Chars are limited to U+0000..=U+00FF on construction.
    out.extend(s.chars().map(|c| c as u32 as u8));
}

pub(crate) fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Inverse of [`decode_latin1`]; `None` if a char is above U+00FF.
pub(crate) fn try_encode_latin1(text: &str) -> Option<Vec<u8>> {
    text.chars().map(|c| u8::try_from(c).ok()).collect()
}

pub(crate) fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
        })
}

fn is_field_text(s: &str) -> bool {
    s.chars()
        .all(|c| c <= '\u{ff}' && (c == '\t' || (c >= ' ' && c != '\u{7f}')))
}

fn is_version(s: &str) -> bool {
    s.strip_prefix("HTTP/")
        .map(|v| {
            let mut parts = v.split('.');
            matches!(
                (parts.next(), parts.next(), parts.next()),
                (Some(major), Some(minor), None)
                    if !major.is_empty() && !minor.is_empty()
                        && major.bytes().all(|b| b.is_ascii_digit())
                        && minor.bytes().all(|b| b.is_ascii_digit())
            )
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Message {
        Message::parse(
            b"POST /api/items?id=7 HTTP/1.1\r\nHost: Example.com:8080\r\nX-Trace: a\r\nx-trace: b\r\nContent-Length: 5\r\n\r\nhello",
            Direction::Request,
        )
        .unwrap()
    }

    #[test]
    fn test_accessors() {
        let msg = request();
        assert_eq!(msg.method(), Some("POST"));
        assert_eq!(msg.path(), Some("/api/items"));
        assert_eq!(msg.query(), Some("id=7"));
        assert_eq!(msg.host().as_deref(), Some("example.com"));
        assert_eq!(msg.port(), Some(8080));
        assert_eq!(msg.headers_named("X-TRACE").collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_absolute_form_target() {
        let msg = Message::parse(
            b"GET http://origin.test:81/a/b?q=1 HTTP/1.1\r\n\r\n",
            Direction::Request,
        )
        .unwrap();
        assert_eq!(msg.scheme(), Some("http"));
        assert_eq!(msg.path(), Some("/a/b"));
        assert_eq!(msg.authority(), Some("origin.test:81"));
        assert_eq!(msg.port(), Some(81));
    }

    #[test]
    fn test_with_header_replaces_all_and_keeps_original() {
        let original = request();
        let edited = original.with_header("x-trace", "c").unwrap();

        assert_eq!(edited.headers_named("x-trace").collect::<Vec<_>>(), vec!["c"]);
        // Original version is untouched
        assert_eq!(original.headers_named("x-trace").count(), 2);
        // Position of the first occurrence is kept
        assert_eq!(edited.headers()[1].name(), "x-trace");
    }

    #[test]
    fn test_with_body_recomputes_length() {
        let edited = request().with_body("hello world");
        assert_eq!(edited.header("content-length"), Some("11"));
        assert!(edited.check_framing().is_ok());
    }

    #[test]
    fn test_with_body_replaces_chunked_framing() {
        let msg = Message::parse(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
            Direction::Response,
        )
        .unwrap();
        let edited = msg.with_body("xyz!");
        assert!(!edited.has_header("transfer-encoding"));
        assert_eq!(edited.header("content-length"), Some("4"));
    }

    #[test]
    fn test_with_body_framed_opts_out() {
        let msg = request().with_body_framed("hi");
        assert_eq!(msg.header("content-length"), Some("5"));
        assert!(msg.check_framing().is_err());
    }

    #[test]
    fn test_header_rejects_line_breaks() {
        assert!(request().with_header("X-Bad", "a\r\nInjected: 1").is_err());
        assert!(request().with_header("Bad Name", "v").is_err());
    }

    #[test]
    fn test_edit_serializes_with_crlf() {
        let msg = Message::parse(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n", Direction::Request)
            .unwrap()
            .with_header("Accept", "*/*")
            .unwrap();
        assert_eq!(
            &msg.serialize()[..],
            b"GET / HTTP/1.1\r\nHost: a\r\nAccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn test_start_line_direction_checked() {
        let msg = request();
        assert!(msg.with_start_line(StartLine::response(200, "OK")).is_err());
        let moved = msg.with_start_line(StartLine::request("GET", "/other")).unwrap();
        assert!(moved.serialize().starts_with(b"GET /other HTTP/1.1\r\n"));
    }

    #[test]
    fn test_new_response() {
        let msg = Message::new(StartLine::response(403, "Forbidden"))
            .unwrap()
            .with_body("blocked");
        assert_eq!(
            &msg.serialize()[..],
            b"HTTP/1.1 403 Forbidden\r\nContent-Length: 7\r\n\r\nblocked"
        );
    }

    #[test]
    fn test_wire_differs_ignores_annotations() {
        let msg = request();
        let annotated = msg.clone().with_highlight(Some(HighlightColor::Cyan));
        assert!(!msg.wire_differs(&annotated));
        assert!(msg.wire_differs(&msg.with_header("x", "y").unwrap()));
    }
}

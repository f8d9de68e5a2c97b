//! Parsing of raw HTTP/1.1 bytes.
//!
//! # Responsibilities
//! - Split the head into start line and header lines
//! - Decide body framing (length, chunked, close-delimited)
//! - Reject ambiguous or inconsistent framing before anything is forwarded
//!
//! # Design Decisions
//! - `Content-Length` together with `Transfer-Encoding` is rejected outright
//! - Obsolete line folding is rejected (never re-joined)
//! - Input must be exactly one message: trailing bytes are an error

use bytes::Bytes;

use crate::message::model::{
    decode_latin1, is_token, status_is_bodiless, Header, LineEnding, Message, StartLine,
};
use crate::message::Direction;

/// Unparseable or inconsistent input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedMessage {
    #[error("message is empty")]
    Empty,

    #[error("header section is not terminated")]
    UnterminatedHead,

    #[error("invalid start line: {0:?}")]
    StartLine(String),

    #[error("invalid header line: {0:?}")]
    HeaderLine(String),

    #[error("invalid Content-Length: {0:?}")]
    InvalidLength(String),

    #[error("conflicting Content-Length values")]
    ConflictingLength,

    #[error("Content-Length and Transfer-Encoding both present")]
    AmbiguousFraming,

    #[error("unsupported transfer coding on request: {0:?}")]
    UnsupportedTransferCoding(String),

    #[error("body is {actual} bytes but {declared} were declared")]
    LengthMismatch { declared: u64, actual: usize },

    #[error("request body without declared length")]
    UndeclaredBody,

    #[error("invalid chunked body: {0}")]
    Chunked(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(String),
}

/// Context the bytes alone cannot provide.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// The message answers a HEAD request: declared lengths describe no body.
    pub no_body: bool,
}

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body.
    Empty,
    /// Exactly this many bytes.
    Length(u64),
    /// Chunked transfer coding.
    Chunked,
    /// Body runs until the connection closes (responses only).
    UntilClose,
}

struct Head {
    start: StartLine,
    start_raw: String,
    line_ending: LineEnding,
    headers: Vec<Header>,
    head_end: LineEnding,
    len: usize,
}

/// Parse one complete message.
pub fn parse(bytes: &[u8], direction: Direction, options: ParseOptions) -> Result<Message, MalformedMessage> {
    let head = parse_head(bytes, direction)?;
    let bodiless = options.no_body || response_status_bodiless(&head.start);
    let rest = &bytes[head.len..];

    match resolve_framing(&head.start, &head.headers, bodiless)? {
        BodyFraming::Empty => {
            if !rest.is_empty() {
                return Err(match direction {
                    Direction::Request => MalformedMessage::UndeclaredBody,
                    Direction::Response => MalformedMessage::LengthMismatch {
                        declared: 0,
                        actual: rest.len(),
                    },
                });
            }
        }
        BodyFraming::Length(declared) => {
            if rest.len() as u64 != declared {
                return Err(MalformedMessage::LengthMismatch {
                    declared,
                    actual: rest.len(),
                });
            }
        }
        BodyFraming::Chunked => {
            let (_, consumed) = decode_chunked(rest)?;
            if consumed != rest.len() {
                return Err(MalformedMessage::Chunked("trailing bytes after last chunk"));
            }
        }
        BodyFraming::UntilClose => {}
    }

    Ok(Message::from_parts(
        head.start,
        head.start_raw,
        head.line_ending,
        head.headers,
        head.head_end,
        Bytes::copy_from_slice(rest),
        bodiless,
    ))
}

/// Inspect a buffered head and report `(head_len, framing)`.
///
/// Returns `Ok(None)` while the head is still incomplete.
pub fn inspect_head(
    buf: &[u8],
    direction: Direction,
    options: ParseOptions,
) -> Result<Option<(usize, BodyFraming)>, MalformedMessage> {
    if find_head_end(buf).is_none() {
        return Ok(None);
    }
    let head = parse_head(buf, direction)?;
    let bodiless = options.no_body || response_status_bodiless(&head.start);
    let framing = resolve_framing(&head.start, &head.headers, bodiless)?;
    Ok(Some((head.len, framing)))
}

/// Offset just past the blank line ending the head.
pub fn find_head_end(bytes: &[u8]) -> Option<usize> {
    let mut pos = 0;
    while let Some(offset) = bytes[pos..].iter().position(|&b| b == b'\n') {
        let line_end = pos + offset;
        let line = strip_cr(&bytes[pos..line_end]);
        if line.is_empty() {
            return Some(line_end + 1);
        }
        pos = line_end + 1;
    }
    None
}

/// Parse a start line (without terminator).
pub fn parse_start_line(line: &str, direction: Direction) -> Result<StartLine, MalformedMessage> {
    let invalid = || MalformedMessage::StartLine(line.to_string());
    let start = match direction {
        Direction::Request => {
            let mut parts = line.split(' ');
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(method), Some(target), Some(version), None) => StartLine::Request {
                    method: method.to_string(),
                    target: target.to_string(),
                    version: version.to_string(),
                },
                _ => return Err(invalid()),
            }
        }
        Direction::Response => {
            let mut parts = line.splitn(3, ' ');
            let version = parts.next().ok_or_else(invalid)?;
            let status = parts.next().ok_or_else(invalid)?;
            if status.len() != 3 || !status.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            StartLine::Response {
                version: version.to_string(),
                status: status.parse().map_err(|_| invalid())?,
                reason: parts.next().unwrap_or("").to_string(),
            }
        }
    };
    start.validate().map_err(|_| invalid())?;
    Ok(start)
}

fn parse_head(bytes: &[u8], direction: Direction) -> Result<Head, MalformedMessage> {
    if bytes.is_empty() {
        return Err(MalformedMessage::Empty);
    }
    let len = find_head_end(bytes).ok_or(MalformedMessage::UnterminatedHead)?;

    let mut lines = Lines {
        bytes: &bytes[..len],
        pos: 0,
    };

    let (start_content, start_raw, line_ending) = lines.next().ok_or(MalformedMessage::Empty)?;
    if start_content.is_empty() {
        return Err(MalformedMessage::StartLine(String::new()));
    }
    let start = parse_start_line(&decode_latin1(start_content), direction)?;

    let mut headers = Vec::new();
    let mut head_end = line_ending;
    for (content, raw, ending) in lines {
        if content.is_empty() {
            head_end = ending;
            break;
        }
        headers.push(parse_header_line(content, raw)?);
    }

    Ok(Head {
        start,
        start_raw: decode_latin1(start_raw),
        line_ending,
        headers,
        head_end,
        len,
    })
}

fn parse_header_line(content: &[u8], raw: &[u8]) -> Result<Header, MalformedMessage> {
    let text = decode_latin1(content);
    if text.starts_with([' ', '\t']) {
        return Err(MalformedMessage::HeaderLine(text));
    }
    let (name, value) = text
        .split_once(':')
        .ok_or_else(|| MalformedMessage::HeaderLine(text.clone()))?;
    if !is_token(name) {
        return Err(MalformedMessage::HeaderLine(text.clone()));
    }
    let value = value.trim_matches(|c| c == ' ' || c == '\t');
    if value.chars().any(|c| (c < ' ' && c != '\t') || c == '\u{7f}') {
        return Err(MalformedMessage::HeaderLine(text.clone()));
    }
    Ok(Header::parsed(
        name.to_string(),
        value.to_string(),
        decode_latin1(raw),
    ))
}

/// Line iterator yielding `(content, raw_with_terminator, ending)`.
struct Lines<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Lines<'a> {
    type Item = (&'a [u8], &'a [u8], LineEnding);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.bytes[self.pos..];
        let offset = rest.iter().position(|&b| b == b'\n')?;
        let raw = &rest[..=offset];
        let body = &rest[..offset];
        let (content, ending) = match body.strip_suffix(b"\r") {
            Some(content) => (content, LineEnding::Crlf),
            None => (body, LineEnding::Lf),
        };
        self.pos += offset + 1;
        Some((content, raw, ending))
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn response_status_bodiless(start: &StartLine) -> bool {
    matches!(start, StartLine::Response { status, .. } if status_is_bodiless(*status))
}

/// Determine framing from headers.
pub(crate) fn resolve_framing(
    start: &StartLine,
    headers: &[Header],
    bodiless: bool,
) -> Result<BodyFraming, MalformedMessage> {
    let length = content_length(headers)?;
    let transfer_encoding: Vec<&str> = headers
        .iter()
        .filter(|h| h.is("transfer-encoding"))
        .map(|h| h.value())
        .collect();

    if !transfer_encoding.is_empty() && length.is_some() {
        return Err(MalformedMessage::AmbiguousFraming);
    }
    if bodiless {
        return Ok(BodyFraming::Empty);
    }
    if !transfer_encoding.is_empty() {
        if is_chunked(headers) {
            return Ok(BodyFraming::Chunked);
        }
        return match start {
            StartLine::Request { .. } => Err(MalformedMessage::UnsupportedTransferCoding(
                transfer_encoding.join(", "),
            )),
            StartLine::Response { .. } => Ok(BodyFraming::UntilClose),
        };
    }
    match (length, start) {
        (Some(0), _) => Ok(BodyFraming::Empty),
        (Some(n), _) => Ok(BodyFraming::Length(n)),
        (None, StartLine::Request { .. }) => Ok(BodyFraming::Empty),
        (None, StartLine::Response { .. }) => Ok(BodyFraming::UntilClose),
    }
}

fn content_length(headers: &[Header]) -> Result<Option<u64>, MalformedMessage> {
    let mut found: Option<u64> = None;
    for header in headers.iter().filter(|h| h.is("content-length")) {
        for part in header.value().split(',') {
            let part = part.trim();
            if part.is_empty() || part.len() > 19 || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(MalformedMessage::InvalidLength(header.value().to_string()));
            }
            let value: u64 = part
                .parse()
                .map_err(|_| MalformedMessage::InvalidLength(header.value().to_string()))?;
            match found {
                Some(existing) if existing != value => return Err(MalformedMessage::ConflictingLength),
                _ => found = Some(value),
            }
        }
    }
    Ok(found)
}

pub(crate) fn is_chunked(headers: &[Header]) -> bool {
    headers
        .iter()
        .filter(|h| h.is("transfer-encoding"))
        .last()
        .and_then(|h| h.value().rsplit(',').next())
        .map(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

/// Decode a complete chunked body, returning `(decoded, bytes_consumed)`.
pub fn decode_chunked(raw: &[u8]) -> Result<(Vec<u8>, usize), MalformedMessage> {
    let mut decoded = Vec::with_capacity(raw.len());
    match walk_chunks(raw, Some(&mut decoded))? {
        Some(consumed) => Ok((decoded, consumed)),
        None => Err(MalformedMessage::Chunked("truncated chunked body")),
    }
}

/// Length of the chunked body at the start of `raw`, or `None` if incomplete.
pub fn chunked_len(raw: &[u8]) -> Result<Option<usize>, MalformedMessage> {
    walk_chunks(raw, None)
}

fn walk_chunks(raw: &[u8], mut out: Option<&mut Vec<u8>>) -> Result<Option<usize>, MalformedMessage> {
    let mut pos = 0;
    loop {
        let Some(offset) = raw[pos..].iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let line = strip_cr(&raw[pos..pos + offset]);
        let size_field = line.split(|&b| b == b';').next().unwrap_or(line);
        let size_field = trim_ows(size_field);
        if size_field.is_empty() || size_field.len() > 15 || !size_field.iter().all(u8::is_ascii_hexdigit) {
            return Err(MalformedMessage::Chunked("invalid chunk size"));
        }
        let size = size_field
            .iter()
            .fold(0usize, |acc, &b| acc * 16 + (b as char).to_digit(16).unwrap_or(0) as usize);
        pos += offset + 1;

        if size == 0 {
            // Trailer section ends with an empty line.
            loop {
                let Some(offset) = raw[pos..].iter().position(|&b| b == b'\n') else {
                    return Ok(None);
                };
                let trailer = strip_cr(&raw[pos..pos + offset]);
                pos += offset + 1;
                if trailer.is_empty() {
                    return Ok(Some(pos));
                }
            }
        }

        if raw.len() < pos + size {
            return Ok(None);
        }
        if let Some(out) = out.as_deref_mut() {
            out.extend_from_slice(&raw[pos..pos + size]);
        }
        pos += size;

        match raw.get(pos) {
            None => return Ok(None),
            Some(b'\n') => pos += 1,
            Some(b'\r') => match raw.get(pos + 1) {
                None => return Ok(None),
                Some(b'\n') => pos += 2,
                Some(_) => return Err(MalformedMessage::Chunked("missing chunk terminator")),
            },
            Some(_) => return Err(MalformedMessage::Chunked("missing chunk terminator")),
        }
    }
}

fn trim_ows(mut s: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = s {
        s = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = s {
        s = rest;
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(raw: &[u8], direction: Direction) {
        let msg = Message::parse(raw, direction).unwrap();
        assert_eq!(&msg.serialize()[..], raw, "round trip of {:?}", String::from_utf8_lossy(raw));
    }

    #[test]
    fn test_roundtrip_preserves_exact_bytes() {
        roundtrip(b"GET /a?b=c HTTP/1.1\r\nHost: x\r\nX-Odd:   spaced  \r\nx-odd:dup\r\n\r\n", Direction::Request);
        roundtrip(b"GET / HTTP/1.0\nHost: lf-only\n\n", Direction::Request);
        roundtrip(b"POST /f HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc", Direction::Request);
        roundtrip(b"HTTP/1.1 204 No Content\r\nServer: t\r\n\r\n", Direction::Response);
        roundtrip(b"HTTP/1.1 200\r\n\r\nclose-delimited body", Direction::Response);
        roundtrip(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4;ext=1\r\nwiki\r\n0\r\nX-Trailer: t\r\n\r\n",
            Direction::Response,
        );
        roundtrip(b"GET /caf\xe9 HTTP/1.1\r\nX-Latin: \xff\xfe\r\n\r\n", Direction::Request);
    }

    #[test]
    fn test_chunked_decoding() {
        let msg = Message::parse(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n",
            Direction::Response,
        )
        .unwrap();
        assert_eq!(&msg.decoded_body().unwrap()[..], b"abcde");
    }

    #[test]
    fn test_rejects_conflicting_lengths() {
        let err = Message::parse(
            b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\nabc",
            Direction::Request,
        )
        .unwrap_err();
        assert_eq!(err, MalformedMessage::ConflictingLength);

        // Repeated identical values are not a conflict
        assert!(Message::parse(
            b"POST / HTTP/1.1\r\nContent-Length: 3, 3\r\n\r\nabc",
            Direction::Request
        )
        .is_ok());
    }

    #[test]
    fn test_rejects_length_with_transfer_encoding() {
        let err = Message::parse(
            b"POST / HTTP/1.1\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n",
            Direction::Request,
        )
        .unwrap_err();
        assert_eq!(err, MalformedMessage::AmbiguousFraming);
    }

    #[test]
    fn test_rejects_truncated_and_trailing_bodies() {
        assert!(matches!(
            Message::parse(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc", Direction::Request),
            Err(MalformedMessage::LengthMismatch { declared: 10, actual: 3 })
        ));
        assert_eq!(
            Message::parse(b"GET / HTTP/1.1\r\n\r\nsmuggled", Direction::Request).unwrap_err(),
            MalformedMessage::UndeclaredBody
        );
        assert!(Message::parse(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\nextra",
            Direction::Response
        )
        .is_err());
    }

    #[test]
    fn test_rejects_bad_heads() {
        assert_eq!(Message::parse(b"", Direction::Request).unwrap_err(), MalformedMessage::Empty);
        assert_eq!(
            Message::parse(b"GET / HTTP/1.1\r\nHost: x\r\n", Direction::Request).unwrap_err(),
            MalformedMessage::UnterminatedHead
        );
        assert!(matches!(
            Message::parse(b"GET /\r\n\r\n", Direction::Request),
            Err(MalformedMessage::StartLine(_))
        ));
        assert!(matches!(
            Message::parse(b"GET / HTTP/1.1\r\nX-A: 1\r\n folded\r\n\r\n", Direction::Request),
            Err(MalformedMessage::HeaderLine(_))
        ));
        assert!(matches!(
            Message::parse(b"GET / HTTP/1.1\r\nBad Name: 1\r\n\r\n", Direction::Request),
            Err(MalformedMessage::HeaderLine(_))
        ));
        assert!(matches!(
            Message::parse(b"HTTP/1.1 2000 OK\r\n\r\n", Direction::Response),
            Err(MalformedMessage::StartLine(_))
        ));
    }

    #[test]
    fn test_head_response_has_no_body() {
        let options = ParseOptions { no_body: true };
        let msg = parse(
            b"HTTP/1.1 200 OK\r\nContent-Length: 1024\r\n\r\n",
            Direction::Response,
            options,
        )
        .unwrap();
        assert!(msg.body().is_empty());
        assert!(msg.check_framing().is_ok());
    }

    #[test]
    fn test_inspect_head_reports_framing() {
        let buf = b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nab";
        let (len, framing) = inspect_head(buf, Direction::Request, ParseOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(len, buf.len() - 2);
        assert_eq!(framing, BodyFraming::Length(4));

        assert!(inspect_head(b"GET / HTTP/1.1\r\n", Direction::Request, ParseOptions::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_chunked_len_incremental() {
        assert_eq!(chunked_len(b"5\r\nhel").unwrap(), None);
        assert_eq!(chunked_len(b"5\r\nhello\r\n0\r\n\r\n").unwrap(), Some(15));
        assert!(chunked_len(b"zz\r\n").is_err());
    }
}

//! Reads whole HTTP/1.1 messages off a byte stream.
//!
//! # Responsibilities
//! - Buffer until one complete message is available
//! - Delimit the body the same way the parser will (length, chunked, close)
//! - Enforce head and body size limits
//!
//! # Design Decisions
//! - Bytes beyond the current message stay buffered for the next call
//! - A head the parser rejects is handed up as-is so the pipeline reports it

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::LimitsConfig;
use crate::message::parse::{self, BodyFraming, ParseOptions};
use crate::message::Direction;

const READ_CHUNK: usize = 8 * 1024;

/// Why a message could not be read.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("header section exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("stream closed mid-message")]
    UnexpectedEof,

    #[error("read timed out")]
    Timeout,
}

/// Stateful message reader for one direction of one connection.
#[derive(Debug)]
pub struct MessageReader {
    direction: Direction,
    buf: BytesMut,
    max_head: usize,
    max_body: usize,
    /// Wait for the first byte of a new message.
    idle_timeout: Duration,
    /// Wait for each further read once a message has started.
    read_timeout: Duration,
}

impl MessageReader {
    pub fn new(direction: Direction, limits: &LimitsConfig, idle_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            direction,
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_head: limits.max_head_bytes,
            max_body: limits.max_body_bytes,
            idle_timeout,
            read_timeout,
        }
    }

    /// Take whatever is buffered, e.g. before switching to a raw tunnel.
    pub fn take_buffered(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Read the next complete message.
    ///
    /// `Ok(None)` means the stream ended cleanly between messages.
    pub async fn read_message<R>(&mut self, io: &mut R, options: ParseOptions) -> Result<Option<Bytes>, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        if self.direction == Direction::Request {
            self.skip_leading_blank_lines();
        }

        let (head_len, framing) = loop {
            match parse::inspect_head(&self.buf, self.direction, options) {
                Ok(Some(found)) => break found,
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(direction = %self.direction, error = %e, "Unparseable head passed up");
                    return Ok(Some(self.buf.split().freeze()));
                }
            }
            if self.buf.len() > self.max_head {
                return Err(FrameError::HeadTooLarge(self.max_head));
            }
            let starting = self.buf.is_empty();
            if self.fill(io, starting).await? == 0 {
                if starting {
                    return Ok(None);
                }
                return Err(FrameError::UnexpectedEof);
            }
            if self.direction == Direction::Request && starting {
                self.skip_leading_blank_lines();
            }
        };

        let total = match framing {
            BodyFraming::Empty => head_len,
            BodyFraming::Length(len) => {
                let len = usize::try_from(len)
                    .ok()
                    .filter(|len| *len <= self.max_body)
                    .ok_or(FrameError::BodyTooLarge(self.max_body))?;
                while self.buf.len() < head_len + len {
                    if self.fill(io, false).await? == 0 {
                        return Err(FrameError::UnexpectedEof);
                    }
                }
                head_len + len
            }
            BodyFraming::Chunked => loop {
                match parse::chunked_len(&self.buf[head_len..]) {
                    Ok(Some(len)) => break head_len + len,
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!(direction = %self.direction, error = %e, "Broken chunked body passed up");
                        return Ok(Some(self.buf.split().freeze()));
                    }
                }
                if self.buf.len() - head_len > self.max_body {
                    return Err(FrameError::BodyTooLarge(self.max_body));
                }
                if self.fill(io, false).await? == 0 {
                    return Err(FrameError::UnexpectedEof);
                }
            },
            BodyFraming::UntilClose => {
                loop {
                    if self.buf.len() - head_len > self.max_body {
                        return Err(FrameError::BodyTooLarge(self.max_body));
                    }
                    if self.fill(io, false).await? == 0 {
                        break;
                    }
                }
                self.buf.len()
            }
        };

        Ok(Some(self.buf.split_to(total).freeze()))
    }

    /// One read into the buffer; returns the byte count (0 at EOF).
    async fn fill<R>(&mut self, io: &mut R, idle: bool) -> Result<usize, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let wait = if idle { self.idle_timeout } else { self.read_timeout };
        self.buf.reserve(READ_CHUNK);
        match tokio::time::timeout(wait, io.read_buf(&mut self.buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(FrameError::Io(e)),
            Err(_) => Err(FrameError::Timeout),
        }
    }

    // Clients may send stray CRLFs between requests.
    fn skip_leading_blank_lines(&mut self) {
        let skip = self.buf.iter().take_while(|b| matches!(b, b'\r' | b'\n')).count();
        if skip > 0 {
            let _ = self.buf.split_to(skip);
        }
    }
}

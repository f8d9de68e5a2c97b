//! HTTP message model.
//!
//! # Data Flow
//! ```text
//! raw bytes from host transport
//!     → parse.rs (head + framing validation)
//!     → Message (structured, raw lines retained)
//!     → edits (with_header / with_body / ...) produce new versions
//!     → serialize() (raw lines reused where untouched)
//! ```
//!
//! # Design Decisions
//! - Head bytes are decoded as ISO-8859-1 so every head is representable
//! - Unedited lines are written back verbatim (byte-identical round trip)
//! - Header storage is shared behind an `Arc` and copied only on edit
//! - Chunked bodies stay framed; `decoded_body()` de-chunks on demand

pub mod model;
pub mod params;
pub mod parse;

pub use model::{Annotations, Direction, Header, HighlightColor, Message, StartLine};
pub use parse::{BodyFraming, MalformedMessage, ParseOptions};

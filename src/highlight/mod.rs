//! Request highlighting.
//!
//! # Responsibilities
//! - Mark static assets (images, scripts, fonts/media) as low interest
//! - Mark the first sighting of each distinct request cyan, repeats gray
//!
//! # Design Decisions
//! - Colours live in message annotations and never reach the wire
//! - The seen set is a sharded set; classification never blocks other connections
//! - Settings are swapped atomically and a change clears the history

pub mod assets;
pub mod duplicates;

pub use duplicates::{duplicate_key, DuplicateHighlighter};

//! Interception pipeline.
//!
//! # Data Flow
//! ```text
//! Request bytes
//!     → parse (malformed → AbortConnection)
//!     → highlight (annotation only)
//!     → correlator on_request
//!     → rule snapshot evaluate
//!         forward → framing check → Forward
//!         drop    → session released → Drop { reply | close }
//!         hold    → dispatcher notify_held → observer decision | default policy
//!
//! Response bytes
//!     → expected_response(connection)  (aborted session → suppressed)
//!     → parse (HEAD aware; malformed → 502)
//!     → rule snapshot evaluate (request attributes from the session)
//!     → same forward/drop/hold handling
//!     → correlator on_response (session complete)
//! ```
//!
//! # Design Decisions
//! - A message's path is checked against an explicit state machine
//! - Malformed bytes are never forwarded
//! - Responses for aborted or dropped sessions never reach rules or observers
//! - Hold and drop policies are swapped atomically on reload

pub mod processor;
pub mod state;

pub use processor::{synthesize_reply, Pipeline, PipelineSettings};
pub use state::{Decision, InvalidTransition, MessageState, StateTracker};

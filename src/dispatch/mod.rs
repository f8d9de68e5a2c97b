//! Event dispatch subsystem.
//!
//! # Data Flow
//! ```text
//! pipeline: rule outcome Hold
//!     → dispatcher.rs notify_held (pending entry + HeldEvent to every observer)
//!     → wait: observer decide() | hold timeout | connection cancel
//!     → HoldOutcome back to pipeline, pending entry removed
//!
//! observer: subscribe()
//!     → replay of every pending hold
//!     → live Held / Resolved events
//! ```
//!
//! # Design Decisions
//! - One oneshot channel per hold; a hold suspends only its own connection task
//! - Pending holds live in a sharded map so decisions never contend globally
//! - Delivery is at-least-once; observers key on `hold_id`
//! - Only the first decision for a hold counts

pub mod dispatcher;

pub use dispatcher::{
    DecisionAck, DispatchEvent, EventDispatcher, HeldEvent, HoldId, HoldOrigin, HoldOutcome, ObserverDecision,
    Subscription,
};

//! In-line HTTP/1.1 interception and rule-based transformation engine.

pub mod admin;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod highlight;
pub mod lifecycle;
pub mod message;
pub mod net;
pub mod observability;
pub mod pipeline;
pub mod rules;
pub mod session;
pub mod transport;

pub use config::schema::InterceptorConfig;
pub use error::InterceptError;
pub use lifecycle::Shutdown;
pub use pipeline::{Decision, Pipeline};
pub use transport::{serve_connection, HostTransport};

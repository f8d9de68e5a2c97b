//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, rules compiled once)
//!     → InterceptorConfig (validated, immutable)
//!     → subsystems take the sections they own
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → rule set replaced, pipeline settings swapped (ArcSwap)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Listener, admin and session sizing apply at startup only

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, DropConfig, DropMode, HighlightConfig, HoldConfig, HoldPolicy, InterceptorConfig, LimitsConfig,
    ListenerConfig, LogFormat, ObservabilityConfig, RuleConfig, SessionConfig, TimeoutConfig,
};

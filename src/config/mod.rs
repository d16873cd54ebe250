//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! optional config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → cli.rs (command-line overrides)
//!     → validation.rs (semantic checks, bind address resolution)
//!     → Config (validated, immutable)
//!     → owned by the supervisor, lent by reference to every worker
//! ```
//!
//! # Design Decisions
//! - Config is immutable once resolved; there is no reload path
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod cli;
pub mod loader;
pub mod schema;
pub mod validation;

pub use cli::{Args, ControlSignal};
pub use loader::ConfigError;
pub use schema::{Config, ListenerConfig, LogFormat, ServerConfig};
pub use validation::{resolve_config, ValidationError};

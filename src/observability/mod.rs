//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Supervisor, workers, relay and acceptors produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stderr or a log file (detached daemons have no terminal)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON optional) for machine parsing
//! - Worker index and connection id flow through log fields
//! - Metrics are cheap (atomic increments) and no-ops when disabled

pub mod logging;
pub mod metrics;

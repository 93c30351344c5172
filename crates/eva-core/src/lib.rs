//! Core types shared across the EVA dispatch crates.
//!
//! # Main types
//!
//! - [`EvaError`] — Unified error enum for the registry, queue and orchestrator.
//! - [`EvaResult`] — Convenience alias for `Result<T, EvaError>`.
//! - [`Clock`] — Source of "now" for scheduling decisions, swappable in tests.

/// Time sources.
pub mod clock;
/// Error definitions.
pub mod error;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{EvaError, EvaResult};

//! studyq-core: shared infrastructure for the study staging pipeline
//!
//! Logging setup, shutdown signalling, the periodic scheduler loop used by
//! the background tasks, and the bounded retry policy.

pub mod logging;
pub mod retry;
pub mod schedule;
pub mod shutdown;

// Re-exports for convenience
pub use logging::init_logging;
pub use retry::{RetryPolicy, is_transient};
pub use schedule::{TickOutcome, run_periodic};
pub use shutdown::{Shutdown, install_signal_handlers};

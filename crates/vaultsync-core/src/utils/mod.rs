//! Utility functions for string matching, host comparison and time.

pub mod clock;
pub mod format;

// Re-export commonly used functions at module level
pub use clock::{Clock, SystemClock};
pub use format::{contains_ignore_case, host_of, host_matches, truncate};

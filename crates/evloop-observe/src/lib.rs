//! Logging bootstrap for binaries and tests built on the event loops.

mod logger;
pub use logger::*;

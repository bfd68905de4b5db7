//! Value types shared by every event loop: monotonic deadlines, signed time amounts
//! and the identifiers minted by custom timer backends.

mod domain;
pub use domain::*;

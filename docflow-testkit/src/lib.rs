//! Test fakes for docflow collaborators.
//!
//! Everything here is in-memory and deterministic apart from the delays a
//! test asks for. The fakes share a [`Timeline`] so tests can assert ordering
//! and per-subject exclusivity across parser and storage calls.

mod mock;
mod source;
mod wait;

pub use mock::*;
pub use source::*;
pub use wait::*;

//! Test utilities for the signaling core
//!
//! Recording sinks, a settable wall clock and a harness that wires an
//! orchestrator over in-memory stores. Used by unit tests and by the
//! integration suites under `tests/`.

pub mod fixtures;
pub mod harness;

pub use fixtures::*;
pub use harness::*;

//! opensentinel-daemon library surface.
//!
//! The binary in `main.rs` is a thin shell around [`Stack`]; the pieces are
//! exposed as a library so integration tests can drive the full pipeline.

pub mod limits;
pub mod logging;
pub mod stack;

pub use stack::Stack;

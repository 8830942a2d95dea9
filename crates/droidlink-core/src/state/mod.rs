//! Connection state machine and error classification.

pub mod classify;
pub mod machine;

pub use classify::{Classification, classify};
pub use machine::{ConnectionContext, ConnectionState};

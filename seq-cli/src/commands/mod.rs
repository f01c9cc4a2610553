//! CLI command implementations.

pub mod cursor;
pub mod join;
pub mod send;
pub mod sync;
pub mod watch;

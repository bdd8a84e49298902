//! Child process management
//!
//! Spawns command lines through the system shell interpreter with captured
//! pipes, and drains their output on a background task so callers never
//! perform a blocking read themselves.

mod reader;
mod run;

pub use reader::*;
pub use run::*;

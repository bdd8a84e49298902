//! Shell session management module
//!
//! A [`Shell`] runs one command at a time and keeps its history; the
//! [`Terminal`] registry tracks shells by unique name.

mod history;
mod registry;
mod session;

pub use history::*;
pub use registry::*;
pub use session::*;

/// Text view of a tool-like component's state
pub trait Describe {
    /// Render the current state for display
    fn describe(&self) -> String;
}

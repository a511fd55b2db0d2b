//! termwatch-tmux: terminal backend IO boundary.
//! Subprocess execution and viewport capture. No watcher logic.

pub mod capture;
pub mod error;
pub mod executor;

pub use capture::capture_pane;
pub use error::TmuxError;
pub use executor::{TmuxCommandRunner, TmuxExecutor, TmuxSocket};

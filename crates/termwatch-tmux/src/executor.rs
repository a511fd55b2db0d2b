//! TmuxCommandRunner trait and TmuxExecutor (sync subprocess wrapper).

use crate::error::TmuxError;

/// Trait for executing tmux commands. Enables mock injection for testing.
pub trait TmuxCommandRunner: Send + Sync {
    fn run(&self, args: &[&str]) -> Result<String, TmuxError>;
}

impl<T: TmuxCommandRunner + ?Sized> TmuxCommandRunner for &T {
    fn run(&self, args: &[&str]) -> Result<String, TmuxError> {
        (**self).run(args)
    }
}

impl<T: TmuxCommandRunner + ?Sized> TmuxCommandRunner for std::sync::Arc<T> {
    fn run(&self, args: &[&str]) -> Result<String, TmuxError> {
        (**self).run(args)
    }
}

/// Which tmux server to talk to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TmuxSocket {
    #[default]
    Default,
    /// `-S <path>`
    Path(String),
    /// `-L <name>`
    Name(String),
}

/// Real tmux executor using `std::process::Command`.
#[derive(Debug, Clone)]
pub struct TmuxExecutor {
    tmux_bin: String,
    socket: TmuxSocket,
}

impl TmuxExecutor {
    pub fn new(tmux_bin: impl Into<String>) -> Self {
        Self {
            tmux_bin: tmux_bin.into(),
            socket: TmuxSocket::Default,
        }
    }

    #[must_use]
    pub fn with_socket(mut self, socket: TmuxSocket) -> Self {
        self.socket = socket;
        self
    }

    pub fn socket(&self) -> &TmuxSocket {
        &self.socket
    }
}

impl Default for TmuxExecutor {
    fn default() -> Self {
        Self::new("tmux")
    }
}

impl TmuxCommandRunner for TmuxExecutor {
    fn run(&self, args: &[&str]) -> Result<String, TmuxError> {
        let mut cmd = std::process::Command::new(&self.tmux_bin);
        match &self.socket {
            TmuxSocket::Default => {}
            TmuxSocket::Path(path) => {
                cmd.args(["-S", path]);
            }
            TmuxSocket::Name(name) => {
                cmd.args(["-L", name]);
            }
        }
        cmd.args(args);
        let output = cmd.output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TmuxError::CommandFailed(format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

//! CLI definition using clap derive.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "termwatch",
    about = "Watch agent terminal sessions and raise events on output patterns"
)]
pub struct Cli {
    /// Registry file with watchers, sessions and agents
    /// (default: $XDG_CONFIG_HOME/termwatch/registry.json)
    #[arg(long, short = 'r', global = true, env = "TERMWATCH_REGISTRY")]
    pub registry: Option<PathBuf>,

    /// tmux server socket path (else TERMWATCH_TMUX_SOCKET_NAME selects by name)
    #[arg(long, global = true, env = "TERMWATCH_TMUX_SOCKET_PATH")]
    pub tmux_socket: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run every enabled watcher until interrupted (SIGHUP reloads)
    Daemon,
    /// Check one watcher now without recording state or publishing (JSON)
    Check(CheckOpts),
    /// List configured watchers
    List,
}

#[derive(clap::Args)]
pub struct CheckOpts {
    /// Watcher id
    #[arg(long, short = 'w')]
    pub watcher: String,
}

/// Default registry location under the user's config directory.
pub fn default_registry_path() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(dir).join("termwatch/registry.json");
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config/termwatch/registry.json")
}

//! termwatch: polls agent terminal sessions and raises events when a
//! watcher's output condition appears.

use std::sync::Arc;

use clap::Parser;

mod bus;
mod cli;
mod cmd_check;
mod cmd_list;
mod daemon;
mod directory;
mod emitter;
mod engine;
mod registry;
mod scheduler;
mod scope;
#[cfg(test)]
mod testing;
mod viewport_cache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    let filter = std::env::var("TERMWATCH_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    // Events go to stdout; logs stay on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let registry_path = args.registry.unwrap_or_else(cli::default_registry_path);
    let registry = Arc::new(
        registry::JsonRegistry::open(&registry_path).map_err(|e| {
            anyhow::anyhow!("cannot open registry {}: {e}", registry_path.display())
        })?,
    );

    match args.command {
        cli::Command::Daemon => {
            tracing::info!("termwatch daemon starting");
            daemon::run_daemon(registry, &registry_path, args.tmux_socket).await?;
        }
        cli::Command::Check(opts) => {
            let runner = Arc::new(daemon::build_executor(args.tmux_socket));
            cmd_check::cmd_check(registry, runner, &opts.watcher).await?;
        }
        cli::Command::List => {
            cmd_list::cmd_list(&registry);
        }
    }

    Ok(())
}

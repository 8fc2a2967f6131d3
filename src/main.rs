mod cli;
mod conf;
mod config;
mod display;
mod error;
mod forward;
mod group;
mod health;
mod logging;
mod process;
mod signal;
mod tunnel;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;

use cli::Cli;
use config::Settings;
use group::TunnelGroup;
use process::SshTransport;
use signal::ShutdownSignal;
use tunnel::Transport;

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }
    logging::init(cli.silent);

    std::process::exit(exit_status(run(cli)));
}

/// Failures are logged with their full context and exit with 1.
fn exit_status(result: Result<i32>) -> i32 {
    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    }
}

/// Load every config file, then keep the tunnels up until a signal arrives or the
/// `--exec` command finishes. Returns the process exit code.
fn run(cli: Cli) -> Result<i32> {
    let mut settings = Settings::load();
    if let Some(secs) = cli.connect_timeout {
        settings.connect_timeout_secs = secs;
    }

    let exec_grace = settings.stop_grace();
    let transport: Arc<dyn Transport> = Arc::new(SshTransport::new(settings));

    let mut group = TunnelGroup::load(&cli.conf_files, Some(&cli.addr), transport)
        .context("failed to load tunnel config")?
        .with_exec_grace(exec_grace);

    if cli.dry_run {
        display::print_plan(&group);
        return Ok(0);
    }

    let signal = ShutdownSignal::install().context("failed to install signal handlers")?;
    group
        .run(cli.exec.as_deref(), &signal)
        .context("tunnels stopped with an error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_exits_with_one() {
        let cli = Cli::try_parse_from(["sshfwd", "/nonexistent/sshfwd/tunnels.yml"]).unwrap();
        let result = run(cli);
        let message = format!("{:#}", result.as_ref().err().unwrap());
        assert!(message.starts_with("failed to load tunnel config"), "{message}");
        assert_eq!(exit_status(result), 1);
    }

    #[test]
    fn malformed_config_exits_with_one() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.yml");
        std::fs::write(&path, "host: h\nlocals: [\"1:2:3\"]\n").unwrap();
        let cli = Cli::try_parse_from(["sshfwd", "--dry-run", path.to_str().unwrap()]).unwrap();
        assert_eq!(exit_status(run(cli)), 1);
    }

    #[test]
    fn command_code_passes_through() {
        assert_eq!(exit_status(Ok(0)), 0);
        assert_eq!(exit_status(Ok(7)), 7);
    }
}

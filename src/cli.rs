use clap::Parser;

use crate::tunnel::LOOPBACK;

#[derive(Parser, Debug)]
#[command(
    name = "sshfwd",
    about = "Keep SSH local port forwards alive from YAML config files",
    version
)]
pub struct Cli {
    /// Default local bind address for forwards with an empty local host
    #[arg(long, value_name = "HOST", default_value = LOOPBACK)]
    pub addr: String,

    /// Run this command through the shell once all tunnels are up, then exit with its code
    #[arg(long, value_name = "CMD")]
    pub exec: Option<String>,

    /// Only log warnings and errors
    #[arg(long)]
    pub silent: bool,

    /// Seconds to wait for each tunnel to come up (overrides ~/.sshfwd/config.toml)
    #[arg(long, value_name = "SECS")]
    pub connect_timeout: Option<u64>,

    /// Print the resolved tunnels without starting them
    #[arg(long)]
    pub dry_run: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Tunnel config files (YAML)
    #[arg(value_name = "CONF_FILE", required = true)]
    pub conf_files: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["sshfwd", "tunnels.yml"]).unwrap();
        assert_eq!(cli.addr, "127.0.0.1");
        assert_eq!(cli.exec, None);
        assert!(!cli.silent);
        assert_eq!(cli.conf_files, vec!["tunnels.yml"]);
    }

    #[test]
    fn all_flags() {
        let cli = Cli::try_parse_from([
            "sshfwd",
            "--addr",
            "0.0.0.0",
            "--exec",
            "psql -h 127.0.0.1",
            "--silent",
            "--connect-timeout",
            "3",
            "a.yml",
            "b.yml",
        ])
        .unwrap();
        assert_eq!(cli.addr, "0.0.0.0");
        assert_eq!(cli.exec.as_deref(), Some("psql -h 127.0.0.1"));
        assert!(cli.silent);
        assert_eq!(cli.connect_timeout, Some(3));
        assert_eq!(cli.conf_files, vec!["a.yml", "b.yml"]);
    }

    #[test]
    fn conf_file_is_required() {
        assert!(Cli::try_parse_from(["sshfwd"]).is_err());
    }
}

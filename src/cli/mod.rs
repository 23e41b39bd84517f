use clap::Parser;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "termhub", version, about = "Multi-tab PTY session backend for browser workspaces")]
pub struct Cli {
    /// Config file path (default: ~/.config/termhub/termhub.toml)
    #[arg(long)]
    pub config: Option<String>,

    /// Bind address
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port number
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Base URL of the auth service
    #[arg(long)]
    pub auth_url: Option<String>,

    /// Shell spawned for each tab
    #[arg(long)]
    pub shell: Option<String>,

    /// Directory for persisted tab state
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Seconds PTY processes survive after the connection drops
    #[arg(long)]
    pub grace_period: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Cli {
    /// Default log directive implied by the verbosity flags.
    pub fn log_directive(&self) -> &'static str {
        if self.verbose {
            "termhub=debug"
        } else if self.quiet {
            "termhub=warn"
        } else {
            "termhub=info"
        }
    }

    /// Layer command-line flags over the loaded config.
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(url) = &self.auth_url {
            config.auth.base_url = url.clone();
        }
        if let Some(shell) = &self.shell {
            config.terminal.shell = shell.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.server.data_dir = Some(dir.clone());
        }
        if let Some(grace) = self.grace_period {
            config.session.grace_period_secs = grace;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "termhub",
            "--port",
            "9999",
            "--shell",
            "/bin/zsh",
            "--grace-period",
            "5",
        ]);
        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.terminal.shell, "/bin/zsh");
        assert_eq!(config.session.grace_period_secs, 5);
        // Untouched fields keep config values
        assert_eq!(config.server.host, "127.0.0.1");
    }
}

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(name = "catflap", version, about)]
pub struct ProgramConfig {
    /// Path to the YAML configuration file
    #[clap(long, env = "CATFLAP_CONFIG", default_value = "/etc/catflap/config.yaml")]
    pub config_file: PathBuf,

    /// Print firewall commands instead of running them
    #[clap(long, env = "CATFLAP_NOOP")]
    pub noop: bool,

    /// Print firewall commands before running them
    #[clap(long, env = "CATFLAP_VERBOSE")]
    pub verbose: bool,

    /// PID file of the running server
    #[clap(long, env = "CATFLAP_PID_FILE", default_value = "/var/run/catflap.pid")]
    pub pid_file: PathBuf,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the knock server in the foreground
    Start,

    /// Stop the running server
    Stop,

    /// Report whether the server is running
    Status,

    /// Stop the running server, then start a new one in the foreground
    Restart,

    /// Make the running server re-read its pass phrase file
    Reload,

    /// Create the firewall chains and hook them up
    Install,

    /// Remove the firewall chains
    Uninstall,

    /// Revoke every granted address
    Purge,

    /// Show the rules of the allow chain
    List,

    /// Allow an address through the firewall
    Grant { address: String },

    /// Remove an address from the firewall
    Revoke { address: String },

    /// Print whether an address is allowed
    Check { address: String },

    /// Grant every address listed in a file, one per line
    Bulkload { file: PathBuf },
}

impl ProgramConfig {
    pub fn parse() -> Self {
        Parser::parse()
    }
}

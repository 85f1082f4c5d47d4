mod commands;
mod executor;
mod firewall_driver;
mod knock_protocol;
mod knock_server;
mod passphrase_registry;
mod pid_file;
mod program_config;
mod protocol;
mod rule_batch;
mod settings;

use crate::program_config::ProgramConfig;
use env_logger::Env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse options
    let config = ProgramConfig::parse();

    // Set up logging
    env_logger::Builder::from_env(Env::default().default_filter_or(if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }))
    .format_timestamp(None)
    .format_module_path(false)
    .init();

    commands::run(config).await
}

use crate::executor::Executor;
use crate::firewall_driver::{self, FirewallDriver};
use crate::knock_protocol::KnockHandler;
use crate::knock_server::KnockServer;
use crate::passphrase_registry::SharedRegistry;
use crate::pid_file::{self, PidFile};
use crate::program_config::{Command, ProgramConfig};
use crate::rule_batch::validate_address;
use crate::settings::Settings;
use anyhow::{bail, Context};
use nix::sys::signal::Signal;
use std::path::Path;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

/// 10 seconds, in 100ms polls
const STOP_ATTEMPTS: u32 = 100;

pub async fn run(config: ProgramConfig) -> anyhow::Result<()> {
    match &config.command {
        Command::Start => serve(&config).await,
        Command::Stop => stop(&config.pid_file).await,
        Command::Status => {
            match pid_file::running_pid(&config.pid_file) {
                Some(pid) => println!("catflap is running (PID {})", pid),
                None => println!("No process"),
            }
            Ok(())
        }
        Command::Restart => {
            stop(&config.pid_file).await?;
            serve(&config).await
        }
        Command::Reload => {
            let pid = pid_file::signal(&config.pid_file, Signal::SIGHUP)?;
            println!("Asked PID {} to reload its pass phrases", pid);
            Ok(())
        }
        command => {
            let settings = Settings::load(&config.config_file)?;
            let driver = build_driver(&settings, &config)?;
            firewall_command(driver.as_ref(), command).await
        }
    }
}

fn build_driver(
    settings: &Settings,
    config: &ProgramConfig,
) -> anyhow::Result<Box<dyn FirewallDriver>> {
    let executor = Executor::new(
        settings.firewall.iptables_path.clone(),
        settings.executor_timeout(),
        config.noop,
        config.verbose,
    );
    Ok(firewall_driver::create(
        settings.firewall.plugin,
        settings.driver_config()?,
        executor,
    ))
}

async fn serve(config: &ProgramConfig) -> anyhow::Result<()> {
    let settings = Settings::load(&config.config_file)?;
    let registry = Arc::new(SharedRegistry::load(settings.server.passfile.clone())?);
    let driver: Arc<dyn FirewallDriver> = Arc::from(build_driver(&settings, config)?);
    let handler = KnockHandler::new(registry.clone(), driver, settings.knock_settings());

    let server = KnockServer::new(&settings.server, Arc::new(handler))
        .await
        .context("Failed to start knock server")?;
    let _pid_file = PidFile::create(&config.pid_file)?;

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to handle SIGINT")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to handle SIGTERM")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to handle SIGHUP")?;

    let reloader = tokio::spawn(async move {
        while sighup.recv().await.is_some() {
            if let Err(e) = registry.reload() {
                log::error!("{:#}", e);
            }
        }
    });

    log::info!("Server started!");

    let result = server
        .run(async move {
            tokio::select! {
                _ = sigint.recv() => (),
                _ = sigterm.recv() => (),
            }
        })
        .await;
    reloader.abort();
    result?;

    log::info!("Server stopped.");

    Ok(())
}

async fn stop(pid_path: &Path) -> anyhow::Result<()> {
    if pid_file::running_pid(pid_path).is_none() {
        println!("No process");
        return Ok(());
    }

    let pid = pid_file::signal(pid_path, Signal::SIGTERM)?;
    if !pid_file::wait_for_exit(pid, STOP_ATTEMPTS).await {
        bail!("PID {} did not exit after SIGTERM", pid);
    }
    println!("Stopped PID {}", pid);
    Ok(())
}

async fn firewall_command(driver: &dyn FirewallDriver, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Install => driver
            .install_rules()
            .await
            .context("Failed to install firewall rules")?,
        Command::Uninstall => driver
            .uninstall_rules()
            .await
            .context("Failed to uninstall firewall rules")?,
        Command::Purge => driver
            .purge_rules()
            .await
            .context("Failed to purge granted addresses")?,
        Command::List => {
            let rules = driver.list_rules().await.context("Failed to list rules")?;
            print!("{}", rules);
        }
        Command::Grant { address } => {
            let granted = driver
                .grant(address)
                .await
                .with_context(|| format!("Failed to grant {}", address))?;
            if granted {
                println!("Granted {}", address);
            } else {
                println!("{} is already granted", address);
            }
        }
        Command::Revoke { address } => {
            let revoked = driver
                .revoke(address)
                .await
                .with_context(|| format!("Failed to revoke {}", address))?;
            if revoked {
                println!("Revoked {}", address);
            } else {
                println!("{} is not granted", address);
            }
        }
        Command::Check { address } => {
            let granted = driver
                .check_address(address)
                .await
                .with_context(|| format!("Failed to check {}", address))?;
            println!("{}", granted);
        }
        Command::Bulkload { file } => bulkload(driver, file).await?,
        Command::Start | Command::Stop | Command::Status | Command::Restart | Command::Reload => {
            bail!("{:?} does not operate on the firewall", command)
        }
    }
    Ok(())
}

/// Grants every address in `file`. Nothing is granted unless every entry is valid.
async fn bulkload(driver: &dyn FirewallDriver, file: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Cannot read address file at '{}'", file.display()))?;
    let addresses = parse_address_list(&content)
        .await
        .with_context(|| format!("Invalid address file at '{}'", file.display()))?;

    let mut granted = 0;
    for address in &addresses {
        if driver
            .grant(address)
            .await
            .with_context(|| format!("Failed to grant {}", address))?
        {
            granted += 1;
        }
    }

    println!("Granted {} of {} address(es)", granted, addresses.len());
    Ok(())
}

/// One address per line; blank lines and `#` comments are skipped
async fn parse_address_list(content: &str) -> anyhow::Result<Vec<String>> {
    let mut addresses = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let address = validate_address(line)
            .await
            .with_context(|| format!("Line {}", index + 1))?;
        addresses.push(address.to_string());
    }
    Ok(addresses)
}

//! Subcommand handling for appfence.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::cleanup::cleanup_stale_resources;
use crate::cli::{Cli, Commands, ExecMode};
use crate::config::Config;
use crate::controller::{ControllerBuilder, EnforcementReport, PerAppNetworkController};
use crate::platform::{NetworkTypeProvider, PackageRegistry, PackagesListRegistry, SysfsNetworkType};
use crate::privileged::{
    DirectExecutor, PrivilegedExecutor, RecordingExecutor, SuExecutor, UnprivilegedExecutor,
};

/// Pick the executor the command line asked for.
pub fn executor_for(cli: &Cli, config: &Config) -> Arc<dyn PrivilegedExecutor> {
    if cli.dry_run {
        return Arc::new(RecordingExecutor::new(true));
    }
    match cli.exec {
        ExecMode::Su => Arc::new(SuExecutor::new(config.privileged.su_binary())),
        ExecMode::Direct => Arc::new(DirectExecutor),
        ExecMode::None => Arc::new(UnprivilegedExecutor),
    }
}

/// Run the parsed command.
pub async fn handle_command(cli: Cli, config: Config) -> Result<()> {
    let executor = executor_for(&cli, &config);
    match cli.command {
        Commands::Run {
            block,
            allow_wifi,
            allow_cellular,
        } => run(config, executor, &block, !allow_wifi, !allow_cellular).await,
        Commands::Status { packages } => {
            status(&config, executor.as_ref(), &packages);
            Ok(())
        }
        Commands::Cleanup => {
            let stale = cleanup_stale_resources(&config, executor.as_ref());
            if stale.is_empty() {
                println!("Nothing to clean up");
            } else {
                if stale.chain {
                    println!("Removed chain {}", config.privileged.chain_name());
                }
                for name in &stale.interfaces {
                    println!("Removed interface {name}");
                }
            }
            Ok(())
        }
    }
}

async fn run(
    config: Config,
    executor: Arc<dyn PrivilegedExecutor>,
    packages: &[String],
    block_wifi: bool,
    block_cellular: bool,
) -> Result<()> {
    cleanup_stale_resources(&config, executor.as_ref());

    let controller = ControllerBuilder::new(config)
        .executor(executor)
        .build()
        .context("Failed to build controller")?;
    if !controller.is_privileged() {
        println!("No superuser shell: enforcing with the app-level proxy only");
    }

    let tasks: Vec<_> = packages
        .iter()
        .map(|p| controller.block_app_internet(p, block_wifi, block_cellular))
        .collect();
    for task in tasks {
        let report = task.wait().await.context("Enforcement task failed")?;
        print_report(&controller, &report).await;
    }

    let mut events = controller.subscribe_bypass_events();
    println!("Enforcing; press Ctrl-C to restore access");
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to wait for Ctrl-C")?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => println!(
                    "bypass attempt ({}): {} [{}]",
                    event.watcher,
                    event.detail,
                    event.packages.join(", ")
                ),
                Err(RecvError::Lagged(n)) => warn!("Missed {} bypass events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("Restoring access");
    for package in controller.get_all_blocked_apps() {
        if let Err(e) = controller.allow_app_internet(&package).wait().await {
            warn!("Allowing {} failed: {}", package, e);
        }
    }
    controller.cleanup().await;
    Ok(())
}

async fn print_report(controller: &PerAppNetworkController, report: &EnforcementReport) {
    match controller.proxy_port(&report.package).await {
        Some(port) => println!("{}: proxy on 127.0.0.1:{}", report.package, port),
        None => println!("{}: no proxy", report.package),
    }
    for tier in &report.tiers {
        println!("  {:<12} {}", tier.tier, tier.outcome);
    }
}

fn status(config: &Config, executor: &dyn PrivilegedExecutor, packages: &[String]) {
    let network = SysfsNetworkType::new(
        config.platform.sys_class_net(),
        config.platform.wifi_prefixes(),
        config.platform.cellular_prefixes(),
    );
    let registry = PackagesListRegistry::new(config.platform.packages_list());

    println!("superuser shell: {}", if executor.is_available() { "yes" } else { "no" });
    println!("network:         {:?}", network.current());
    for package in packages {
        match registry.uid_for_package(package) {
            Ok(uid) => println!("{package}: uid {uid}"),
            Err(e) => println!("{package}: {e}"),
        }
    }
}

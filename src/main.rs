// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Process entry point: loads system and monitor config, spawns one
//! [`Recorder`](sentryshot_core::recorder::Recorder) per configured
//! monitor plus the [`DiskManager`](sentryshot_core::diskmanager::DiskManager),
//! and shuts the whole tree down cleanly on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use sentryshot_core::config::{self, Config};
use sentryshot_core::diskmanager::DiskManager;
use sentryshot_core::recorder::{NullServices, Recorder, RecorderConfig, TokioProcessRunner};

/// streaming core for a network video recorder
#[derive(Parser, Debug)]
#[command(name = "sentryshot-core")]
#[command(version, about, long_about = None)]
struct CliArgs {
    /// Path to the system config TOML file.
    #[arg(short = 'c', long, value_name = "FILE", default_value = "./configs/sentryshot.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(args).await {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(args: CliArgs) -> Result<(), sentryshot_core::error::Error> {
    let config = Config::from_file(&args.config)?;
    log::info!("loaded config from {}", args.config.display());

    let monitor_raws = config::load_monitor_configs(&config.monitors_dir())?;
    let mut monitor_configs = Vec::with_capacity(monitor_raws.len());
    for raw in monitor_raws {
        monitor_configs.push(RecorderConfig::from_raw(raw)?);
    }
    log::info!("loaded {} monitor configs", monitor_configs.len());

    tokio::fs::create_dir_all(config.recordings_root())
        .await
        .map_err(|e| {
            sentryshot_core::error::Error::from(sentryshot_core::error::ErrorInt::IoFatal {
                source_tag: sentryshot_core::error::Source::Disk,
                monitor_id: String::new(),
                description: format!("creating {}", config.recordings_root().display()),
                cause: Some(e),
            })
        })?;

    let cancel = CancellationToken::new();
    let services: Arc<dyn sentryshot_core::recorder::Services> = Arc::new(NullServices);
    let process_runner: Arc<dyn sentryshot_core::recorder::ExternalProcessRunner> =
        Arc::new(TokioProcessRunner);

    let mut tasks = tokio::task::JoinSet::new();
    for monitor_config in monitor_configs {
        let monitor_id = monitor_config.id.clone();
        let recorder = Recorder::new(
            monitor_config,
            services.clone(),
            process_runner.clone(),
            config.recordings_root(),
        );
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = recorder.run(cancel).await {
                log::error!("[{monitor_id}] recorder task exited: {e}");
            }
        });
    }

    let disk_manager = DiskManager::new(config.recordings_root(), config.max_disk_usage_bytes());
    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = disk_manager.run(cancel).await {
                log::error!("disk manager task exited: {e}");
            }
        });
    }

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received, stopping");
    cancel.cancel();

    while tasks.join_next().await.is_some() {}
    log::info!("shutdown complete");
    Ok(())
}

/// Waits for either Ctrl+C or, on Unix, SIGTERM.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

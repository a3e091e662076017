//! Process supervisor: launches each configured app with its own
//! arguments, working directory and environment, watches it, and
//! restarts it with exponential backoff when it crashes.

#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_debug_implementations,
    nonstandard_style,
    missing_docs,
    unreachable_pub,
    missing_copy_implementations,
    unused_qualifications,
    clippy::unwrap_in_result,
    clippy::unwrap_used
)]

use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::WrapErr;
use relaunch::config::Config;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};

#[derive(Debug, Parser)]
#[clap(about, long_about = None)]
struct Cli {
    /// Check the configuration file for errors, but do not start any
    /// apps.
    #[clap(long)]
    check: bool,

    /// Environment profile to merge onto each app's base environment
    /// (for example `production`).
    #[clap(long = "env", env = "RELAUNCH_ENV")]
    profile: Option<String>,

    config_file: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    // Crash the process on a panic anywhere (including in a background
    // Tokio task, since we want panic to mean "something is very wrong;
    // stop everything").
    std::panic::set_hook(Box::new(|info| {
        eprintln!("Process panicked: {info}");
        std::process::abort();
    }));

    // Set the RUST_LOG, if it hasn't been explicitly defined
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info")
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stdout)
        .init();

    // Parse the command line arguments.
    let cli = Cli::parse();

    // Read, parse, and resolve the config file.
    let config_file = tokio::fs::read_to_string(&cli.config_file)
        .await
        .wrap_err_with(|| format!("Unable to read config file {:?}", cli.config_file))?;
    let config: Config = toml::from_str(&config_file).wrap_err("Error parsing config file")?;
    let apps = config
        .resolve(cli.profile.as_deref())
        .wrap_err("Invalid app configuration")?;

    // We're done if this was only a config file check.
    if cli.check {
        return Ok(());
    }

    tracing::info!(profile = ?cli.profile, apps = apps.len(), "Configuration loaded");

    // Create the external shutdown signal (used to stop every app on
    // UNIX signals).
    let (shutdown_sender, shutdown_receiver) = mpsc::unbounded_channel();

    let sigint_shutdown_sender = shutdown_sender.clone();
    tokio::spawn(async move {
        signal(SignalKind::interrupt())
            .expect("Failed to register SIGINT handler")
            .recv()
            .await;
        let _ = sigint_shutdown_sender.send(());
    });

    tokio::spawn(async move {
        signal(SignalKind::terminate())
            .expect("Failed to register SIGTERM handler")
            .recv()
            .await;
        let _ = shutdown_sender.send(());
    });

    relaunch::run(apps, shutdown_receiver).await?;

    Ok(())
}

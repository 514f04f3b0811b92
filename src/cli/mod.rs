//! CLI module graph and command dispatch.

pub mod command;
pub mod config;
pub mod connection;
pub mod optimize;
pub mod output;
pub mod pipeline;
pub mod queue;

use std::path::PathBuf;

use tracing::info;

pub use command::{Cli, ColorChoice, Commands, ConfigCommand};

use crate::config::Config;
use crate::context::Context;
use crate::error::Result;

/// Apply the `--color` choice to every colored write.
pub fn apply_color(choice: &ColorChoice) {
    match choice {
        ColorChoice::Auto => owo_colors::unset_override(),
        ColorChoice::Always => owo_colors::set_override(true),
        ColorChoice::Never => owo_colors::set_override(false),
    }
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .unwrap_or_else(|| PathBuf::from(Config::default_path()))
}

/// Load configuration, install logging and run the selected command.
///
/// Ctrl-C cancels the command's context; long-running commands stop
/// their work and report what finished.
pub async fn run(cli: Cli) -> Result<()> {
    let path = config_path(&cli);
    if let Commands::Config(command) = &cli.command {
        return match command {
            ConfigCommand::Show => config::execute_show(&path),
            ConfigCommand::Validate => config::execute_validate(&path),
        };
    }

    let mut settings = Config::load_or_default(&path)?;
    match cli.verbose {
        0 => {}
        1 => settings.logging.level = "debug".into(),
        _ => settings.logging.level = "trace".into(),
    }
    settings.init_logging();

    let ctx = Context::background();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Optimize(args) => optimize::execute(&ctx, args, settings.optimizer).await,
        Commands::Queue(args) => {
            queue::execute(&ctx, args, settings.queue, settings.event_bus).await
        }
        Commands::Connection(args) => {
            connection::execute(&ctx, args, settings.connection).await
        }
        Commands::Pipeline(args) => {
            pipeline::execute(&ctx, args, settings.queue, settings.event_bus).await
        }
        Commands::Config(_) => Ok(()),
    }
}

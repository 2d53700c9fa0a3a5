//! stow - pack, publish and deploy versioned artifacts

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use stowage_cli::cmd::{self, Session};
use stowage_cli::ui::TerminalPrompt;
use stowage_cli::{Cli, Commands};
use stowage_core::CancelToken;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancelToken::with_prompt(Arc::new(TerminalPrompt));
    let _signals = cancel.install_signal_handler();

    let session = Session::new(cli.json, cli.project.clone(), cancel);
    let code = match run(&session, cli.command).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err:#}");
            cmd::exit_code(&err)
        }
    };
    std::process::exit(code);
}

async fn run(session: &Session, command: Commands) -> Result<()> {
    match command {
        Commands::Pack {
            source,
            kind,
            version,
            compression,
            level,
            output,
            force,
        } => {
            cmd::pack::pack(
                session,
                &source,
                &kind,
                &version,
                compression,
                level,
                output,
                force,
            )
            .await
        }
        Commands::Publish {
            components,
            release,
            name,
            force,
            no_atomic,
        } => {
            cmd::publish::publish(
                session,
                &components,
                release.as_deref(),
                name,
                force,
                no_atomic,
            )
            .await
        }
        Commands::Deploy {
            release,
            component,
            target,
            no_verify,
            checksums,
            no_rollback,
        } => {
            cmd::deploy::deploy(
                session,
                release.as_deref(),
                component.as_deref(),
                target,
                no_verify,
                checksums,
                no_rollback,
            )
            .await
        }
        Commands::Switch { target, release } => cmd::target::switch(session, &target, &release).await,
        Commands::Rollback { target } => cmd::target::rollback(session, &target).await,
        Commands::Versions { target } => cmd::target::versions(session, &target),
        Commands::Status {
            target,
            verify,
            checksums,
        } => cmd::target::status(session, &target, verify, checksums).await,
        Commands::Components { command } => cmd::components::components(session, command),
        Commands::Doctor => cmd::doctor::doctor(session).await,
    }
}

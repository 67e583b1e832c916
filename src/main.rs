use std::sync::Arc;

use anyhow::Context;
use sk_auth::{AppState, AuthEvent, Credentials, EnvSecretProvider, EventKind, TokenStore};
use sk_config::{AppConfig, ConfigManager};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Application error: {:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let manager = ConfigManager::from_project_dirs()?;
    let config = manager.load_or_default().await?;
    init_logging(&config);

    let data_dir = manager.data_dir(&config).to_path_buf();
    info!("Using data directory {}", data_dir.display());

    let store = TokenStore::open(&data_dir, Arc::new(EnvSecretProvider::default()))
        .await
        .context("Failed to open token store")?;
    let credentials = Credentials::new(config.auth, store)?;
    subscribe_logging(&credentials);

    if !credentials.bootstrap().await {
        info!("Not signed in; waiting for commands");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                handle_command(&credentials, line.trim()).await;
            }
        }
    }

    credentials.scheduler().stop();
    Ok(())
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn subscribe_logging(credentials: &Credentials) {
    let events = credentials.events();
    events.on(EventKind::ProviderConnected, |event| {
        if let AuthEvent::ProviderConnected {
            provider_id,
            success,
        } = event
        {
            info!("Provider {} connected: {}", provider_id, success);
        }
    });
    events.on(EventKind::LoggedOut, |_| info!("Signed out"));
}

async fn handle_command(credentials: &Credentials, command: &str) {
    match command {
        "" => {}
        "background" => {
            credentials
                .scheduler()
                .on_app_state_change(AppState::Background)
                .await
        }
        "foreground" => {
            credentials
                .scheduler()
                .on_app_state_change(AppState::Foreground)
                .await
        }
        "status" => print_status(credentials).await,
        "logout" => {
            if !credentials.logout().await {
                warn!("Some credentials could not be removed from disk");
            }
        }
        other => warn!(
            "Unknown command '{}'; expected background, foreground, status or logout",
            other
        ),
    }
}

async fn print_status(credentials: &Credentials) {
    let scheduler = credentials.scheduler();
    let session = credentials.session();

    println!("scheduler: {}", scheduler.state());
    match scheduler.last_refresh() {
        Some(at) => println!("last refresh: {}", at.to_rfc3339()),
        None => println!("last refresh: never"),
    }
    println!(
        "signed in: {}",
        match session.user_id() {
            Some(user) => user,
            None if session.has_refresh_token().await => "yes".to_string(),
            None => "no".to_string(),
        }
    );
    for connection in credentials.providers().connected_providers() {
        println!(
            "provider {}: connected since {}",
            connection.provider_id,
            connection.connected_at.to_rfc3339()
        );
    }
    println!("content tokens cached: {}", credentials.content().cached_count());
}

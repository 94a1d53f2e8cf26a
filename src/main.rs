mod cli;
mod client;
mod config;
mod error;
mod protocol;
mod relay;
mod screen;
mod stream;
mod web;

use anyhow::{anyhow, bail, Context, Result};
use cli::{Cli, Commands};
use config::FramecastConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    if let Commands::GenConfig = cli.command {
        print!("{}", FramecastConfig::default().to_toml()?);
        return Ok(());
    }

    let (config, config_error) = match cli.config_path() {
        Some(path) => FramecastConfig::load_or_default(path),
        None => (FramecastConfig::default(), None),
    };
    init_tracing(&config.logging.level)?;
    if let Some(e) = config_error {
        tracing::warn!("invalid config: {e:#}; using defaults");
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!();
                println!("👋 Shutting down...");
            }
            cancel.cancel();
        }
    });

    match cli.command {
        Commands::Agent { relay, .. } => {
            let url = relay.unwrap_or_else(|| config.relay.url.clone());
            start_agent(&config, url, cancel).await?;
        }
        Commands::Serve {
            addr,
            display,
            user,
            password,
            ..
        } => {
            let mut config = config;
            if let Some(addr) = addr {
                config.http.listen = addr;
            }
            if let Some(display) = display {
                config.http.display = display;
            }
            if let (Some(user), Some(password)) = (user, password) {
                config.http.username = user;
                config.http.password = password;
            }
            start_server(&config, cancel).await?;
        }
        Commands::Relay { addr, .. } => {
            let addr = addr.unwrap_or_else(|| config.relay.listen.clone());
            relay::start_relay(addr, cancel).await?;
        }
        Commands::GenConfig => {}
    }

    Ok(())
}

fn init_tracing(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow!(e))
}

fn capture_hub(config: &FramecastConfig, cancel: &CancellationToken) -> Arc<stream::CaptureHub> {
    stream::CaptureHub::new(
        Arc::new(screen::capture::ScrapSource::new()),
        config.hub_settings(),
        cancel.clone(),
    )
}

async fn start_agent(config: &FramecastConfig, url: String, cancel: CancellationToken) -> Result<()> {
    let hub = capture_hub(config, &cancel);
    let displays = hub.display_count().await;

    println!("📺 framecast agent");
    println!("🖥️  Displays: {}", displays);
    println!("📡 Relay: {}", url);
    println!();

    let agent = client::RelayAgent::new(
        url,
        hub,
        Arc::new(client::WsDialer),
        config.stream_config(true),
        Duration::from_secs(config.relay.reconnect_secs),
    );
    agent.run(cancel).await;
    Ok(())
}

async fn start_server(config: &FramecastConfig, cancel: CancellationToken) -> Result<()> {
    let hub = capture_hub(config, &cancel);
    let displays = hub.display_count().await;
    if config.http.display >= displays {
        bail!(
            "display {} not available ({} connected)",
            config.http.display,
            displays
        );
    }

    let state = Arc::new(web::WebState {
        hub,
        display: config.http.display,
        config: stream::config_handle(config.stream_config(false)),
        auth: config
            .auth()
            .map(|(user, password)| web::Credentials::new(&user, &password)),
    });
    web::serve(&config.http.listen, state, cancel)
        .await
        .context("http server failed")
}

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use talkback_client::cli::Cli;
use talkback_client::config::ClientConfig;
use talkback_client::media::{AudioOutput, MediaGate, NoRoutingHint, RodioOutput, SilentOutput};
use talkback_client::network::{Backend, BackendClient};
use talkback_client::session::{SessionController, SessionDeps, SessionSettings};
use talkback_client::transport::WebRtcConnector;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "talkback=debug,talkback_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = ClientConfig::load()?;
    if let Some(api_url) = cli.api_url.clone() {
        config.api_url = api_url;
    }

    tracing::info!("Starting talkback client against {}", config.api_url);

    let backend = Arc::new(BackendClient::with_timeout(
        &config.api_url,
        config.request_timeout(),
    )?);

    if cli.balance {
        let balance = backend.token_balance(cli.user_id).await?;
        println!("{}", balance);
        return Ok(());
    }

    if let Some(model) = cli.model.as_deref() {
        backend.update_user_model(cli.user_id, model).await?;
        tracing::info!("Model set to {}", model);
    }
    if let Some(voice) = cli.voice.as_deref() {
        backend.update_user_voice(cli.user_id, voice).await?;
    }
    if let Some(prompt_id) = cli.prompt_id {
        backend.select_prompt(cli.user_id, prompt_id).await?;
        tracing::info!("Prompt {} selected", prompt_id);
    }

    let output: Arc<dyn AudioOutput> = match RodioOutput::new() {
        Ok(output) => Arc::new(output),
        Err(e) => {
            tracing::warn!("No audio output available, assistant audio is muted: {}", e);
            Arc::new(SilentOutput::new())
        }
    };

    let controller = SessionController::new(
        SessionDeps {
            backend: backend.clone(),
            connector: Arc::new(WebRtcConnector::new(
                &config.provider_url,
                config.request_timeout(),
            )?),
            media: MediaGate::global(),
            output,
            routing: Arc::new(NoRoutingHint),
        },
        SessionSettings::from(&config),
    );

    let mut states = controller.subscribe();
    let state_log = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let snapshot = states.borrow_and_update().clone();
            match &snapshot.error {
                Some(err) => println!("[{}] {}", snapshot.state, err),
                None => println!("[{}] balance: {}", snapshot.state, snapshot.token_balance),
            }
        }
    });

    if let Err(e) = controller.connect(cli.user_id, cli.voice.clone()).await {
        tracing::error!("Failed to start voice session: {}", e);
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut health = tokio::time::interval(config.health_interval());
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutting down");
                break;
            }
            _ = health.tick() => {
                let online = match tokio::time::timeout(config.health_interval(), backend.health()).await {
                    Ok(Ok(_)) => true,
                    Ok(Err(e)) => {
                        tracing::debug!("Health probe failed: {}", e);
                        false
                    }
                    Err(_) => {
                        tracing::debug!("Health probe timed out");
                        false
                    }
                };
                controller.network_changed(online).await;
            }
        }
    }

    controller.dispose().await;
    state_log.abort();

    Ok(())
}

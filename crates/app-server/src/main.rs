mod status_source;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chess_domain::{EventSink, WalletAddress};
use coordinator::{Coordinator, CoordinatorSettings};
use escrow_verifier::{EscrowClient, JsonRpcEscrowClient, LinearBackoff, StakeVerifier};
use event_gateway::{EventGateway, SubscriberHub};
use handle_registry::HandleRegistry;
use observability::init_tracing_with_filter;
use platform_core::{AppConfig, AppEnv};
use status_source::CoordinatorStatusSource;
use tracing::{error, info, warn};
use verdict_signer::VerdictSigner;

const SIGNER_KEY_ENV: &str = "SIGNER_PRIVATE_KEY";
const RATE_LIMIT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(err) => {
            let config = AppConfig::default_for_env(AppEnv::Local);
            init_tracing_with_filter(&config.app.service_name, &config.observability.log_filter);
            warn!(error = %err, "config load failed, falling back to built-in defaults");
            config
        }
    };
    init_tracing_with_filter(&config.app.service_name, &config.observability.log_filter);

    let module_address: WalletAddress = config
        .escrow
        .module_address
        .parse()
        .with_context(|| format!("invalid escrow module address {}", config.escrow.module_address))?;

    // Signer startup failures are loud but non-fatal: games are still
    // played and archived, only verdict signing fails per-game.
    let signer = match std::env::var(SIGNER_KEY_ENV) {
        Ok(raw) => match VerdictSigner::from_hex_key(&raw, config.escrow.chain_id, module_address) {
            Ok(signer) => {
                info!(signer = %signer.signer_address(), chain_id = config.escrow.chain_id, "verdict signer ready");
                Some(Arc::new(signer))
            }
            Err(err) => {
                error!(error = %err, "invalid {SIGNER_KEY_ENV}, verdicts will be unsigned");
                None
            }
        },
        Err(_) => {
            error!("{SIGNER_KEY_ENV} not set, verdicts will be unsigned");
            None
        }
    };

    let escrow_client: Arc<dyn EscrowClient> = Arc::new(JsonRpcEscrowClient::new(
        config.escrow.rpc_urls.clone(),
        module_address,
    ));
    let verifier = Arc::new(StakeVerifier::new(
        Arc::clone(&escrow_client),
        LinearBackoff {
            max_attempts: config.escrow.verify_max_attempts,
            base_delay: Duration::from_secs(config.escrow.verify_backoff_secs),
        },
    ));

    // Startup self-check: the escrow only accepts our signatures if its
    // trusted signer matches the local key. Logged, never fatal.
    if let Some(signer) = signer.clone() {
        let client = Arc::clone(&escrow_client);
        tokio::spawn(async move {
            match client.trusted_signer().await {
                Ok(trusted) if trusted == signer.signer_address() => {
                    info!(trusted = %trusted, "escrow trusted signer matches local key");
                }
                Ok(trusted) => {
                    error!(
                        trusted = %trusted,
                        local = %signer.signer_address(),
                        "escrow trusted signer does NOT match local key, verdicts will not be claimable"
                    );
                }
                Err(err) => {
                    warn!(error = %err, "trusted signer self-check failed");
                }
            }
        });
    }

    let handles = HandleRegistry::load(&config.persistence.usernames_path)
        .with_context(|| format!("loading {}", config.persistence.usernames_path))?;
    info!(usernames = handles.len(), path = %config.persistence.usernames_path, "username registry loaded");

    let hub = Arc::new(SubscriberHub::new());
    let (coordinator, retired_rx) = Coordinator::new(
        Arc::clone(&hub) as Arc<dyn EventSink>,
        signer,
        verifier,
        handles,
        CoordinatorSettings {
            default_time_seconds: config.game.default_time_seconds,
            draw_offer_ttl_seconds: config.game.draw_offer_ttl_seconds,
            reconnect_window_seconds: config.game.reconnect_window_seconds,
            retire_after_seconds: config.game.room_gc_seconds,
        },
    );
    tokio::spawn(Arc::clone(&coordinator).run_reaper(retired_rx));

    // The gateway is handed to whatever transport embeds this process; it
    // also owns the rate limiter we sweep periodically.
    let gateway = Arc::new(EventGateway::new(Arc::clone(&coordinator), hub));
    {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RATE_LIMIT_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                gateway.sweep_rate_limiter();
            }
        });
    }

    let status = Arc::new(CoordinatorStatusSource::new(
        Arc::clone(&coordinator),
        config.app.service_name.clone(),
    ));
    let router = ops_http::build_router(status);
    let listener = tokio::net::TcpListener::bind(&config.app.ops_http_bind_addr)
        .await
        .with_context(|| format!("binding ops http on {}", config.app.ops_http_bind_addr))?;
    info!(addr = %config.app.ops_http_bind_addr, env = config.app.env.as_str(), "coordinator up");
    axum::serve(listener, router).await.context("ops http server")?;
    Ok(())
}

// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use claim_settlement::api::router;
use claim_settlement::attestation::{AttestationLedger, EvmAttestationLedger};
use claim_settlement::blockchain::{chain_by_id, ChainRegistry, EphemeralKey, EvmRail};
use claim_settlement::config::{AppConfig, AttestationConfig, LogFormat};
use claim_settlement::engine::{AttestationSweeper, SettlementPoller};
use claim_settlement::providers::{HttpPriceSource, HttpQuoteProvider, PriceSource};
use claim_settlement::state::{AppState, Collaborators};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn load_ledger(
    config: &AttestationConfig,
    registry: &ChainRegistry,
) -> Result<Arc<dyn AttestationLedger>, String> {
    let chain = chain_by_id(config.chain_id)
        .ok_or_else(|| format!("unsupported attestation chain {}", config.chain_id))?;
    let rpc_url = registry
        .rpc_url(config.chain_id)
        .ok_or_else(|| format!("no RPC URL for chain {}", config.chain_id))?;
    let pem = std::fs::read(&config.signer_key_path)
        .map_err(|e| format!("cannot read {}: {e}", config.signer_key_path.display()))?;
    let signer = EphemeralKey::from_pem(&pem).map_err(|e| e.to_string())?;
    info!(
        chain = chain.name,
        contract = %config.contract,
        signer = %signer.address_string(),
        "Attestation ledger configured"
    );
    let ledger = EvmAttestationLedger::new(chain, rpc_url, &config.contract, signer)
        .map_err(|e| e.to_string())?;
    Ok(Arc::new(ledger))
}

fn load_gas_sponsor(path: &Path) -> Result<EphemeralKey, String> {
    let pem = std::fs::read(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let sponsor = EphemeralKey::from_pem(&pem).map_err(|e| e.to_string())?;
    info!(sponsor = %sponsor.address_string(), "Gas sponsor configured");
    Ok(sponsor)
}

#[tokio::main]
async fn main() {
    let config = AppConfig::from_env().expect("Invalid configuration");
    init_tracing(config.log_format);

    // Install the ring crypto provider for rustls (must be done before any TLS operations)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let registry = ChainRegistry::new(config.rpc_urls.clone());
    let ledger = match &config.attestation {
        Some(attestation) => {
            Some(load_ledger(attestation, &registry).expect("Failed to load attestation ledger"))
        }
        None => {
            warn!("ATTESTATION_CONTRACT not set, claims will only receive nonces");
            None
        }
    };
    let price_feed: Option<Arc<dyn PriceSource>> = match config.price_api_url.clone() {
        Some(url) => Some(Arc::new(
            HttpPriceSource::new(url).expect("Failed to build price feed client"),
        )),
        None => None,
    };
    let gas_sponsor = match &config.companion.gas_sponsor_key_path {
        Some(path) => Some(load_gas_sponsor(path).expect("Failed to load gas sponsor key")),
        None => {
            info!("GAS_SPONSOR_KEY_PATH not set, sessions funded in ERC-20 tokens are rejected");
            None
        }
    };
    let quotes = HttpQuoteProvider::new(
        config.quote_provider_url.clone(),
        config.quote_provider_api_key.clone(),
    )
    .expect("Failed to configure quote provider");

    let state = AppState::build(
        &config,
        Collaborators {
            quotes: Arc::new(quotes),
            price_feed,
            rail: Arc::new(EvmRail::new(registry)),
            ledger,
            gas_sponsor,
        },
    )
    .expect("Failed to open data directory");
    info!(data_dir = %config.data_dir.display(), "Storage ready");

    // Background loops
    let shutdown = CancellationToken::new();
    let poller = SettlementPoller::new(state.orchestrator.clone(), config.settlement_tick);
    let sweeper = AttestationSweeper::new(state.orchestrator.clone(), config.attestation_sweep);
    let poller_task = tokio::spawn(poller.run(shutdown.clone()));
    let sweeper_task = tokio::spawn(sweeper.run(shutdown.clone()));

    let handle = Handle::new();
    {
        let handle = handle.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
            shutdown.cancel();
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });
    }

    let addr: SocketAddr = config
        .bind_address()
        .parse()
        .expect("Failed to parse bind address");
    let app = router(state);

    match &config.tls {
        Some(tls) => {
            let tls_config = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
                .await
                .expect("Failed to load TLS certificate");
            info!(%addr, "Claim settlement server listening on https (docs at /docs)");
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await
                .expect("HTTPS server failed");
        }
        None => {
            info!(%addr, "Claim settlement server listening on http (docs at /docs)");
            axum_server::bind(addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await
                .expect("HTTP server failed");
        }
    }

    shutdown.cancel();
    let _ = tokio::join!(poller_task, sweeper_task);
    info!("Shutdown complete");
}

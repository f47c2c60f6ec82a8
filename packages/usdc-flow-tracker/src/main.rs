//! USDC Flow Tracker daemon
//!
//! Serves the flow API and polls EVM, Noble and Namada for every registered
//! flow. Pending flows found in the store at startup are resumed.

use std::sync::Arc;
use std::time::Duration;

use eyre::WrapErr;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use usdc_flow_tracker::attestation::{AttestationClient, IrisAttestationApi};
use usdc_flow_tracker::block_meta::BlockMetadataResolver;
use usdc_flow_tracker::cache::{BoundedTtlCache, DEFAULT_BLOCK_CACHE_SIZE, DEFAULT_BLOCK_CACHE_TTL_SECS};
use usdc_flow_tracker::config::Config;
use usdc_flow_tracker::metrics::Metrics;
use usdc_flow_tracker::orchestrator::Orchestrator;
use usdc_flow_tracker::pollers::{ChainPollers, EvmPoller, NamadaPoller, NoblePoller, PollerDeps};
use usdc_flow_tracker::rpc::{AlloyEvmRpc, CometRpc};
use usdc_flow_tracker::server::{self, AppState};
use usdc_flow_tracker::store::{MemoryStateStore, PgStateStore, StateStore};

const ATTESTATION_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    info!("Starting USDC Flow Tracker");

    let config = Config::load()?;
    info!(
        evm_rpc = %config.evm_rpc_urls.join(","),
        noble_rpc = %config.noble_rpc_url,
        namada_rpc = %config.namada_rpc_url,
        persistent = config.database_url.is_some(),
        "Configuration loaded"
    );

    let metrics = Arc::new(Metrics::new());

    let store: Arc<dyn StateStore> = match &config.database_url {
        Some(url) => {
            let store = PgStateStore::connect(url.expose(), config.database_max_connections)
                .await
                .wrap_err("Failed to connect to database")?;
            store
                .run_migrations()
                .await
                .wrap_err("Failed to run database migrations")?;
            info!("Using Postgres state store");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; flow state will not survive a restart");
            Arc::new(MemoryStateStore::new())
        }
    };

    let attestation_api = IrisAttestationApi::new(&config.attestation_api_url, ATTESTATION_REQUEST_TIMEOUT)?;
    let attestation = Arc::new(AttestationClient::new(Arc::new(attestation_api)).with_metrics(metrics.clone()));

    let evm_rpc = Arc::new(AlloyEvmRpc::new(&config.evm_rpc_urls)?);
    let noble_rpc = Arc::new(CometRpc::new(
        "noble",
        &config.noble_rpc_url,
        config.noble_lcd_url.clone(),
    )?);
    let namada_rpc = Arc::new(CometRpc::new("namada", &config.namada_rpc_url, None)?);

    let pollers = ChainPollers::new(
        EvmPoller::new(evm_rpc, poller_deps(&config, &attestation), config.evm_poller()),
        NoblePoller::new(noble_rpc, poller_deps(&config, &attestation), config.noble_poller()),
        NamadaPoller::new(namada_rpc, poller_deps(&config, &attestation), config.namada_poller()),
    );

    let orchestrator = Arc::new(
        Orchestrator::new(store, Arc::new(pollers), config.orchestrator()).with_metrics(metrics.clone()),
    );
    orchestrator.resume_all().await?;

    let shutdown = CancellationToken::new();
    let mut server_task = tokio::spawn(server::start_server(
        config.api_addr()?,
        AppState {
            orchestrator: orchestrator.clone(),
            metrics,
        },
        shutdown.clone(),
    ));

    let server_result = tokio::select! {
        _ = wait_for_shutdown_signal() => None,
        result = &mut server_task => Some(result),
    };

    shutdown.cancel();
    orchestrator.shutdown().await;

    let server_result = match server_result {
        Some(result) => result,
        None => server_task.await,
    };
    match server_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(error = %e, "API server failed");
            return Err(e);
        }
        Err(e) => {
            error!(error = %e, "API server task panicked");
            return Err(e.into());
        }
    }

    info!("USDC Flow Tracker stopped");
    Ok(())
}

/// Each chain gets its own block timestamp cache since heights overlap.
fn poller_deps(config: &Config, attestation: &Arc<AttestationClient>) -> Arc<PollerDeps> {
    Arc::new(PollerDeps {
        attestation: attestation.clone(),
        blocks: Arc::new(BlockMetadataResolver::new(BoundedTtlCache::new(
            DEFAULT_BLOCK_CACHE_SIZE,
            Duration::from_secs(DEFAULT_BLOCK_CACHE_TTL_SECS),
        ))),
        retry: config.retry(),
        attestation_timeout: Duration::from_secs(config.attestation_timeout_secs),
        attestation_interval: Duration::from_millis(config.attestation_interval_ms),
    })
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,usdc_flow_tracker=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let (plain_layer, json_layer) = if json {
        (None, Some(fmt::layer().json().with_target(true)))
    } else {
        (Some(fmt::layer().with_target(true)), None)
    };

    tracing_subscriber::registry()
        .with(plain_layer)
        .with(json_layer)
        .with(filter)
        .init();
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}

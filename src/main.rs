use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::Address;
use eyre::WrapErr;

use vbank_relayer::api;
use vbank_relayer::chain::{EvmBroadcaster, EvmCapability, EvmJsonRpc, FeePolicy};
use vbank_relayer::config::Config;
use vbank_relayer::engine::{Engine, EngineDeps, NativeAsset, SystemClock};
use vbank_relayer::home::HomeRpcClient;
use vbank_relayer::store::{MemoryStore, PgStore, TxStore};

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting virtual bank relayer");

    let config = Config::load()?;
    tracing::info!(
        chain = %config.chain.name,
        chain_id = config.chain.chain_id,
        bridge = %config.chain.bridge_address,
        confirmations = config.engine.confirmations,
        "Configuration loaded"
    );

    let store: Arc<dyn TxStore> = match &config.database {
        Some(database) => {
            let store = PgStore::connect(&database.url).await?;
            tracing::info!("Database connected, migrations complete");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let bridge = Address::from_str(&config.chain.bridge_address)
        .wrap_err("Invalid BRIDGE_ADDRESS")?;
    let fee_policy = FeePolicy::new(
        config.engine.gas_bump_percent,
        config.engine.max_gas_multiplier,
    );

    let rpc = Arc::new(EvmJsonRpc::new(config.chain.rpc_urls())?);
    let home = Arc::new(HomeRpcClient::new(
        config.home.rpc_url.clone(),
        config.chain.chain_id,
    )?);
    let capability = Arc::new(EvmCapability::new(
        config.chain.name.clone(),
        bridge,
        fee_policy,
    ));
    let broadcaster = Arc::new(EvmBroadcaster::new(
        &config.chain.rpc_url,
        &config.chain.bridge_address,
        &config.chain.private_key,
    )?);

    let deps = EngineDeps {
        rpc,
        home,
        capability,
        broadcaster,
        store,
        clock: Arc::new(SystemClock),
    };
    let native = NativeAsset {
        asset_id: config.chain.native_asset_id,
        decimals: config.chain.native_decimals,
    };
    let engine = Arc::new(Engine::new(deps, config.engine.clone(), native));
    engine.start_up().await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(()).await;
    });

    let api_addr = config.api.bind;
    let api_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(api_addr, api_engine).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    if let Err(e) = engine.run(shutdown_rx).await {
        tracing::error!(error = %e, "Engine stopped with error");
        return Err(e);
    }

    tracing::info!("Virtual bank relayer stopped");
    Ok(())
}

/// Initialize tracing; `LOG_FORMAT=json` switches to JSON lines
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vbank_relayer=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}

mod config;
mod connection;
mod crypto;
mod error;
mod frame;
mod gateway;
mod http;
mod kv;
mod logging;
mod oauth;
mod protobuf;
mod quotebus;
mod session;
mod symbols;
mod types;

use std::path::Path;
use std::sync::Arc;

use config::Config;
use connection::Connection;
use crypto::TokenCrypto;
use gateway::Gateway;
use kv::KvClient;
use oauth::OAuthClient;
use protobuf::ProtoRegistry;
use quotebus::QuoteBus;
use session::SessionStore;
use symbols::SymbolStore;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    let config = Config::load()?;
    logging::init(&config.log_level);

    tracing::info!("starting ctrader-gateway");

    let config = Arc::new(config);
    let registry = Arc::new(ProtoRegistry::load(Path::new(&config.ctrader_proto_dir))?);
    tracing::info!(proto_dir = %config.ctrader_proto_dir, "protobuf schema loaded");

    let kv = KvClient::connect(&config.redis_url).await?;
    tracing::info!("connected to key/value store");

    let crypto = TokenCrypto::from_str_key(&config.token_encryption_key)?;
    let sessions = SessionStore::new(kv.clone(), crypto);
    let symbols = SymbolStore::new(kv, config.symbol_cache_ttl_secs);

    let quote_bus = Arc::new(QuoteBus::new());
    let connection = Connection::new(config.clone(), registry, quote_bus.clone());
    connection.start();

    let oauth = OAuthClient::new(&config);
    let gateway = Arc::new(Gateway::new(
        config.clone(),
        connection.clone(),
        quote_bus,
        sessions.clone(),
        symbols,
    ));

    let state = http::AppState {
        gateway,
        oauth,
        sessions,
        config: config.clone(),
    };
    let app = http::build_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await?;

    connection.stop();
    tracing::info!("ctrader-gateway stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use settlement_core::cli::{
    self, Cli, Commands, DbCommands, LedgerCommands, OrderCommands, SettlementCommands,
};
use settlement_core::config::{Config, LogFormat};
use settlement_core::services::{run_expiry_sweeper, run_outbox_worker, run_payout_reconciler};
use settlement_core::adapters::PgStore;
use settlement_core::provider::HttpProvider;
use settlement_core::{create_app, db, Engine};

fn init_tracing(format: LogFormat) {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing(config.log_format);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Db(DbCommands::Migrate) => cli::handle_db_migrate(&config).await,
        Commands::Config => cli::handle_config(&config),
        Commands::Ledger(LedgerCommands::Verify { party_type, party_id }) => {
            let engine = cli::connect(&config).await?;
            cli::handle_ledger_verify(&engine, &party_type, party_id).await
        }
        Commands::Settlement(command) => {
            let engine = cli::connect(&config).await?;
            match command {
                SettlementCommands::Retry { id } => cli::handle_settlement_retry(&engine, id).await,
                SettlementCommands::Sweep { business_id } => {
                    cli::handle_settlement_sweep(&engine, business_id).await
                }
                SettlementCommands::Reconcile => cli::handle_settlement_reconcile(&engine).await,
                SettlementCommands::Confirm { id } => {
                    cli::handle_settlement_confirm(&engine, id).await
                }
            }
        }
        Commands::Orders(OrderCommands::Expire) => {
            let engine = cli::connect(&config).await?;
            cli::handle_orders_expire(&engine).await
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let pool = db::create_pool(&config).await?;
    db::run_migrations(&pool).await?;

    let store = Arc::new(PgStore::new(pool));
    let provider = Arc::new(HttpProvider::new(&config.provider));
    let engine = Engine::new(store, provider, config.engine_settings());
    tracing::info!(
        "Engine ready: settlement mode {}, provider {}",
        config.settlement.mode.as_str(),
        config.provider.base_url
    );

    tokio::spawn(run_outbox_worker(
        engine.outbox.clone(),
        engine.wakeups,
        config.outbox_poll_interval,
    ));
    tokio::spawn(run_expiry_sweeper(
        engine.state.payments.clone(),
        config.expiry_sweep_interval,
    ));
    tokio::spawn(run_payout_reconciler(
        engine.state.settlements.clone(),
        config.expiry_sweep_interval,
    ));

    let app = create_app(engine.state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

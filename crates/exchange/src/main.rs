use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use a2a_compliance::{ComplianceLog, TimestampAuthority};
use a2a_exchange::attest::ComplianceBridge;
use a2a_exchange::observer::{run_expiry_loop, PaymentTimeoutObserver};
use a2a_exchange::{routes, AppState, Settings, Store};

#[derive(Parser, Debug)]
#[command(name = "a2a-exchange")]
#[command(about = "settlement exchange for the a2a economy", long_about = None)]
struct Args {
    /// Listen host (overrides A2A_EXCHANGE_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides A2A_EXCHANGE_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Database URL (overrides A2A_EXCHANGE_DATABASE_URL)
    #[arg(long)]
    database: Option<String>,

    /// Create demo accounts and exit
    #[arg(long)]
    seed: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "a2a_exchange=info,tower_http=warn".into()),
        )
        .init();

    let args = Args::parse();

    let mut settings = Settings::from_env();
    if let Some(host) = args.host {
        settings.host = host;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(database) = args.database {
        settings.database_url = database;
    }

    info!("starting a2a-exchange");
    info!("database: {}", settings.database_url);

    // fatal on unreachable database or schema failure
    let store = Store::open(&settings.database_url).await?;

    if args.seed {
        a2a_exchange::seed::seed(&store, &settings).await?;
        return Ok(());
    }

    let compliance = match &settings.compliance_db {
        Some(db_url) => {
            let tsa = settings.tsa_url.as_ref().map(|url| {
                TimestampAuthority::new(url.clone()).with_timeout(Duration::from_secs(30))
            });
            let log = ComplianceLog::open(db_url, tsa).await?;
            info!("compliance log enabled at {db_url}");
            ComplianceBridge::new(Some(Arc::new(log)), "a2a-settlement-exchange")
        }
        None => ComplianceBridge::disabled(),
    };

    let state = AppState::new(settings.clone(), store.clone(), compliance);

    // background expiry observer on its own timer
    let observer = PaymentTimeoutObserver::new(store, &settings);
    tokio::spawn(run_expiry_loop(
        observer,
        state.webhooks.clone(),
        state.compliance.clone(),
        state.settings.clone(),
    ));

    let app = routes::router(state);

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port).parse()?;
    info!("listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

use std::sync::Arc;

use clap::Parser;
use tabula_core::extract::RowLimits;
use tabula_core::TabulaConfig;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use tabula_server::http::{self, HttpState};
use tabula_server::locks::SessionLocks;
use tabula_server::pipeline::{MessagePipeline, RetentionLimits};
use tabula_server::repo::PgSessionRepo;
use tabula_server::upstream::UpstreamClient;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "tabula.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience — production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Init logging
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    // Load config
    let config = match TabulaConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Connect to DB
    let pool = match tabula_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match tabula_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }
        println!("✅ Tabula DB health check passed");
        return Ok(());
    }

    tabula_core::db::init_schema(&pool).await?;

    let upstream = UpstreamClient::new(&config.upstream)?;
    if !upstream.is_configured() {
        tracing::warn!("engine webhook url is not configured, chat turns will fail");
    }

    let limits = RowLimits::from(&config.tables);
    let state = Arc::new(HttpState {
        pipeline: MessagePipeline::new(
            Arc::new(PgSessionRepo::new(pool)),
            RetentionLimits::from(&config.retention),
            limits.effective(None),
        ),
        locks: SessionLocks::new(),
        upstream: Arc::new(upstream),
        limits,
    });

    let (tx, rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    http::start_http_server(state, &config.http.host, config.http.port, rx).await?;

    tracing::info!("Tabula server stopped");
    Ok(())
}

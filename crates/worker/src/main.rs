use anyhow::Context;
use clap::{Parser, Subcommand};
use ratingscope_core::ingest::interrupt::Interrupt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod ingest;

const DEFAULT_INGEST_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Parser)]
#[command(name = "ratingscope_worker")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Pull every page of the ratings source and persist new ratings.
    Ingest {
        /// Fetch and validate into memory only; do not touch the database.
        #[arg(long)]
        dry_run: bool,

        /// Abort the run after this many seconds (defaults to INGEST_TIMEOUT_SECS or 600).
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Fetch auxiliary per-ticker data. Defaults to every known ticker.
    Enrich {
        #[arg(long, value_delimiter = ',')]
        tickers: Option<Vec<String>>,
    },
    /// Print current recommendations as JSON.
    Recommend {
        /// JSON object mapping tickers to `{"closes": [...], "sentiment": 0.4}`; attached as
        /// technical and sentiment signals.
        #[arg(long)]
        signals: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = ratingscope_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    let token = CancellationToken::new();
    spawn_ctrl_c(token.clone());

    let res = match args.command {
        Command::Ingest {
            dry_run,
            timeout_secs,
        } => {
            let timeout = timeout_secs.unwrap_or_else(|| {
                ratingscope_core::config::env_or("INGEST_TIMEOUT_SECS", DEFAULT_INGEST_TIMEOUT_SECS)
            });
            let interrupt = Interrupt::new(token).with_timeout(Duration::from_secs(timeout));
            if dry_run {
                ingest::dry_run(&settings, &interrupt).await
            } else {
                ingest::run(&settings, &interrupt).await
            }
        }
        Command::Enrich { tickers } => ingest::enrich(&settings, tickers, &Interrupt::new(token)).await,
        Command::Recommend { signals } => recommend(&settings, signals.as_deref()).await,
    };

    if let Err(err) = &res {
        sentry_anyhow::capture_anyhow(err);
        tracing::error!(error = %err, "worker run failed");
    }
    res
}

async fn recommend(
    settings: &ratingscope_core::config::Settings,
    signals: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    let signals = match signals {
        Some(path) => ratingscope_core::recommend::signals::load_signal_inputs(path)?,
        None => Default::default(),
    };

    let pool = connect(settings).await?;
    let store = ratingscope_core::storage::ratings::PgRatingStore::new(pool);
    let engine = ratingscope_core::recommend::RecommendationEngine::default();
    let recs = engine.generate_with_signals(&store, &signals).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&recs).context("serialize recommendations failed")?
    );
    Ok(())
}

pub(crate) async fn connect(
    settings: &ratingscope_core::config::Settings,
) -> anyhow::Result<sqlx::PgPool> {
    let db_url = settings.require_database_url()?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .context("connect DATABASE_URL failed")?;

    ratingscope_core::storage::migrate(&pool).await?;
    Ok(pool)
}

fn spawn_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("ctrl-c received; cancelling run");
            token.cancel();
        }
    });
}

fn init_sentry(settings: &ratingscope_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

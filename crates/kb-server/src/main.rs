//! Process wiring only: configuration, logging, and pool construction.
//! Schema creation, credential provisioning, and interactive CLI drivers
//! are external collaborators (spec.md §1, §6) and are deliberately not
//! implemented here.

use clap::Parser;

/// kb-server holds a connection pool open against the coordination store.
/// It does not itself serve a polling loop: every C4-C8 operation in
/// `kb-queue` is invoked directly by a caller holding this pool, not
/// dispatched through a background executor.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// URL of the postgres database.
    #[clap(long = "database", env = "DATABASE_URL")]
    database_url: String,
    /// Default `max_retries` passed to operations that don't override it.
    #[clap(long = "max-retries", env = "MAX_RETRIES", default_value = "5")]
    max_retries: u32,
    /// Default `base_delay`, in milliseconds, passed to operations that
    /// don't override it.
    #[clap(long = "base-delay-ms", env = "BASE_DELAY_MS", default_value = "100")]
    base_delay_ms: u64,
}

fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(!matches!(std::env::var("NO_COLOR"), Ok(v) if v == "1"))
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default failed");

    let args = Args::parse();
    tracing::info!(max_retries = args.max_retries, base_delay_ms = args.base_delay_ms, "started");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&args.database_url)
        .await?;

    tracing::info!("connected to coordination store");

    tokio::signal::ctrl_c().await?;
    pool.close().await;
    tracing::info!("shut down");
    Ok(())
}

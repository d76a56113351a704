//! `boxpool` binary: configure tracing, open the pool and serve HTTP.

use boxpool::{PoolConfig, ServerConfig, SlotManager};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("BOXPOOL_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "boxpool={level},boxpool_server={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let pool_config = PoolConfig::from_env()?;
    let server_config = ServerConfig::from_env()?;

    tracing::info!(
        version = boxpool::BOXPOOL_VERSION,
        pool_size = pool_config.pool_size,
        base_port = pool_config.base_port,
        database = %pool_config.database_path.display(),
        "Opening slot pool"
    );

    let manager = SlotManager::open(pool_config).await?;
    boxpool::serve(server_config, manager).await
}

use tracing_subscriber::EnvFilter;

use bancroft_server::config::BancroftConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = BancroftConfig::load()?;
    let db = bancroft_storage::create_db(&config.database.path).await?;
    tracing::info!(path = %config.database.path.display(), "database ready");

    let bind = config.server.bind.clone();
    let (app, _worker) = bancroft_server::build(config, db);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

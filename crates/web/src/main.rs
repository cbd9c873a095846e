use funneldeck_web::config::AppConfig;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = AppConfig::from_env()?;

    info!(
        "Starting FunnelDeck on http://{} (auth: {})",
        cfg.listen,
        if cfg.auth.enabled { "enabled" } else { "disabled" }
    );

    funneldeck_web::server::serve(cfg).await
}

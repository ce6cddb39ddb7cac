use clap::Parser;
use tracing::info;

use rtunnel_relay::config::Config;
use rtunnel_relay::{router, RelayState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(config.log_level.clone())
        .init();

    let addr = config.socket_addr()?;
    let app = router(RelayState::new(config));

    info!(%addr, "rtunnel relay listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

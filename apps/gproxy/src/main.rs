use anyhow::Result;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let state = gproxy_core::bootstrap::bootstrap_from_env()?;
    let bind = {
        let global = state.global.load();
        format!("{}:{}", global.host, global.port)
    };

    let app = gproxy_router::router(state);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "gproxy listening");
    axum::serve(listener, app).await?;
    Ok(())
}

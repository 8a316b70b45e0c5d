use std::sync::Arc;

use tracing::info;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config_path = "config.yaml".to_string();
    let mut listen_override: Option<String> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen_override = Some(args.next().ok_or("missing value for --listen/--addr")?);
            }
            "--help" | "-h" => {
                eprintln!("usage: llm-router [config.yaml] [--listen HOST:PORT]");
                return Ok(());
            }
            other if other.starts_with('-') => return Err(format!("unknown arg: {other}").into()),
            other => config_path = other.to_string(),
        }
    }

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Config failures are fatal; there is nothing to serve without one.
    let config = llm_router::Config::load(&config_path)?;
    let listen = listen_override.unwrap_or_else(|| format!("0.0.0.0:{}", config.port));

    let registry = Arc::new(llm_router::Registry::from_config(&config)?);
    let app = llm_router::server::router(registry, &config.api_key);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(address = %listen, "llm-router listening");
    axum::serve(listener, app).await?;
    Ok(())
}

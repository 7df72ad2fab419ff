use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use watchproxy::{config::Settings, create_app, state::ProxyState};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (optional; defaults apply when missing)
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Set up a proxy for this URL at startup
    #[arg(long)]
    url: Option<String>,

    /// Referer sent upstream for --url
    #[arg(long)]
    referer: Option<String>,

    /// Listen port (overrides config)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let settings = Settings::load(&args.config)?;
    info!("Configuration loaded from {}: {:?}", args.config, settings);

    tokio::fs::create_dir_all(&settings.proxy.content_dir).await?;
    let state = Arc::new(ProxyState::new(settings.proxy.clone())?);

    if let Some(url) = &args.url {
        let referer = args.referer.as_deref();
        let ok = if watchproxy::state::is_hls_url(url) {
            state.setup_hls_proxy(url, referer).await
        } else {
            state.setup_generic_proxy(url, referer).await
        };
        if ok {
            info!("Proxy ready for {}", url);
        } else {
            error!("Failed to set up proxy for {}", url);
        }
    }

    let app = create_app(state);

    let port = args.port.unwrap_or(settings.server.port);
    let addr = format!("{}:{}", settings.server.host, port);
    info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

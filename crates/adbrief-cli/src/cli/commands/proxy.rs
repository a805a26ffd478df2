//! Standalone auth proxy.

use adbrief_core::config::Config;
use adbrief_core::logging;
use adbrief_providers::proxy::{AuthProxy, ProxyConfig};
use anyhow::{Context, Result};
use url::Url;

pub async fn run(config: &Config, target: Option<&str>) -> Result<()> {
    logging::init_stderr()?;

    let target = match target {
        Some(raw) => Url::parse(raw).with_context(|| format!("Invalid target URL: {raw}"))?,
        None => config.upstream_url()?,
    };

    let proxy = AuthProxy::new(ProxyConfig {
        key_header: config.proxy.api_key_header.clone(),
        auth_scheme: config.proxy.auth_scheme.clone(),
        fallback_api_key: config.api_key().ok(),
    });
    let local_url = proxy.start(target.clone()).await?;
    println!("{local_url}");
    eprintln!("Forwarding {local_url} -> {target} (Ctrl+C to stop)");

    tokio::signal::ctrl_c()
        .await
        .context("wait for Ctrl+C")?;
    proxy.shutdown().await;
    Ok(())
}

//! tlsproxy - Main entry point
//!
//! A TLS-terminating reverse proxy

use anyhow::Result;
use clap::error::ErrorKind;
use clap::CommandFactory;
use std::sync::Arc;
use tlsproxy::{Args, CertificateManager, HostPolicy, ProxyServer, RoutingTable};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::from_env();

    // Initialize logging; RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    // Bad domain groups are reported like any other argument error
    let domains = match args.domains() {
        Ok(domains) => domains,
        Err(e) => Args::command().error(ErrorKind::ValueValidation, e).exit(),
    };

    let config = args.proxy_config();
    info!(
        "Timeouts: read {:?}, write {:?}, idle {:?}",
        config.timeouts.read, config.timeouts.write, config.timeouts.idle
    );

    let policy = HostPolicy::new(domains.hosts());
    let cert_manager = Arc::new(CertificateManager::new(&args.cache_dir, policy)?);
    info!(
        "Certificate cache at {} for {} hosts",
        args.cache_dir.display(),
        cert_manager.policy().len()
    );

    let warm_manager = cert_manager.clone();
    tokio::task::spawn_blocking(move || warm_manager.warm());

    let routes = RoutingTable::build(&domains);
    let server = Arc::new(ProxyServer::new(config, routes, cert_manager));

    info!("proxy up, using domains: {}", domains);

    server.run().await?;

    Ok(())
}

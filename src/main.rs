//! gafaelfawr-rs — authentication/authorization gateway for `nginx
//! auth_request`, with an OIDC Provider and Relying Party.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use gafaelfawr_rs::{cli::Cli, config::Config, http::Gateway, setup_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = cli.log_level.as_deref().unwrap_or("info");
    if let Err(e) = setup_tracing(log_level, cli.log_format.as_deref()) {
        eprintln!("failed to set up tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        realm = %config.realm,
        "starting gafaelfawr-rs"
    );

    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("failed to assemble gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("gateway shutdown complete");
    ExitCode::SUCCESS
}

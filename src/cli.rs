//! Command-line interface.

use std::path::PathBuf;

use clap::Parser;

/// Authentication/authorization gateway for `nginx auth_request`, with an
/// OIDC Provider and Relying Party.
#[derive(Parser, Debug)]
#[command(name = "gafaelfawr-rs")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML).
    #[arg(short, long, env = "GAFAELFAWR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on.
    #[arg(short, long, env = "GAFAELFAWR_PORT")]
    pub port: Option<u16>,

    /// Host to bind to.
    #[arg(long, env = "GAFAELFAWR_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "GAFAELFAWR_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format (text, json).
    #[arg(long, env = "GAFAELFAWR_LOG_FORMAT")]
    pub log_format: Option<String>,
}

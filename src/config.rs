use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::catalog::DEFAULT_API_URL;
use crate::ytdlp::DEFAULT_PROGRAM;

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about)]
pub struct ConfigContext {
    #[arg(
        short = 'b',
        long = "bind",
        env = "RIPQ_BIND",
        help = "Address the HTTP server listens on",
        default_value = "127.0.0.1:8080"
    )]
    pub bind: SocketAddr,

    #[arg(
        short = 'd',
        long = "base-dir",
        env = "RIPQ_BASE_DIR",
        help = "Directory holding job working directories and archives",
        default_value = "./downloaded"
    )]
    pub base_dir: PathBuf,

    #[arg(
        long = "grace-period-secs",
        env = "RIPQ_GRACE_PERIOD_SECS",
        help = "Seconds a finished job's archive stays available before cleanup",
        default_value = "120"
    )]
    pub grace_period_secs: u64,

    #[arg(
        short = 'c',
        long = "database-url",
        env = "DATABASE_URL",
        help = "PostgreSQL connection URL; jobs are kept in memory when absent"
    )]
    pub database_url: Option<String>,

    #[arg(
        long = "max-connections",
        help = "PostgreSQL pool size",
        default_value = "5"
    )]
    pub max_connections: u32,

    #[arg(
        long = "catalog-api-url",
        env = "RIPQ_CATALOG_API_URL",
        help = "Base URL of the catalog web API",
        default_value = DEFAULT_API_URL
    )]
    pub catalog_api_url: String,

    #[arg(
        long = "ytdlp-path",
        env = "RIPQ_YTDLP_PATH",
        help = "yt-dlp executable used to fetch tracks",
        default_value = DEFAULT_PROGRAM
    )]
    pub ytdlp_path: String,

    #[arg(
        long = "fetch-timeout-secs",
        env = "RIPQ_FETCH_TIMEOUT_SECS",
        help = "Seconds one track download may take before it is abandoned",
        default_value = "600"
    )]
    pub fetch_timeout_secs: u64,

    #[arg(
        long = "jaeger-endpoint",
        env = "RIPQ_JAEGER_ENDPOINT",
        help = "Jaeger collector endpoint, e.g. http://jaeger:14268/api/traces"
    )]
    pub jaeger_endpoint: Option<String>,
}

impl ConfigContext {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

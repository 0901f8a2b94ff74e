use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use adns::filter::Allowlist;
use adns::proxy::{self, ProxyConfig};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "adns", version)]
#[command(
    about = "DoH proxy that only allows the use of Adobe domain names",
    long_about = None
)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Options for the default `serve` command
    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Serves the DoH proxy on the given bind address and port
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to bind port to
    #[arg(short, long, env = "ADNS_BIND_ADDRESS", default_value = "0.0.0.0")]
    bind_address: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "ADNS_PORT", default_value = "53")]
    port: u16,

    /// DoH endpoint to proxy requests to
    #[arg(
        short = 't',
        long,
        env = "ADNS_PROXY_TO",
        default_value = "https://1.1.1.1/dns-query"
    )]
    proxy_to: String,

    /// Deadline for each upstream request in milliseconds (0 disables)
    #[arg(long, env = "ADNS_UPSTREAM_TIMEOUT_MS", default_value = "5000")]
    upstream_timeout_ms: u64,

    /// Maximum number of queries handled at once (0 for unbounded)
    #[arg(long, env = "ADNS_MAX_IN_FLIGHT", default_value = "0")]
    max_in_flight: usize,

    /// Seconds between statistics log lines (0 disables)
    #[arg(long, env = "ADNS_STATS_INTERVAL_SECS", default_value = "60")]
    stats_interval_secs: u64,

    /// Enable debug logging (forwarded queries, timing)
    #[arg(short, long)]
    verbose: bool,
}

impl ServeArgs {
    fn proxy_config(&self) -> ProxyConfig {
        let non_zero_secs = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));

        ProxyConfig {
            bind_addr: SocketAddr::new(self.bind_address, self.port),
            endpoint: self.proxy_to.clone(),
            upstream_timeout: (self.upstream_timeout_ms > 0)
                .then(|| Duration::from_millis(self.upstream_timeout_ms)),
            max_in_flight: (self.max_in_flight > 0).then_some(self.max_in_flight),
            stats_interval: non_zero_secs(self.stats_interval_secs),
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "adns=debug" } else { "adns=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let args = match cli.command {
        Some(Command::Serve(args)) => args,
        None => cli.serve,
    };
    init_tracing(args.verbose);

    // Fixed at build time on purpose.
    let allowlist = Allowlist::builtin().context("failed to compile built-in allowlist")?;

    proxy::run(args.proxy_config(), allowlist, shutdown_signal())
        .await
        .context("proxy failed")?;

    Ok(())
}

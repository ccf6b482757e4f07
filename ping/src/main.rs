use anyhow::{Context, Result};
use clap::Parser;
use raw_ping::ping::{icmp, tcp};
use raw_ping::{Config, PingError};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Probe each target once and report its round trip time.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Send half-open TCP SYNs instead of ICMP echo requests; targets are then host:port
    #[arg(long)]
    tcp: bool,

    /// Per-probe timeout in milliseconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// TTL of outgoing probes
    #[arg(long)]
    ttl: Option<u8>,

    /// JSON file with pinger options; command line flags take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(required = true)]
    targets: Vec<String>,
}

impl Args {
    fn config(&self) -> Result<Config> {
        let mut conf = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => Config::default(),
        };
        if let Some(timeout) = self.timeout {
            conf.timeout_ms = timeout;
        }
        if self.ttl.is_some() {
            conf.ttl = self.ttl;
        }
        Ok(conf)
    }
}

fn report(dst: &str, res: Result<Duration, PingError>) {
    match res {
        Ok(rtt) => info!(
            "dst={} status=success rtt={:.3}",
            dst,
            rtt.as_secs_f64() * 1000.0
        ),
        Err(e) => warn!("dst={} status=fail reason={}", dst, e),
    }
}

fn first_ipv4(target: &str, mut addrs: impl Iterator<Item = SocketAddr>) -> Result<SocketAddrV4> {
    addrs
        .find_map(|addr| match addr {
            SocketAddr::V4(addr) => Some(addr),
            SocketAddr::V6(_) => None,
        })
        .with_context(|| format!("{} has no ipv4 address", target))
}

/// Host name or address literal.
fn resolve_host(target: &str) -> Result<Ipv4Addr> {
    let addrs = (target, 0)
        .to_socket_addrs()
        .with_context(|| format!("resolving {}", target))?;
    first_ipv4(target, addrs).map(|addr| *addr.ip())
}

/// `host:port`, host being a name or an address literal.
fn resolve_endpoint(target: &str) -> Result<SocketAddrV4> {
    let addrs = target
        .to_socket_addrs()
        .with_context(|| format!("resolving {}", target))?;
    first_ipv4(target, addrs)
}

async fn run_icmp(conf: &Config, targets: &[String]) -> Result<()> {
    let addrs = targets
        .iter()
        .map(|t| resolve_host(t))
        .collect::<Result<Vec<_>>>()?;
    let pinger = icmp::Pinger::new(conf).context("starting icmp pinger")?;
    let results = futures::future::join_all(addrs.iter().map(|addr| pinger.ping(*addr))).await;
    for (target, res) in targets.iter().zip(results) {
        report(target, res);
    }
    pinger.close().await;
    Ok(())
}

async fn run_tcp(conf: &Config, targets: &[String]) -> Result<()> {
    let addrs = targets
        .iter()
        .map(|t| resolve_endpoint(t))
        .collect::<Result<Vec<_>>>()?;
    let pinger = tcp::Pinger::new(conf).context("starting tcp pinger")?;
    let results = futures::future::join_all(addrs.iter().map(|addr| pinger.ping(*addr))).await;
    for (target, res) in targets.iter().zip(results) {
        report(target, res);
    }
    pinger.close().await;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let conf = args.config()?;
    if args.tcp {
        run_tcp(&conf, &args.targets).await
    } else {
        run_icmp(&conf, &args.targets).await
    }
}

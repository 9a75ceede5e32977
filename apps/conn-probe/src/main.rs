use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use conn_coalesce::{CoalescingEnsurer, ReconnectPolicy, ReconnectionState};
use tokio::signal;
use tracing::{info, warn};

mod probe;
mod telemetry;

use probe::TcpEnsurer;

#[derive(Debug, Clone)]
struct ProbeConfig {
    hosts: Vec<String>,
    connect_timeout: Duration,
    repeat: usize,
    watch: bool,
    policy: ReconnectPolicy,
}

#[derive(Debug, Parser)]
#[command(
    name = "conn-probe",
    author,
    version,
    about = "Ensure named hosts are reachable, coalescing duplicate requests"
)]
struct Cli {
    /// Hosts to ensure, as HOST:PORT. Each one is its own connection name.
    #[arg(required = true)]
    hosts: Vec<String>,

    /// Timeout applied to every TCP connect.
    #[arg(long, env = "CONN_PROBE_TIMEOUT_SECS", default_value_t = 5)]
    timeout_secs: u64,

    /// Concurrent ensure requests issued per host.
    #[arg(long, env = "CONN_PROBE_REPEAT", default_value_t = 1)]
    repeat: usize,

    /// Keep reconnecting unreachable hosts until they recover or give up.
    #[arg(long, env = "CONN_PROBE_WATCH", default_value_t = false)]
    watch: bool,
}

impl TryFrom<Cli> for ProbeConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        for host in &cli.hosts {
            validate_host(host).with_context(|| format!("invalid host: {host}"))?;
        }
        if cli.timeout_secs == 0 {
            bail!("timeout must be greater than zero");
        }
        if cli.repeat == 0 {
            bail!("repeat must be at least one");
        }
        Ok(ProbeConfig {
            hosts: cli.hosts,
            connect_timeout: Duration::from_secs(cli.timeout_secs),
            repeat: cli.repeat,
            watch: cli.watch,
            policy: ReconnectPolicy::from_env(),
        })
    }
}

fn validate_host(host: &str) -> Result<()> {
    let (name, port) = host.rsplit_once(':').context("expected HOST:PORT")?;
    if name.trim().is_empty() {
        bail!("host name is empty");
    }
    port.parse::<u16>()
        .with_context(|| format!("port {port:?} is not a valid port number"))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init()?;

    let cli = Cli::parse();
    let config = ProbeConfig::try_from(cli)?;
    info!(
        hosts = config.hosts.len(),
        repeat = config.repeat,
        timeout_secs = config.connect_timeout.as_secs(),
        watch = config.watch,
        "starting conn-probe"
    );

    run_until(config, async {
        let _ = signal::ctrl_c().await;
    })
    .await
}

/// Run the probe unless `shutdown` resolves first, in which case every host
/// counts as unsettled.
async fn run_until(config: ProbeConfig, shutdown: impl Future<Output = ()>) -> Result<()> {
    let hosts = config.hosts.join(", ");
    tokio::select! {
        biased;
        _ = shutdown => {
            warn!("interrupted");
            bail!("interrupted before all hosts settled: {hosts}")
        }
        result = run(config) => result,
    }
}

async fn run(config: ProbeConfig) -> Result<()> {
    let tcp = Arc::new(TcpEnsurer::new(config.connect_timeout));
    let ensurer = CoalescingEnsurer::new(Arc::clone(&tcp));

    let reports = probe::probe_all(&ensurer, &config.hosts, config.repeat).await;
    let mut unreachable = Vec::new();
    for report in &reports {
        if report.reachable() {
            info!(conn = %report.host, callers = report.callers, "reachable");
        } else if let Err(err) = &report.outcome {
            warn!(conn = %report.host, callers = report.callers, error = %err, "unreachable");
            unreachable.push(report.host.clone());
        }
    }
    info!(
        requests = config.hosts.len() * config.repeat,
        connects = tcp.connects(),
        "probe complete"
    );

    if config.watch && !unreachable.is_empty() {
        let settled = probe::watch_until_settled(&ensurer, &unreachable, &config.policy).await;
        unreachable = settled
            .into_iter()
            .filter(|(_, state)| *state != ReconnectionState::Idle)
            .map(|(host, _)| host)
            .collect();
    }

    if !unreachable.is_empty() {
        bail!("unreachable: {}", unreachable.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ProbeConfig> {
        let cli = Cli::try_parse_from(std::iter::once("conn-probe").chain(args.iter().copied()))?;
        ProbeConfig::try_from(cli)
    }

    #[test_timeout::timeout(secs = 5)]
    fn parses_hosts_and_flags() {
        let config = parse(&["--repeat", "3", "--watch", "db:5432", "[::1]:22"]).unwrap();
        assert_eq!(config.hosts, vec!["db:5432", "[::1]:22"]);
        assert_eq!(config.repeat, 3);
        assert!(config.watch);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test_timeout::timeout(secs = 5)]
    fn rejects_bad_hosts_and_zero_values() {
        assert!(parse(&["db"]).is_err());
        assert!(parse(&[":22"]).is_err());
        assert!(parse(&["db:http"]).is_err());
        assert!(parse(&["--repeat", "0", "db:5432"]).is_err());
        assert!(parse(&["--timeout-secs", "0", "db:5432"]).is_err());
        assert!(parse(&[]).is_err());
    }

    #[test_timeout::tokio_timeout_test(secs = 5)]
    async fn interrupt_reports_unsettled_hosts() {
        let config = parse(&["db:5432", "cache:6379"]).unwrap();
        let err = run_until(config, std::future::ready(())).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "interrupted before all hosts settled: db:5432, cache:6379"
        );
    }
}

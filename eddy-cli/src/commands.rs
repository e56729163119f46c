use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use eddy_config::EddyConfig;
use eddy_kfc::{Kfc, KfcError, KfcPacket, Membership, SchedulerKind};
use tokio::task::JoinSet;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "eddy", version, about)]
pub struct Cli {
    /// Configuration file; defaults to `config/eddy.yaml` plus `EDDY_*` variables
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve a group with an echo handler until Ctrl-C
    Serve(ServeArgs),
    /// Drive a group with concurrent clients and report requests per second
    Bench(BenchArgs),
    /// Print the expanded records of a membership file
    Check(CheckArgs),
}

#[derive(Args, Debug, Clone)]
pub struct GroupArgs {
    /// Membership file; overrides `kfc.membership_file`
    #[arg(short, long)]
    pub membership: Option<PathBuf>,

    #[arg(short, long)]
    pub group: String,

    /// Host names identifying this process; overrides `kfc.local_hosts`
    #[arg(long = "local-host")]
    pub local_hosts: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub group: GroupArgs,

    /// Client patterns to allow, applied in order
    #[arg(long)]
    pub allow: Vec<String>,

    /// Client patterns to deny, applied after every `--allow`
    #[arg(long)]
    pub deny: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct BenchArgs {
    #[command(flatten)]
    pub group: GroupArgs,

    /// Concurrent client agents
    #[arg(long, default_value_t = 4)]
    pub clients: usize,

    /// Payload bytes per request
    #[arg(long, default_value_t = 64)]
    pub size: usize,

    /// round_robin, hashed or response_time; defaults to `kfc.scheduler`
    #[arg(long)]
    pub scheduler: Option<SchedulerKind>,

    #[arg(long, default_value_t = 10)]
    pub seconds: u64,

    /// Per-request timeout; defaults to `kfc.default_timeout_ms`
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct CheckArgs {
    #[arg(short, long)]
    pub membership: PathBuf,

    /// Also resolve every record to a socket address
    #[arg(long)]
    pub resolve: bool,
}

fn open(args: &GroupArgs, mut config: EddyConfig) -> anyhow::Result<Kfc> {
    if let Some(path) = &args.membership {
        config.kfc.membership_file = Some(path.clone());
    }
    if !args.local_hosts.is_empty() {
        config.kfc.local_hosts = args.local_hosts.clone();
    }
    if config.kfc.membership_file.is_none() {
        bail!("no membership file: pass --membership or set kfc.membership_file");
    }
    Ok(Kfc::from_config(&config)?)
}

/// Stops `kfc` and joins its threads off the async runtime.
async fn shutdown(kfc: Arc<Kfc>) -> anyhow::Result<()> {
    kfc.stop();
    tokio::task::spawn_blocking(move || kfc.wait()).await?;
    Ok(())
}

pub async fn serve(args: ServeArgs, config: EddyConfig) -> anyhow::Result<()> {
    let metrics_enabled = config.telemetry.metrics;
    let kfc = Arc::new(open(&args.group, config)?);
    let group = args.group.group.as_str();

    for pattern in &args.allow {
        kfc.allow_client(group, pattern, true)?;
    }
    for pattern in &args.deny {
        kfc.allow_client(group, pattern, false)?;
    }
    let bound = kfc.join_server(group, |request: &KfcPacket| Some(request.payload.clone()))?;
    kfc.start()?;
    info!(group, ?bound, "Serving; Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Draining");
    if metrics_enabled {
        println!("{}", kfc.metrics().gather_metrics()?);
    }
    shutdown(kfc).await
}

#[derive(Debug, Default)]
struct BenchStats {
    ok: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
}

pub async fn bench(args: BenchArgs, config: EddyConfig) -> anyhow::Result<()> {
    let scheduler = match args.scheduler {
        Some(kind) => kind,
        None => config
            .kfc
            .scheduler
            .parse()
            .map_err(anyhow::Error::msg)?,
    };
    let kfc = Arc::new(open(&args.group, config)?);
    kfc.start()?;
    let timeout = args
        .timeout_ms
        .map_or_else(|| kfc.default_timeout(), Duration::from_millis);

    let stats = Arc::new(BenchStats::default());
    let payload = Bytes::from(vec![b'x'; args.size]);
    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut clients = JoinSet::new();
    for _ in 0..args.clients.max(1) {
        let agent = kfc.join_client(&args.group.group)?;
        agent.choice_scheduler(scheduler);
        let stats = Arc::clone(&stats);
        let payload = payload.clone();
        clients.spawn(async move {
            while Instant::now() < deadline {
                let result = match agent.send(payload.clone(), timeout) {
                    Ok(channel) => agent.recv_channel(channel, timeout).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(_) => {
                        stats.ok.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(KfcError::Timeout) => {
                        stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        stats.errors.fetch_add(1, Ordering::Relaxed);
                        debug!(agent = agent.id(), error = %e, "Request failed");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
            agent.leave().await;
        });
    }
    info!(
        clients = args.clients,
        size = args.size,
        %scheduler,
        seconds = args.seconds,
        "Benchmark running"
    );

    let reporter = tokio::spawn(report(Arc::clone(&stats), deadline));
    while let Some(joined) = clients.join_next().await {
        joined?;
    }
    reporter.await?;

    let ok = stats.ok.load(Ordering::Relaxed);
    println!(
        "total: {ok} ok, {} timeouts, {} errors, {:.0} req/s",
        stats.timeouts.load(Ordering::Relaxed),
        stats.errors.load(Ordering::Relaxed),
        ok as f64 / args.seconds.max(1) as f64,
    );
    shutdown(kfc).await
}

/// Prints completed requests per second until `deadline`.
async fn report(stats: Arc<BenchStats>, deadline: Instant) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;
    let mut last = 0;
    while Instant::now() < deadline {
        ticker.tick().await;
        let now = stats.ok.load(Ordering::Relaxed);
        println!(
            "qps: {}  timeouts: {}  errors: {}",
            now - last,
            stats.timeouts.load(Ordering::Relaxed),
            stats.errors.load(Ordering::Relaxed),
        );
        last = now;
    }
}

pub fn check(args: CheckArgs) -> anyhow::Result<()> {
    let membership = Membership::load(&args.membership)
        .with_context(|| format!("reading {}", args.membership.display()))?;
    for member in membership.members() {
        if args.resolve {
            match member.resolve() {
                Ok(addr) => println!("{member} -> {addr}"),
                Err(e) => println!("{member} -> {e}"),
            }
        } else {
            println!("{member}");
        }
    }
    for group in membership.groups() {
        println!(
            "group {group}: {} servers, {} clients",
            membership.servers(group).count(),
            membership.clients(group).count()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bench_arguments_parse() {
        let cli = Cli::try_parse_from([
            "eddy",
            "bench",
            "--membership",
            "members.txt",
            "--group",
            "echo",
            "--clients",
            "8",
            "--scheduler",
            "rt",
            "--local-host",
            "10.0.0.1",
        ])
        .unwrap();
        let Commands::Bench(args) = cli.command else {
            panic!("expected bench");
        };
        assert_eq!(args.clients, 8);
        assert_eq!(args.size, 64);
        assert_eq!(args.scheduler, Some(SchedulerKind::ResponseTime));
        assert_eq!(args.group.local_hosts, vec!["10.0.0.1".to_string()]);
    }

    #[test]
    fn serve_requires_a_group() {
        assert!(Cli::try_parse_from(["eddy", "serve", "--membership", "m.txt"]).is_err());
    }

    #[test]
    fn open_needs_a_membership_file() {
        let args = GroupArgs {
            membership: None,
            group: "echo".into(),
            local_hosts: Vec::new(),
        };
        let err = open(&args, EddyConfig::default()).unwrap_err();
        assert!(err.to_string().contains("no membership file"));
    }
}

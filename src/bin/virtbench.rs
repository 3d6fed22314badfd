use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info};

use virtbench::benches::Registry;
use virtbench::coordinator::Coordinator;
use virtbench::fleet::{AgentAddr, Fleet, FleetConfig};
use virtbench::harness::{BenchConfig, BRINGUP_TIMEOUT, ROUND_TIMEOUT, SETUP_TIMEOUT};
use virtbench::logging::{init_logging, LogConfig};
use virtbench::report::{self, Reporter};
use virtbench::schema::RunMeta;
use virtbench::ConvergenceMode;

#[derive(Parser, Debug)]
#[command(name = "virtbench")]
#[command(about = "Measure OS primitive costs on a fleet of benchmark agents")]
struct Args {
    /// Benchmarks to run; all of them when omitted.
    #[arg(value_name = "BENCHMARK")]
    benchmarks: Vec<String>,

    /// JSON fleet file: {"agents": [{"control": "ADDR", "peer": "ADDR"}]}.
    #[arg(long, value_name = "FILE")]
    fleet: Option<PathBuf>,

    /// Agent as CONTROL[,PEER]. Can be provided multiple times.
    #[arg(long = "agent", value_name = "ADDR", action = clap::ArgAction::Append)]
    agents: Vec<AgentAddr>,

    #[arg(long, value_enum, default_value_t = ConvergenceMode::Exact)]
    mode: ConvergenceMode,

    /// Sample at exactly this repetition count instead of scaling.
    #[arg(long, value_name = "N")]
    runs: Option<u32>,

    /// Append normalized samples to this CSV file.
    #[arg(long, value_name = "FILE")]
    csv: Option<PathBuf>,

    /// Where to write the JSON report. If omitted, prints text results to stdout.
    #[arg(long, value_name = "FILE")]
    out: Option<PathBuf>,

    /// Seed for picking participating agents.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Tag describing the machines under test (e.g. kvm, diskless).
    #[arg(long = "env", default_value = "")]
    environment: String,

    /// Log every round.
    #[arg(long, default_value_t = false)]
    progress: bool,

    /// Run `CMD start|stop BENCHMARK RUNS` around every round, e.g. to drive a profiler.
    #[arg(long, value_name = "CMD")]
    profile_cmd: Option<String>,

    #[arg(long, value_name = "SECS", default_value_t = SETUP_TIMEOUT.as_secs())]
    setup_timeout: u64,

    #[arg(long, value_name = "SECS", default_value_t = ROUND_TIMEOUT.as_secs())]
    round_timeout: u64,

    #[arg(long, value_name = "SECS", default_value_t = BRINGUP_TIMEOUT.as_secs())]
    bringup_timeout: u64,

    /// List benchmarks and exit.
    #[arg(long, default_value_t = false)]
    list: bool,

    /// Log at debug level.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

impl Args {
    fn config(&self) -> BenchConfig {
        BenchConfig {
            mode: self.mode,
            forced_runs: self.runs,
            seed: self.seed,
            setup_timeout: Duration::from_secs(self.setup_timeout),
            round_timeout: Duration::from_secs(self.round_timeout),
            bringup_timeout: Duration::from_secs(self.bringup_timeout),
            environment: self.environment.clone(),
            progress: self.progress,
            profile_cmd: self
                .profile_cmd
                .as_deref()
                .map(|cmd| cmd.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        }
    }

    fn agent_addrs(&self) -> Result<Vec<AgentAddr>> {
        let mut addrs = match &self.fleet {
            Some(path) => FleetConfig::load(path)?.agents,
            None => Vec::new(),
        };
        addrs.extend(self.agents.iter().copied());
        if addrs.is_empty() {
            bail!("no agents: pass --fleet FILE or --agent ADDR");
        }
        Ok(addrs)
    }
}

fn now_utc() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("unix:{secs}")
}

fn list(registry: &Registry) {
    for descriptor in registry.scheduled() {
        println!(
            "{:<16} {:<18} {}",
            descriptor.name,
            descriptor.arity().as_str(),
            descriptor.format.replace("{}", "N")
        );
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    if let Err(e) = init_logging(&LogConfig::from_env(level)) {
        eprintln!("logging: {e:#}");
    }
    if let Err(e) = run(args).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let registry = Registry::builtin();
    if args.list {
        list(&registry);
        return Ok(());
    }

    let cfg = args.config();
    let addrs = args.agent_addrs()?;
    let mut fleet = Fleet::bring_up(&addrs, &cfg)
        .await
        .context("Not all machines came up")?;

    let mut reporter = Reporter::new(args.csv.clone(), args.out.is_none().then(std::io::stdout));
    let mut coordinator = Coordinator::new(&mut fleet, cfg.clone());
    let finished = coordinator
        .run_all(&registry, &args.benchmarks, |run| reporter.emit(run))
        .await;

    if let Some(out) = &args.out {
        let meta = RunMeta {
            schema_version: 1,
            bench_version: env!("CARGO_PKG_VERSION").to_string(),
            mode: cfg.mode.as_str().to_string(),
            forced_runs: cfg.forced_runs,
            seed: cfg.seed,
            environment: cfg.environment.clone(),
            timestamp_utc: now_utc(),
            agents: addrs.iter().map(|a| a.control.to_string()).collect(),
        };
        let json = serde_json::to_string_pretty(&report::run_report(meta, reporter.runs()))?;
        fs::write(out, json).with_context(|| format!("writing {}", out.display()))?;
        info!(path = %out.display(), benchmarks = reporter.runs().len(), "report written");
    }
    finished?;
    Ok(())
}

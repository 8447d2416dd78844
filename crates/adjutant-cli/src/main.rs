use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};

use adjutant_config::Config;
use adjutant_core::adapter::AdapterSet;
use adjutant_core::claims::{CommandReasoner, NoopReasoner, Reasoner};
use adjutant_core::orchestrator::Orchestrator;
use adjutant_core::signals;
use adjutant_core::sync::SyncBridge;
use adjutant_retry::{SharedClock, SystemClock};
use adjutant_types::Stage;
use adjutant_vault::{Vault, missing_stages};
use adjutant_watch::{DirWatch, InboxSource, WatchError, WatcherOptions, WatcherRunner, default_sidecar_dir};

/// Environment variable naming the reasoning-layer command. When unset,
/// claimed notes are accepted without a reasoning pass.
const ENV_REASONER: &str = "ADJUTANT_REASONER";

#[derive(Parser, Debug)]
#[command(name = "adjutant", version)]
#[command(about = "Vault-driven orchestrator for personal autonomous work")]
struct Cli {
    /// Vault root directory (or set VAULT_PATH).
    #[arg(long, global = true)]
    vault: Option<PathBuf>,

    /// Run one cycle, then exit.
    #[arg(long, global = true)]
    once: bool,

    /// No external side-effects; watchers log instead of writing.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Override the component's cycle interval (e.g. 30s, 5m).
    #[arg(long, global = true)]
    interval: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the vault skeleton (stages, singletons, starter config).
    Init,
    /// Run the orchestrator: router, claim loop, embedded scheduler.
    Run {
        /// Dispatch one approved file immediately, then exit.
        #[arg(long)]
        send_now: Option<PathBuf>,
        /// Peer identity override (local|cloud); AGENT_MODE also works.
        #[arg(long)]
        mode: Option<String>,
    },
    /// Run the inbox/file-drop watcher.
    Watch {
        /// Interactive bootstrap for the watcher's source, then exit.
        #[arg(long)]
        setup: bool,
    },
    /// Run the git sync bridge.
    Sync,
    /// Merge peer signals into the dashboard once.
    MergeSignals,
    /// Show per-stage queue depths.
    Status,
    /// Check the environment and vault layout.
    Doctor,
    /// Generate shell completions.
    Completions { shell: clap_complete::Shell },
}

/// Exit codes per the component contract: 0 success, 1 transient failure,
/// 2 configuration error, 3 permanent source error.
fn exit_code_for(error: &anyhow::Error) -> u8 {
    if error.downcast_ref::<ConfigProblem>().is_some() {
        2
    } else if matches!(
        error.downcast_ref::<WatchError>(),
        Some(WatchError::Permanent(_))
    ) {
        3
    } else {
        1
    }
}

#[derive(Debug)]
struct ConfigProblem(String);

impl std::fmt::Display for ConfigProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigProblem {}

fn config_problem(message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(ConfigProblem(message.into()))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[error] {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = &cli.cmd {
        clap_complete::generate(*shell, &mut Cli::command(), "adjutant", &mut std::io::stdout());
        return Ok(());
    }

    let (config, vault_root) = load_config(&cli)?;
    let once = cli.once;
    let interval_overridden = cli.interval.is_some();

    match cli.cmd {
        Commands::Init => cmd_init(&vault_root, &config),
        Commands::Run { send_now, mode } => cmd_run(once, config, &vault_root, send_now, mode),
        Commands::Watch { setup } => {
            cmd_watch(once, interval_overridden, &config, &vault_root, setup)
        }
        Commands::Sync => cmd_sync(once, &config, &vault_root),
        Commands::MergeSignals => cmd_merge_signals(&vault_root),
        Commands::Status => cmd_status(&vault_root),
        Commands::Doctor => cmd_doctor(&config, &vault_root),
        Commands::Completions { .. } => unreachable!("handled above"),
    }
}

/// Resolve configuration: file (at the vault root) < environment < flags.
fn load_config(cli: &Cli) -> Result<(Config, PathBuf)> {
    let flag_root = cli.vault.clone().or_else(|| {
        std::env::var(adjutant_config::ENV_VAULT_PATH)
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    });

    let config_dir = flag_root
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let mut config =
        Config::load(&config_dir).map_err(|e| config_problem(format!("{e:#}")))?;
    config.apply_env().map_err(|e| config_problem(format!("{e:#}")))?;

    if let Some(root) = flag_root {
        config.vault.path = Some(root);
    }
    if cli.dry_run {
        config.vault.dry_run = true;
    }
    if let Some(interval) = &cli.interval {
        let parsed = humantime::parse_duration(interval)
            .map_err(|e| config_problem(format!("bad --interval '{interval}': {e}")))?;
        config.watch.poll_interval = parsed;
        config.watch.source_interval = parsed;
        config.sync.interval = parsed;
    }

    let root = config
        .vault_path()
        .map(Path::to_path_buf)
        .ok_or_else(|| config_problem("no vault: pass --vault <path> or set VAULT_PATH"))?;
    Ok((config, root))
}

fn open_vault(root: &Path, actor: &str) -> Result<Vault> {
    Vault::open(root, actor).map_err(|e| {
        config_problem(format!("cannot open vault at {}: {e}", root.display()))
    })
}

fn clock() -> SharedClock {
    Arc::new(SystemClock::new())
}

/// Flag flipped by the first Ctrl-C; the second one exits immediately.
fn install_shutdown_handler(grace: Duration) -> Result<Arc<AtomicBool>> {
    let cancel = Arc::new(AtomicBool::new(false));
    let handler_cancel = cancel.clone();
    let signals_seen = AtomicUsize::new(0);
    ctrlc::set_handler(move || {
        if signals_seen.fetch_add(1, Ordering::SeqCst) > 0 {
            std::process::exit(1);
        }
        eprintln!("[info] shutting down; in-flight dispatches get {grace:?}");
        handler_cancel.store(true, Ordering::SeqCst);
        // Abandon whatever outlives the grace window; undispatched files
        // stay in Approved/ for the next start.
        let _ = std::thread::spawn(move || {
            std::thread::sleep(grace);
            std::process::exit(0);
        });
    })
    .context("failed to install signal handler")?;
    Ok(cancel)
}

fn cmd_init(root: &Path, config: &Config) -> Result<()> {
    let vault = Vault::init(root, "init").map_err(|e| config_problem(format!("{e}")))?;

    let config_path = adjutant_config::config_path(root);
    if !config_path.exists() {
        std::fs::write(&config_path, config.to_toml()?)
            .with_context(|| format!("failed to write {}", config_path.display()))?;
    }

    let gitignore = root.join(".gitignore");
    if !gitignore.exists() {
        std::fs::write(&gitignore, "Dashboard.md\n.env\n.sessions/\n")
            .with_context(|| format!("failed to write {}", gitignore.display()))?;
    }

    println!("initialized vault at {}", vault.root().display());
    println!("stages: {}", Stage::all().map(|s| s.to_string()).join(", "));
    Ok(())
}

fn cmd_run(
    once: bool,
    mut config: Config,
    root: &Path,
    send_now: Option<PathBuf>,
    mode: Option<String>,
) -> Result<()> {
    if let Some(mode) = mode {
        config.agent.mode = mode
            .parse()
            .map_err(|e: String| config_problem(format!("--mode: {e}")))?;
    }

    let vault = open_vault(root, &format!("orchestrator-{}", config.agent.mode))?;
    let reasoner: Box<dyn Reasoner> = match std::env::var(ENV_REASONER) {
        Ok(program) if !program.is_empty() => Box::new(CommandReasoner::new(program, Vec::new())),
        _ => Box::new(NoopReasoner),
    };
    let mut orchestrator = Orchestrator::new(
        &vault,
        &config,
        AdapterSet::null_transports(),
        reasoner,
        clock(),
    )?;

    if let Some(file) = send_now {
        match orchestrator.router().send_now(&file)? {
            Some(outcome) => println!("{}: {outcome}", file.display()),
            None => println!("{}: already in Done/, nothing to do", file.display()),
        }
        return Ok(());
    }

    if once {
        let stats = orchestrator.run_once()?;
        println!(
            "observed {} file(s): {} sent, {} deferred, {} rejected, {} quarantined",
            stats.observed, stats.sent, stats.deferred, stats.rejected, stats.quarantined
        );
        return Ok(());
    }

    let cancel = install_shutdown_handler(config.policy.shutdown_grace)?;
    eprintln!(
        "[info] orchestrator ({}) watching {}",
        config.agent.mode,
        vault.stage_dir(Stage::Approved).display()
    );
    orchestrator.run(&cancel)
}

fn cmd_watch(
    once: bool,
    interval_overridden: bool,
    config: &Config,
    root: &Path,
    setup: bool,
) -> Result<()> {
    let vault = open_vault(root, "watcher-files")?;
    let sidecar_dir = config
        .watch
        .sidecar_dir
        .clone()
        .or_else(default_sidecar_dir)
        .unwrap_or_else(|| root.join(".sessions"));

    let mut options = WatcherOptions::new(sidecar_dir);
    options.dry_run = config.vault.dry_run;
    options.backoff = config.retry.backoff.clone();
    options.breaker = config.retry.breaker.clone();
    if interval_overridden {
        options.interval = Some(config.watch.source_interval);
    }

    let source = InboxSource::new(&vault);
    let mut runner = WatcherRunner::new(&vault, Box::new(source), clock(), options)?;

    if setup {
        runner.setup()?;
        println!("watcher '{}' is ready", runner.source_name());
        return Ok(());
    }

    if once {
        let stats = runner.run_once()?;
        println!(
            "polled {} item(s): {} emitted, {} duplicate(s)",
            stats.polled, stats.emitted, stats.duplicates
        );
        return Ok(());
    }

    let cancel = install_shutdown_handler(Duration::from_secs(2))?;
    let watch = DirWatch::new(&vault.stage_dir(Stage::Inbox), runner.interval());
    eprintln!(
        "[info] watching {} ({})",
        vault.stage_dir(Stage::Inbox).display(),
        if watch.is_native() { "native events" } else { "polling" }
    );
    runner.run_loop(&cancel, Some(&watch))?;
    Ok(())
}

fn cmd_sync(once: bool, config: &Config, root: &Path) -> Result<()> {
    let vault = open_vault(root, "sync-bridge")?;
    let branch = config
        .sync
        .branch
        .clone()
        .unwrap_or_else(|| "main".to_string());
    let bridge = SyncBridge::new(&vault, config.sync.remote.clone(), branch);

    if !bridge.is_repo() {
        return Err(config_problem(format!(
            "vault at {} is not a git clone; peered sync needs one",
            root.display()
        )));
    }

    if once {
        let outcome = bridge.cycle()?;
        println!("{}", outcome.summary());
        return Ok(());
    }

    let cancel = install_shutdown_handler(Duration::from_secs(2))?;
    while !cancel.load(Ordering::Relaxed) {
        let outcome = bridge.cycle()?;
        eprintln!("[info] {}", outcome.summary());
        let mut remaining = config.sync.interval;
        let slice = Duration::from_millis(500);
        while !remaining.is_zero() && !cancel.load(Ordering::Relaxed) {
            let step = remaining.min(slice);
            std::thread::sleep(step);
            remaining -= step;
        }
    }
    Ok(())
}

fn cmd_merge_signals(root: &Path) -> Result<()> {
    let vault = open_vault(root, "signal-merge")?;
    let summary = signals::merge_signals(&vault)?;
    signals::refresh_stage_counts(&vault)?;
    println!("{summary}");
    Ok(())
}

fn cmd_status(root: &Path) -> Result<()> {
    let vault = open_vault(root, "status")?;
    println!("vault: {}", vault.root().display());
    println!();
    for stage in Stage::all() {
        if matches!(stage, Stage::Logs) {
            continue;
        }
        let refs = vault.list(stage)?;
        println!("{:>4}  {}", refs.len(), stage);
    }
    let dates = vault.log().available_dates()?;
    if let Some(latest) = dates.last() {
        println!();
        println!("log days: {} (latest {latest})", dates.len());
    }
    Ok(())
}

fn cmd_doctor(config: &Config, root: &Path) -> Result<()> {
    println!("vault: {}", root.display());
    if !root.is_dir() {
        return Err(config_problem(format!(
            "vault root {} does not exist (run `adjutant init`)",
            root.display()
        )));
    }

    let missing = missing_stages(root);
    if missing.is_empty() {
        println!("layout: complete");
    } else {
        let names: Vec<String> = missing.iter().map(|s| s.to_string()).collect();
        println!("layout: missing {}", names.join(", "));
    }

    let config_path = adjutant_config::config_path(root);
    println!(
        "config: {}",
        if config_path.exists() {
            format!("{}", config_path.display())
        } else {
            "defaults (no .adjutant.toml)".to_string()
        }
    );

    let logs_probe = root.join(Stage::Logs.rel_path()).join(".doctor.tmp");
    let log_writable = std::fs::write(&logs_probe, "probe")
        .map(|()| {
            let _ = std::fs::remove_file(&logs_probe);
        })
        .is_ok();
    println!("log dir writable: {log_writable}");

    let vault = open_vault(root, "doctor")?;
    let bridge = SyncBridge::new(
        &vault,
        config.sync.remote.clone(),
        config.sync.branch.clone().unwrap_or_else(|| "main".to_string()),
    );
    println!(
        "git: {}",
        if bridge.is_repo() {
            "repository detected (peered sync available)"
        } else {
            "not a repository (single-peer mode)"
        }
    );

    println!("agent mode: {}", config.agent.mode);
    for var in [
        adjutant_config::ENV_VAULT_PATH,
        adjutant_config::ENV_AGENT_MODE,
        adjutant_config::ENV_DRY_RUN,
        adjutant_config::ENV_GIT_BRANCH,
        ENV_REASONER,
    ] {
        let state = match std::env::var(var) {
            Ok(v) if !v.is_empty() => "set",
            _ => "unset",
        };
        println!("env {var}: {state}");
    }

    if std::io::stdout().is_terminal() {
        println!();
        println!("all checks ran; fix anything marked missing or unwritable");
    }
    Ok(())
}

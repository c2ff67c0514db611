use anyhow::{bail, Context, Result};
use follow_cycle::clock::{Clock, SystemClock};
use follow_cycle::config::{Config, ConfigWatcher};
use follow_cycle::device::adb::AdbBridge;
use follow_cycle::device::sim::{SimDevice, SimScript};
use follow_cycle::device::DeviceBridge;
use follow_cycle::engine::governor::{self, SharedGovernor};
use follow_cycle::engine::RateGovernor;
use follow_cycle::execution::ActionExecutor;
use follow_cycle::report;
use follow_cycle::scheduler::{RunControl, TaskRun, TaskScheduler, TaskStatus};
use follow_cycle::store::{ActionKind, Store};
use follow_cycle::tui::{
    self,
    state::{ActionLine, AppState, TaskLine},
    TuiCommand,
};
use follow_cycle::vision::{ControlLocator, TemplateSet, VisionMatcher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const LOG_FILE: &str = "follow-cycle.log";
const DEFAULT_CONFIG: &str = "follow-cycle.toml";
const RECENT_ACTIONS: u32 = 30;
/// Handles seeded into an empty simulation store.
const SIM_DEMO_TARGETS: usize = 40;

#[derive(Debug, Default)]
struct Args {
    simulate: bool,
    headless: bool,
    status: bool,
    import: Option<PathBuf>,
    export: Option<PathBuf>,
    config: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--simulate" => args.simulate = true,
            "--headless" => args.headless = true,
            "--status" => args.status = true,
            "--import" => {
                let path = it.next().context("--import needs a file argument")?;
                args.import = Some(PathBuf::from(path));
            }
            "--export" => {
                let path = it.next().context("--export needs a file argument")?;
                args.export = Some(PathBuf::from(path));
            }
            "--config" => {
                let path = it.next().context("--config needs a file argument")?;
                args.config = Some(PathBuf::from(path));
            }
            other => bail!(
                "unknown argument {:?}\nusage: follow-cycle [--simulate] [--headless] [--config FILE] [--import FILE] [--export FILE] [--status]",
                other
            ),
        }
    }
    Ok(args)
}

fn init_logging(to_stdout: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("follow_cycle=info"));
    if to_stdout {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(LOG_FILE)
            .with_context(|| format!("Failed to open {}", LOG_FILE))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(log_file)
            .init();
    }
    Ok(())
}

/// An explicit `--config` must exist; the default file is optional.
fn load_config(args: &Args) -> Result<(Config, PathBuf)> {
    match &args.config {
        Some(path) => Ok((Config::load(path)?, path.clone())),
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG);
            if path.exists() {
                Ok((Config::load(&path)?, path))
            } else {
                tracing::info!("no {} found, using built-in defaults", DEFAULT_CONFIG);
                Ok((Config::default(), path))
            }
        }
    }
}

fn store_path(config: &Config, simulate: bool) -> PathBuf {
    let path = PathBuf::from(&config.store.path);
    if simulate {
        path.with_extension("sim.db")
    } else {
        path
    }
}

fn import_file(store: &Store, path: &Path, clock: &dyn Clock) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let added = store.import_lines(&content, clock.now())?;
    println!(
        "imported {} new target(s) from {} ({} line(s))",
        added,
        path.display(),
        content.lines().count()
    );
    Ok(())
}

fn export_file(store: &Store, path: &Path) -> Result<()> {
    let history = report::export(store)?;
    let json = serde_json::to_string_pretty(&history)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("exported {} target(s) to {}", history.len(), path.display());
    Ok(())
}

fn print_status(store: &Store, config: &Config, clock: &dyn Clock) -> Result<()> {
    let now = clock.now();
    let governor = restore_governor(store, config, now)?;
    let quotas: Vec<_> = [ActionKind::Follow, ActionKind::Unfollow]
        .into_iter()
        .map(|k| governor::lock(&governor).window(k, now))
        .collect();
    let targets: Vec<_> = store
        .state_counts()?
        .into_iter()
        .map(|(state, count)| serde_json::json!({ "state": state.as_str(), "count": count }))
        .collect();
    let status = serde_json::json!({
        "at": now,
        "targets": targets,
        "tasks": store.load_tasks()?,
        "quotas": quotas,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Governor seeded with the last day of grants, so caps hold across restarts.
fn restore_governor(
    store: &Store,
    config: &Config,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<SharedGovernor> {
    let horizon = now - chrono::Duration::hours(24);
    let mut governor = RateGovernor::new(config.limits.clone(), config.local_offset())?;
    governor.restore(store.grants_since(horizon)?);
    Ok(Arc::new(Mutex::new(governor)))
}

fn build_device(
    config: &Config,
    simulate: bool,
) -> Result<(Box<dyn DeviceBridge>, Arc<dyn ControlLocator>)> {
    if simulate {
        let script = SimScript {
            follow_back_probability: 0.35,
            ..SimScript::default()
        };
        let (device, locator) = SimDevice::new(script, rand::random());
        return Ok((Box::new(device), Arc::new(locator)));
    }
    let templates = TemplateSet::load(Path::new(&config.vision.templates_dir))
        .context("Failed to load control templates")?;
    tracing::info!(count = templates.len(), dir = %config.vision.templates_dir, "templates loaded");
    let matcher = VisionMatcher::new(templates, &config.vision);
    Ok((Box::new(AdbBridge::new(&config.device)), Arc::new(matcher)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;
    init_logging(args.headless)?;

    let (config, config_path) = load_config(&args)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let db_path = store_path(&config, args.simulate);
    let store = Arc::new(
        Store::open(&db_path).with_context(|| format!("Failed to open store {}", db_path.display()))?,
    );

    if let Some(path) = &args.import {
        return import_file(&store, path, clock.as_ref());
    }
    if let Some(path) = &args.export {
        return export_file(&store, path);
    }
    if args.status {
        return print_status(&store, &config, clock.as_ref());
    }

    if args.simulate && store.state_counts()?.iter().all(|(_, n)| *n == 0) {
        let demo: Vec<String> = (1..=SIM_DEMO_TARGETS).map(|i| format!("sim_user_{:02}", i)).collect();
        store.import_targets(&demo, clock.now())?;
    }

    let governor = restore_governor(&store, &config, clock.now())?;
    let pruned = store.prune_grants(clock.now() - chrono::Duration::hours(24))?;
    tracing::debug!(pruned, "old quota grants pruned");
    let (bridge, locator) = build_device(&config, args.simulate)?;
    let executor = ActionExecutor::new(
        bridge,
        locator,
        governor.clone(),
        store.clone(),
        clock.clone(),
        &config,
    );
    let control = RunControl::new();
    let scheduler = TaskScheduler::new(
        executor,
        governor,
        store.clone(),
        clock.clone(),
        control.clone(),
        config,
    )?
    .with_watcher(ConfigWatcher::new(&config_path));

    // Channels
    let (state_tx, state_rx) = watch::channel(AppState::new(args.simulate));
    let (cmd_tx, cmd_rx) = mpsc::channel::<TuiCommand>(16);
    let (manual_tx, manual_rx) = mpsc::channel::<TuiCommand>(16);

    tokio::spawn(route_commands(cmd_rx, control.clone(), manual_tx, state_tx.clone()));
    let engine = tokio::spawn(run_engine(scheduler, store, manual_rx, state_tx));

    if args.headless {
        tracing::info!(simulate = args.simulate, "running headless, ctrl-c to stop");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = control.stopped() => {}
        }
    } else {
        tui::run_tui(state_rx, cmd_tx).await?;
    }

    tracing::info!("stopping after the current action");
    control.stop();
    engine.await.context("engine task panicked")?;
    tracing::debug!("shutting down");
    Ok(())
}

/// Pause, resume and quit take effect right away, even mid-batch; everything
/// else is queued for the engine loop.
async fn route_commands(
    mut cmd_rx: mpsc::Receiver<TuiCommand>,
    control: RunControl,
    manual_tx: mpsc::Sender<TuiCommand>,
    state_tx: watch::Sender<AppState>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            TuiCommand::Pause => {
                control.pause();
                state_tx.send_modify(|s| s.push_log("INFO", "paused after the current action".into()));
            }
            TuiCommand::Resume => {
                control.resume();
                state_tx.send_modify(|s| s.push_log("INFO", "resumed".into()));
            }
            TuiCommand::Quit => {
                control.stop();
                return;
            }
            other => {
                if manual_tx.send(other).await.is_err() {
                    return;
                }
            }
        }
        state_tx.send_modify(|s| s.run_state = control.state());
    }
}

async fn run_engine(
    mut scheduler: TaskScheduler,
    store: Arc<Store>,
    mut manual_rx: mpsc::Receiver<TuiCommand>,
    state_tx: watch::Sender<AppState>,
) {
    let control = scheduler.control().clone();
    if let Err(e) = scheduler.start().await {
        tracing::error!(error = %e, "startup failed");
        state_tx.send_modify(|s| s.push_log("ERROR", format!("startup failed: {}", e)));
        control.stop();
        return;
    }
    publish(&scheduler, &store, &[], &state_tx).await;

    let mut tick_seconds = scheduler.config().schedule.tick_seconds.max(1);
    let mut interval = tokio::time::interval(Duration::from_secs(tick_seconds));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = control.stopped() => break,
            _ = interval.tick() => {
                let runs = scheduler.tick().await;
                publish(&scheduler, &store, &runs, &state_tx).await;
            }
            Some(cmd) = manual_rx.recv() => {
                let result = match &cmd {
                    TuiCommand::RunNow(name) => scheduler.run_now(name).await.map(|run| vec![run]),
                    TuiCommand::ToggleTask(name) => {
                        let enabled = scheduler
                            .tasks()
                            .iter()
                            .find(|t| t.kind.name() == name)
                            .is_some_and(|t| t.enabled);
                        scheduler.set_enabled(name, !enabled).map(|_| Vec::new())
                    }
                    _ => Ok(Vec::new()),
                };
                match result {
                    Ok(runs) => publish(&scheduler, &store, &runs, &state_tx).await,
                    Err(e) => {
                        tracing::warn!(command = ?cmd, error = %e, "command failed");
                        state_tx.send_modify(|s| s.push_log("WARN", format!("{:?}: {}", cmd, e)));
                    }
                }
            }
        }

        let wanted = scheduler.config().schedule.tick_seconds.max(1);
        if wanted != tick_seconds {
            tick_seconds = wanted;
            interval = tokio::time::interval(Duration::from_secs(tick_seconds));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        }
    }
    tracing::info!("engine stopped");
}

/// Refresh the TUI snapshot. Store reads only; the device lock is taken
/// briefly for the attached device description.
async fn publish(
    scheduler: &TaskScheduler,
    store: &Store,
    runs: &[TaskRun],
    state_tx: &watch::Sender<AppState>,
) {
    let offset = scheduler.config().local_offset();
    let fmt_time = |t: chrono::DateTime<chrono::Utc>| t.with_timezone(&offset).format("%H:%M:%S").to_string();
    let now = chrono::Utc::now();

    let tasks: Vec<TaskLine> = scheduler
        .tasks()
        .iter()
        .map(|t| TaskLine {
            name: t.kind.name().to_string(),
            cadence: t.cadence.to_string(),
            enabled: t.enabled,
            last_run: t.last_run.map(fmt_time),
            next_eligible: fmt_time(t.next_eligible),
            status: t.last_status.clone(),
            error: t.last_error.clone(),
        })
        .collect();

    let actions: Vec<ActionLine> = match store.recent_actions(RECENT_ACTIONS) {
        Ok(records) => records
            .into_iter()
            .map(|a| {
                let handle = store
                    .target_by_id(a.target_id)
                    .ok()
                    .flatten()
                    .map(|t| t.handle)
                    .unwrap_or_else(|| format!("#{}", a.target_id));
                ActionLine {
                    time: fmt_time(a.at),
                    kind: a.kind.to_string(),
                    handle,
                    outcome: a.outcome,
                    latency_ms: a.latency_ms,
                    detail: a.detail,
                }
            })
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "recent actions unavailable");
            Vec::new()
        }
    };
    let targets = store.state_counts().unwrap_or_default();
    let quotas: Vec<_> = {
        let shared = scheduler.governor();
        let gov = governor::lock(&shared);
        [ActionKind::Follow, ActionKind::Unfollow]
            .into_iter()
            .map(|k| gov.window(k, now))
            .collect()
    };
    let device = scheduler
        .executor()
        .lock()
        .await
        .device()
        .map(|d| format!("{} {}x{}", d.serial, d.width, d.height));

    state_tx.send_modify(|s| {
        s.run_state = scheduler.control().state();
        s.device = device;
        s.suspended = scheduler.suspension().map(|x| x.reason.clone());
        s.tasks = tasks;
        s.actions = actions;
        s.targets = targets;
        s.quotas = quotas;
        s.warnings = scheduler
            .last_health()
            .map(|h| h.warnings.clone())
            .unwrap_or_default();
        for run in runs {
            let level = match run.status {
                TaskStatus::Ok(_) => "TASK",
                TaskStatus::Deferred { .. } | TaskStatus::Skipped(_) => "WARN",
                TaskStatus::Failed(_) => "ERROR",
            };
            let manual = if run.manual { " (manual)" } else { "" };
            s.push_log(level, format!("{}{}: {}", run.kind, manual, run.status.label()));
        }
    });
}

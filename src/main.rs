//! PlanRunner CLI Entry Point
//!
//! Compiles a pipeline definition, runs it to completion and saves the
//! execution state for later inspection.
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline
//! planrunner pipeline.yaml
//!
//! # Pause while the flag file exists
//! planrunner pipeline.yaml --pause-flag /tmp/pause.flag
//!
//! # Compile only
//! planrunner pipeline.yaml --dry-run
//!
//! # Inspect a finished run
//! planrunner --show <PLAN_EXECUTION_ID> --fields identifier,status
//! ```

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use colored::{ColoredString, Colorize};
use log::{error, info, warn};
use tokio::signal;

use planrunner::ambiance::{TriggerInfo, TriggerType};
use planrunner::execution::{InMemoryStore, InterruptType, NodeExecutionStore, PlanExecution};
use planrunner::orchestration::TimelineListener;
use planrunner::{
    load_definition, Engine, EngineConfig, ExecutionSnapshot, InterruptRequest,
    NodeExecutionQuery, Plan, PlanCreator, Projection, Status, StepRegistry, APP_NAME, VERSION,
};

/// Default definition file used when none is specified.
const DEFAULT_DEFINITION: &str = "pipeline.yaml";

/// Interval for checking the pause flag and plan status.
const MONITOR_INTERVAL: Duration = Duration::from_millis(200);

/// Command-line options parsed from arguments.
#[derive(Debug, Default)]
struct Options {
    definition_path: Option<String>,
    config_path: Option<PathBuf>,
    workers: Option<usize>,
    pause_flag_path: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    show: Option<String>,
    fields: Option<Vec<String>>,
    dry_run: bool,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Pipeline Orchestration Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: planrunner [OPTIONS] <DEFINITION_FILE>");
    println!("       planrunner --show <PLAN_EXECUTION_ID> [--fields a,b] [--state-dir DIR]");
    println!();
    println!("Arguments:");
    println!("  <DEFINITION_FILE>    Pipeline definition (YAML or JSON)");
    println!();
    println!("Options:");
    println!("  --config PATH        Engine config file (YAML)");
    println!("  --workers N          Worker loops (default: CPU count)");
    println!("  --pause-flag PATH    Pause while this file exists");
    println!("  --state-dir DIR      Where execution state is saved");
    println!("  --show ID            Print the saved node executions of a run");
    println!("  --fields a,b         Fields to print with --show");
    println!("  --dry-run            Compile the definition without running it");
    println!("  --verbose            Enable debug logging");
    println!("  --help               Show this help message");
    println!("  --version            Show version information");
    println!();
    println!("Examples:");
    println!("  planrunner pipeline.yaml");
    println!("  planrunner pipeline.yaml --workers 8 --pause-flag /tmp/pause.flag");
    println!("  planrunner --show 3f2c... --fields identifier,status,retry_ids");
}

fn next_value<'a>(args: &'a [String], i: &mut usize, option: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", option))
}

/// Parses command-line arguments into Options.
fn parse_arguments(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = args[i].as_str();

        match arg {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => options.dry_run = true,
            "--verbose" | "-v" => options.verbose = true,
            "--config" => {
                options.config_path = Some(PathBuf::from(next_value(args, &mut i, arg)?));
            }
            "--workers" => {
                let value = next_value(args, &mut i, arg)?;
                let workers: usize = value
                    .parse()
                    .map_err(|_| format!("Invalid workers value: {}", value))?;
                if workers == 0 {
                    return Err("--workers must be at least 1".to_string());
                }
                options.workers = Some(workers);
            }
            "--pause-flag" => {
                options.pause_flag_path = Some(PathBuf::from(next_value(args, &mut i, arg)?));
            }
            "--state-dir" => {
                options.state_dir = Some(PathBuf::from(next_value(args, &mut i, arg)?));
            }
            "--show" => options.show = Some(next_value(args, &mut i, arg)?.to_string()),
            "--fields" => {
                let fields = next_value(args, &mut i, arg)?
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(String::from)
                    .collect();
                options.fields = Some(fields);
            }
            other if other.starts_with('-') => {
                return Err(format!("Unknown option: {}", other));
            }
            other => {
                if options.definition_path.is_some() {
                    return Err(format!("Unexpected argument: {}", other));
                }
                options.definition_path = Some(other.to_string());
            }
        }
        i += 1;
    }

    Ok(options)
}

/// Loads the engine config and applies command-line overrides.
fn load_config(options: &Options) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = match &options.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_or_default()?,
    };

    if let Some(workers) = options.workers {
        config.workers = workers;
    }
    if let Some(dir) = &options.state_dir {
        config.state_dir = dir.clone();
    }
    Ok(config)
}

fn colored_status(status: Status) -> ColoredString {
    let text = status.to_string();
    match status {
        Status::Succeeded => text.green(),
        Status::Failed | Status::Aborted | Status::Expired => text.red(),
        Status::IgnoreFailed | Status::Skipped => text.yellow(),
        _ => text.cyan(),
    }
}

/// Prints the compiled plan for `--dry-run`.
fn print_plan(plan: &Plan) {
    println!("Plan '{}': {} nodes", plan.name.bold(), plan.len());

    let mut stack = vec![(plan.start_node_id.as_str(), 0usize)];
    while let Some((id, depth)) = stack.pop() {
        let Some(node) = plan.node(id) else {
            continue;
        };
        println!(
            "{}{} [{}] {}",
            "  ".repeat(depth + 1),
            node.identifier,
            node.step_type,
            node.facilitation.to_string().dimmed()
        );
        for child in node.children.iter().rev() {
            stack.push((child.as_str(), depth + 1));
        }
    }
}

/// Prints every node execution of a run with its status.
fn print_summary(store: &dyn NodeExecutionStore, execution: &PlanExecution) {
    let mut records = store.find(&NodeExecutionQuery::for_plan(&execution.uuid));
    records.sort_by_key(|r| (r.start_ts, r.depth()));

    println!();
    println!(
        "Plan execution {} finished: {}",
        execution.uuid,
        colored_status(execution.status).bold()
    );
    for record in &records {
        let mut line = format!(
            "{}{:<24} {}",
            "  ".repeat(record.depth()),
            record.identifier,
            colored_status(record.status)
        );
        if let Some(failure) = &record.failure_info {
            line.push_str(&format!("  {}", failure.to_string().dimmed()));
        }
        println!("{}", line);
    }
}

/// Prints a saved run for `--show`.
fn show(options: &Options, id: &str) -> Result<bool, Box<dyn std::error::Error>> {
    let config = load_config(options)?;
    let snapshot = ExecutionSnapshot::load(&config.state_dir, id)?;

    let store = InMemoryStore::new();
    snapshot.restore_into(&store)?;
    let execution = store.plan_execution(id)?;

    let projection = match &options.fields {
        Some(fields) => Projection::fields(fields),
        None => Projection::all(),
    };
    let rows = store.query(&NodeExecutionQuery::for_plan(id), &projection);

    println!(
        "Plan execution {} ({}): {}",
        execution.uuid,
        execution.name,
        colored_status(execution.status)
    );
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(true)
}

/// Registers a plan-level interrupt, logging instead of failing.
fn interrupt(engine: &Engine, kind: InterruptType, plan_execution_id: &str) {
    if let Err(e) = engine.register_interrupt(InterruptRequest::plan(kind, plan_execution_id)) {
        warn!("Could not {}: {}", kind, e);
    }
}

/// Runs worker loops and the sweeper until the plan execution is terminal.
///
/// The pause flag maps to PAUSE / RESUME interrupts and Ctrl-C to ABORT.
async fn drive(
    engine: Engine,
    plan_execution_id: String,
    pause_flag_path: Option<PathBuf>,
) -> Result<PlanExecution, Box<dyn std::error::Error>> {
    let stop = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();
    for _ in 0..engine.config().workers {
        let engine = engine.clone();
        let stop = Arc::clone(&stop);
        handles.push(tokio::task::spawn_blocking(move || engine.consume(&stop)));
    }
    let sweeper = {
        let engine = engine.clone();
        let stop = Arc::clone(&stop);
        tokio::task::spawn_blocking(move || engine.run_sweeper(&stop))
    };
    info!("Started {} worker(s)", handles.len());

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut aborting = false;
    let mut paused = false;
    let mut ticker = tokio::time::interval(MONITOR_INTERVAL);

    let execution = loop {
        tokio::select! {
            result = &mut ctrl_c, if !aborting => {
                if let Err(e) = result {
                    warn!("Ctrl-C handler failed: {}", e);
                }
                warn!("Interrupted - aborting plan execution");
                aborting = true;
                interrupt(&engine, InterruptType::Abort, &plan_execution_id);
            }
            _ = ticker.tick() => {
                let execution = engine.plan_execution(&plan_execution_id)?;
                if execution.is_terminal() {
                    break execution;
                }

                if let Some(path) = &pause_flag_path {
                    let flagged = path.exists();
                    if flagged && !paused {
                        info!("Pause flag found - pausing");
                        interrupt(&engine, InterruptType::Pause, &plan_execution_id);
                    } else if !flagged && paused {
                        info!("Pause flag removed - resuming");
                        interrupt(&engine, InterruptType::Resume, &plan_execution_id);
                    }
                    paused = flagged;
                }
            }
        }
    };

    stop.store(true, Ordering::SeqCst);
    let mut handled = 0;
    for handle in handles {
        handled += handle.await?;
    }
    sweeper.await?;
    info!("Workers handled {} message(s)", handled);

    Ok(execution)
}

fn trigger() -> TriggerInfo {
    TriggerInfo {
        trigger_type: TriggerType::Manual,
        triggered_by: env::var("USER").unwrap_or_else(|_| "cli".to_string()),
    }
}

/// Compiles and runs a definition. Returns whether the run succeeded.
fn execute(options: &Options, path: &Path) -> Result<bool, Box<dyn std::error::Error>> {
    let config = load_config(options)?;

    info!("Loading definition: {}", path.display());
    let definition = load_definition(path).map_err(|e| {
        error!("Failed to load definition: {}", e);
        format!("Could not load definition from '{}': {}", path.display(), e)
    })?;

    let steps = StepRegistry::with_builtins();
    let plan = PlanCreator::standard(steps.clone()).compile(&definition)?;
    info!("Plan compiled: {} nodes", plan.len());

    if options.dry_run {
        print_plan(&plan);
        return Ok(true);
    }

    let timeline = Arc::new(TimelineListener::new());
    let state_dir = config.state_dir.clone();
    let engine = Engine::builder()
        .with_config(config)
        .with_steps(steps)
        .with_listener(timeline.clone())
        .build();

    let plan_execution_id = engine.start_plan(plan, BTreeMap::new(), trigger())?;
    info!("Started plan execution {}", plan_execution_id);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let execution = runtime.block_on(drive(
        engine.clone(),
        plan_execution_id.clone(),
        options.pause_flag_path.clone(),
    ))?;

    print_summary(engine.store().as_ref(), &execution);
    println!("{}", timeline.gantt_chart());

    let snapshot = ExecutionSnapshot::capture(engine.store().as_ref(), &plan_execution_id)?;
    let saved = snapshot.save(&state_dir)?;
    println!(
        "Inspect with: planrunner --show {} --state-dir {}",
        plan_execution_id,
        state_dir.display()
    );
    info!("State saved to {}", saved.display());

    Ok(execution.status.is_positive())
}

/// Main application entry point.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let options = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(options.verbose);

    if let Some(id) = &options.show {
        return show(&options, id);
    }

    print_banner();
    if let Some(path) = &options.pause_flag_path {
        info!("Pause control: {}", path.display());
    }
    if options.dry_run {
        info!("Mode: DRY RUN (the plan will not run)");
        println!();
    }

    let path = options
        .definition_path
        .clone()
        .unwrap_or_else(|| DEFAULT_DEFINITION.to_string());
    execute(&options, Path::new(&path))
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

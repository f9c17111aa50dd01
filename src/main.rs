// fanout CLI: run one module against every host matching a pattern

use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::*;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use fanout::config::RunnerConfig;
use fanout::executor::args::parse_kv;
use fanout::executor::{RunContext, RunLocks, RunResults, Runner, TaskSpec};
use fanout::inventory::Inventory;
use fanout::output::{OutputFormat, RunnerError, TerminalCallback};
use fanout::plugins::{AggregateStats, CallbackManager, JsonLogCallback};
use fanout::value::{from_object, VarMap};

#[derive(Parser)]
#[command(
    name = "fanout",
    about = "Run a module against many hosts at once",
    version,
    disable_colored_help = true
)]
struct Cli {
    /// Host pattern (`all`, `web:&prod`, `db*:!db3`, ...)
    pattern: String,

    /// Module to run
    #[arg(short = 'm', long = "module-name", default_value = "command")]
    module: String,

    /// Module arguments
    #[arg(short = 'a', long = "args", default_value = "")]
    args: String,

    /// Inventory file or comma-separated host list
    #[arg(short, long, default_value = "/etc/fanout/hosts")]
    inventory: String,

    /// Configuration file (defaults to FANOUT_CONFIG or ./fanout.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of parallel workers
    #[arg(short, long)]
    forks: Option<usize>,

    /// Connect as this user
    #[arg(short, long)]
    user: Option<String>,

    /// Ask for the connection password
    #[arg(short = 'k', long)]
    ask_pass: bool,

    /// Run operations with privilege escalation
    #[arg(short = 'b', long = "become")]
    escalate: bool,

    /// Escalate to this user (default: root)
    #[arg(long)]
    become_user: Option<String>,

    /// Escalation method: sudo, su, pbrun, pfexec or doas
    #[arg(long)]
    become_method: Option<String>,

    /// Ask for the escalation password
    #[arg(short = 'K', long)]
    ask_become_pass: bool,

    /// Extra variables as k=v pairs, JSON, or @file.yml (repeatable)
    #[arg(short = 'e', long = "extra-vars")]
    extra_vars: Vec<String>,

    /// Additional module search path
    #[arg(short = 'M', long = "module-path")]
    module_path: Vec<PathBuf>,

    /// Run in the background with this time limit in seconds
    #[arg(short = 'B', long = "background", default_value_t = 0)]
    background: u64,

    /// Poll background jobs every N seconds (0 fires and forgets)
    #[arg(short = 'P', long = "poll")]
    poll: Option<u64>,

    /// Report what would change without changing it
    #[arg(short = 'C', long)]
    check: bool,

    /// Show file differences for changed files
    #[arg(short = 'D', long)]
    diff: bool,

    /// Output format: text or json
    #[arg(long, default_value = "text")]
    output_format: OutputFormat,

    /// Condense text output to one line per host
    #[arg(short = 'o', long)]
    one_line: bool,

    /// Append a JSON event per host result to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Connection type: ssh, smart, paramiko or local
    #[arg(short = 'c', long = "connection")]
    connection: Option<String>,

    /// SSH private key file
    #[arg(long)]
    private_key: Option<PathBuf>,

    /// Connection timeout in seconds
    #[arg(short = 'T', long)]
    timeout: Option<u64>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn prompt_password(prompt: &str) -> Result<String> {
    eprint!("{}", prompt.cyan());
    io::stderr().flush().ok();
    let password = rpassword::read_password().context("failed to read password")?;
    Ok(password.trim_end().to_string())
}

/// Parse one `-e` value: `@file` (YAML or JSON), inline JSON, or k=v pairs
fn parse_extra_vars(raw: &str) -> Result<VarMap> {
    if let Some(path) = raw.strip_prefix('@') {
        let content = std::fs::read_to_string(Path::new(path))
            .with_context(|| format!("failed to read extra vars file {}", path))?;
        let value: Value = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse extra vars file {}", path))?;
        return match value {
            Value::Object(map) => Ok(from_object(&map)),
            Value::Null => Ok(VarMap::new()),
            _ => bail!("extra vars file {} must contain a mapping", path),
        };
    }
    if raw.trim_start().starts_with('{') {
        let map: serde_json::Map<String, Value> =
            serde_json::from_str(raw).context("failed to parse extra vars JSON")?;
        return Ok(from_object(&map));
    }
    Ok(parse_kv(raw)?)
}

fn build_config(cli: &Cli) -> Result<RunnerConfig> {
    let mut config = RunnerConfig::load(cli.config.as_deref())?;
    if let Some(forks) = cli.forks {
        config.forks = forks;
    }
    if let Some(user) = &cli.user {
        config.remote_user = Some(user.clone());
    }
    if let Some(transport) = &cli.connection {
        config.transport = transport.clone();
    }
    if let Some(key) = &cli.private_key {
        config.private_key_file = Some(key.clone());
    }
    if let Some(timeout) = cli.timeout {
        config.timeout = timeout;
    }
    if let Some(method) = &cli.become_method {
        config.become_method = method.clone();
    }
    config.module_paths.extend(cli.module_path.iter().cloned());
    config.verbosity = cli.verbose;
    Ok(config)
}

fn build_task(cli: &Cli, config: &RunnerConfig, pass: Option<String>, become_pass: Option<String>) -> TaskSpec {
    let mut task = TaskSpec::new(&cli.module, &cli.args)
        .pattern(&cli.pattern)
        .check(cli.check)
        .diff(cli.diff)
        .remote_pass(pass);
    if let Some(user) = &config.remote_user {
        task = task.remote_user(user);
    }
    if let Some(transport) = &cli.connection {
        task = task.transport(transport);
    }
    if let Some(key) = &config.private_key_file {
        task = task.private_key_file(key.display().to_string());
    }
    if cli.escalate || cli.become_user.is_some() || cli.ask_become_pass {
        task = task
            .become_user(Some(cli.become_user.clone().unwrap_or_else(|| config.become_user.clone())))
            .become_method(&config.become_method)
            .become_pass(become_pass);
    }
    task
}

fn print_results(format: OutputFormat, results: &RunResults) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(results)?);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<bool> {
    let config = build_config(&cli)?;
    let inventory = Inventory::load(&cli.inventory)?;

    let mut extra_vars = VarMap::new();
    for raw in &cli.extra_vars {
        extra_vars.extend(parse_extra_vars(raw)?);
    }

    let pass = if cli.ask_pass {
        Some(prompt_password("SSH password: ")?)
    } else {
        None
    };
    let become_pass = if cli.ask_become_pass {
        Some(prompt_password("BECOME password: ")?)
    } else {
        None
    };

    let locks = RunLocks::new();
    let stats = Arc::new(AggregateStats::new());
    let mut callbacks = CallbackManager::new().with(stats.clone());
    if cli.output_format == OutputFormat::Text {
        callbacks.add(Arc::new(TerminalCallback::new(locks.console.clone(), cli.one_line)));
    }
    if let Some(path) = &cli.log_file {
        let log = JsonLogCallback::new(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        callbacks.add(Arc::new(log));
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            on_interrupt.cancel();
        }
    });

    let task = build_task(&cli, &config, pass, become_pass);
    let poll_interval = cli.poll.unwrap_or(config.poll_interval);
    let ctx = RunContext::builder(Arc::new(inventory))
        .config(config)
        .callbacks(callbacks)
        .extra_vars(extra_vars)
        .scrub_output(io::stdout().is_terminal())
        .locks(locks)
        .cancel_token(cancel)
        .build();

    let runner = Runner::new(ctx, Arc::new(task));
    let results = if cli.background > 0 {
        let (started, mut poller) = runner.run_async(cli.background).await?;
        if poll_interval > 0 {
            debug!(interval = poll_interval, "waiting for background jobs");
            poller.wait(cli.background, poll_interval).await?
        } else {
            started
        }
    } else {
        runner.run().await?
    };

    print_results(cli.output_format, &results)?;

    let failed = !results.dark.is_empty() || stats.has_failures();
    Ok(!failed)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(e) => {
            match e.downcast_ref::<RunnerError>() {
                Some(err) => eprint!("{}", err.render()),
                None => eprintln!("{}: {:#}", "ERROR".red().bold(), e),
            }
            std::process::exit(1);
        }
    }
}

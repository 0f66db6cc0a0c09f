//! Hookrelay CLI
//!
//! Reconciles the host for the webhook relay (`install`) or reports its
//! state without changing anything (`status`). The exit code is 0 when
//! clean, 1 with warnings and 2 on any error.

mod cli;

use clap::Parser;
use std::io::{BufRead, IsTerminal, Write};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use hookrelay_core::{
    Action, ConfigFile, Context, DesiredConfig, Doctor, Outcome, Reconciler, Report,
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = load_config(&cli);
    init_logging(wants_debug(&cli, &config));
    tracing::debug!("hookrelay v{}", hookrelay_core::VERSION);

    let report = run(&cli, config).await;
    render(&report, cli.json);
    std::process::exit(report.exit_code());
}

/// `--verbose` or `"verbose": true` in the config file.
fn wants_debug(cli: &Cli, config: &anyhow::Result<DesiredConfig>) -> bool {
    cli.verbose || config.as_ref().is_ok_and(|c| c.flags.verbose)
}

/// Logs go to stderr so stdout stays clean for `--json`.
fn init_logging(verbose: bool) {
    let directive = if verbose { "hookrelay=debug" } else { "hookrelay=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("warn,{}", directive)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: &Cli, config: anyhow::Result<DesiredConfig>) -> Report {
    let action = match cli.action() {
        Commands::Status => Action::Status,
        Commands::Install => Action::Install,
    };

    let config = match config {
        Ok(config) => config,
        Err(e) => return failed(action, "config", e),
    };

    match action {
        Action::Status => match Context::read_only().await {
            Ok(ctx) => Doctor::new(ctx).diagnose(&config).await,
            Err(e) => Report::fatal(action, e),
        },
        Action::Install => {
            let dry_run = config.flags.dry_run;
            if !dry_run && !config.flags.assume_yes {
                if let Err(reason) = confirm(&config) {
                    return failed(action, "confirm", reason);
                }
            }
            match Context::system(dry_run).await {
                Ok(ctx) => Reconciler::new(ctx).install(&config).await,
                Err(e) => Report::fatal(action, e),
            }
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<DesiredConfig> {
    let file = cli.config.as_deref().map(ConfigFile::load).transpose()?;
    Ok(DesiredConfig::resolve(file, cli.overrides())?)
}

fn failed(action: Action, step: &str, error: impl std::fmt::Display) -> Report {
    let mut report = Report::new(action, false);
    report.summary.error(step, format!("{:#}", error));
    report
}

/// Asks before mutating the host; refuses when nobody can answer.
fn confirm(config: &DesiredConfig) -> Result<(), String> {
    let refusal = "refusing to modify the host without confirmation; pass --yes or --dry-run".to_string();
    if !std::io::stdin().is_terminal() {
        return Err(refusal);
    }

    let mut stderr = std::io::stderr();
    let _ = write!(
        stderr,
        "Configure this host for {} (install dir {})? [y/N] ",
        config.webhook_host,
        config.install_dir.display()
    );
    let _ = stderr.flush();

    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return Err(refusal);
    }
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Ok(()),
        _ => Err("aborted by user".to_string()),
    }
}

fn render(report: &Report, json: bool) {
    if json {
        match serde_json::to_string_pretty(report) {
            Ok(out) => println!("{}", out),
            Err(e) => tracing::error!("Failed to serialize report: {}", e),
        }
        return;
    }

    for record in &report.resources {
        println!(
            "{:<14} {:<10} {}",
            record.kind.as_str(),
            outcome_label(&record.outcome),
            record.target.display()
        );
    }
    for hint in &report.hints {
        println!("hint: {}", hint);
    }
    println!("{}", report.summary.headline());
}

fn outcome_label(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Applied => "applied".to_string(),
        Outcome::Unchanged => "ok".to_string(),
        Outcome::Planned => "pending".to_string(),
        Outcome::Skipped { reason } => format!("skipped ({})", reason),
        Outcome::Failed { reason } => format!("failed ({})", reason),
    }
}

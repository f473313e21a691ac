//! Patch Fortress CLI
//!
//! Operator surface over guarded apply, secret scanning, gates, reranking
//! and the rollback lock. Every command prints a JSON result.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;

use patch_fortress::rerank::fixed;
use patch_fortress::{
    Candidate, CandidateGenerator, Error, FortressConfig, GateRunner, GuardedApply, LockStore,
    ProcessSandbox, Reranker, Result, SecretScanner, WorkspaceEvaluator,
};

#[derive(Parser)]
#[command(name = "patch-fortress")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Guarded patch application and execution-based reranking", long_about = None)]
struct Cli {
    /// Repository to operate on
    #[arg(short, long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Config file (TOML or YAML); defaults to <repo>/.patch-fortress/config.{toml,yaml,yml}
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a diff behind the secret scan and gates
    Apply {
        /// Diff file, or "-" for stdin
        diff: PathBuf,
    },

    /// Scan a diff's added lines for secrets
    Scan {
        /// Diff file, or "-" for stdin
        diff: PathBuf,
    },

    /// Run the configured gates against the repository as it is
    Gates {
        /// Run every gate instead of stopping at the first failure
        #[arg(long)]
        full: bool,
    },

    /// Evaluate competing diffs in isolated worktrees and rank them
    Rerank {
        /// Candidate diff files, in priority order
        #[arg(required = true)]
        diffs: Vec<PathBuf>,
    },

    /// Inspect or clear the rollback lock
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// Show the current lock
    Status,

    /// Remove the lock (operator action)
    Clear,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(code = e.code(), error = %e, "command failed");
            eprintln!("error [{}]: {}", e.code(), e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => FortressConfig::load(path)?,
        None => FortressConfig::discover(&cli.repo)?,
    }
    .validated()?;
    let executor = Arc::new(ProcessSandbox::with_config(config.sandbox.clone()));

    match cli.command {
        Commands::Apply { diff } => {
            let text = read_diff(&diff)?;
            let guard = GuardedApply::new(&cli.repo, config, executor);
            let result = guard.apply(&text).await?;
            print_json(&result)?;
            Ok(exit_code(result.ok))
        }
        Commands::Scan { diff } => {
            let violations = SecretScanner::new().scan(&read_diff(&diff)?);
            print_json(&violations)?;
            Ok(exit_code(violations.is_empty()))
        }
        Commands::Gates { full } => {
            let runner = GateRunner::new(executor);
            let report = if full {
                runner.run_all(&config.gates, &cli.repo, &config.quota).await
            } else {
                runner.run_gates(&config.gates, &cli.repo, &config.quota).await
            };
            print_json(&report)?;
            Ok(exit_code(report.all_ok))
        }
        Commands::Rerank { diffs } => {
            let mut generators: Vec<Box<dyn CandidateGenerator>> = Vec::with_capacity(diffs.len());
            for path in &diffs {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                generators.push(fixed(Candidate::new(name, read_diff(path)?)));
            }

            let evaluator = Arc::new(WorkspaceEvaluator::for_repo(&cli.repo, &config, executor));
            let result = Reranker::new(config.rerank.clone())
                .rerank(&generators, evaluator)
                .await?;
            print_json(&result)?;
            Ok(exit_code(result.ok))
        }
        Commands::Lock { action } => {
            let store = LockStore::new(&cli.repo, &config.control_dir);
            match action {
                LockAction::Status => {
                    let record = store.read()?;
                    print_json(&record)?;
                    Ok(exit_code(record.is_none()))
                }
                LockAction::Clear => {
                    let removed = store.clear()?;
                    print_json(&serde_json::json!({ "cleared": removed }))?;
                    Ok(ExitCode::SUCCESS)
                }
            }
        }
    }
}

fn read_diff(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        return Ok(text);
    }
    std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read diff {}: {}", path.display(), e)))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

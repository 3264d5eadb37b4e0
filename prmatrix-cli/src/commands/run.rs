use crate::commands::SourceArgs;
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use matrix_service::execution::events::progress_channel;
use matrix_service::runners::require_tool;
use matrix_service::{
    CheckStatus, ExecutionEvent, LogLevel, MatrixRun, ReportFormat, ResultReporter, RunContext,
};

/// Check every entry of the matrix for the given changes
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Result directory (default: out_dir from the config)
    #[arg(long, short = 'o', value_name = "DIR")]
    pub out: Option<PathBuf>,

    /// Report format: terminal, junit, tap
    #[arg(long, short = 'f', default_value = "terminal")]
    pub format: String,

    /// Entries checked at the same time
    #[arg(long, short = 'j', value_name = "N")]
    pub max_parallel: Option<usize>,

    /// Seconds of fuzzing per target
    #[arg(long, value_name = "SECS")]
    pub fuzz_seconds: Option<u64>,

    /// Scratch directory for worktrees and staged builds
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let format: ReportFormat = args
        .format
        .parse()
        .map_err(|e: String| color_eyre::eyre::eyre!("{}", e))?;

    let (repo, mut config) = args.source.load()?;
    if let Some(n) = args.max_parallel {
        config.max_parallel = n;
    }
    if let Some(secs) = args.fuzz_seconds {
        config.fuzz_seconds = secs;
    }
    if let Some(dir) = args.work_dir {
        config.work_dir = Some(dir);
    }
    if let Some(dir) = args.out {
        config.out_dir = dir;
    }
    config.validate()?;
    tracing::debug!(config = ?config, "effective configuration");

    for tool in ["git", "cargo", "rustup"] {
        require_tool(tool)?;
    }

    output::status("Repository", &repo.display().to_string());
    output::info(&format!(
        "{} change(s), up to {} entries at a time",
        args.source.changes.len(),
        config.max_parallel
    ));

    let out_dir = config.out_dir.clone();
    let (tx, rx) = progress_channel();
    let run = MatrixRun::new(RunContext::local(&repo, config).with_progress(tx));

    let changes = args.source.changes.clone();
    let run_handle = tokio::spawn(async move { run.run(&changes).await });

    let mut events = UnboundedReceiverStream::new(rx);
    while let Some(event) = events.next().await {
        render(&event);
    }

    let report = run_handle.await??;

    report.write_to_dir(&out_dir)?;
    output::status("Results", &out_dir.display().to_string());

    println!("{}", ResultReporter::report(&report.results, format));

    for (change, error) in &report.resolution_failures {
        output::failure(&format!("{} was not checked: {}", change, error));
    }

    if !report.success() {
        std::process::exit(1);
    }

    Ok(())
}

fn render(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::RunStarted { changes } => {
            output::header(&format!("Checking {}", changes.join(", ")));
        }

        ExecutionEvent::ChangeResolved { change, commits } => {
            output::status("Resolved", &format!("{} ({} commits)", change, commits));
        }

        ExecutionEvent::ResolutionFailed { change, error } => {
            output::error(&format!("{}: {}", change, error));
        }

        ExecutionEvent::MatrixExpanded {
            change,
            entries,
            memo_keys,
        } => {
            output::status(
                "Expanded",
                &format!("{}: {} entries, {} builds", change, entries, memo_keys),
            );
        }

        ExecutionEvent::ArtifactStarted { key } => {
            output::dim(&format!("  preparing {}", key));
        }

        ExecutionEvent::ArtifactCompleted {
            key,
            success,
            duration,
        } => {
            let line = format!("  prepared {} ({:.2}s)", key, duration.as_secs_f64());
            if *success {
                output::dim_success(&line);
            } else {
                output::dim_failure(&format!("{} FAILED", line));
            }
        }

        ExecutionEvent::EntryStarted { group, name } => {
            output::entry_header(group, name);
        }

        ExecutionEvent::EntryCompleted {
            group,
            name,
            status,
            duration,
        } => {
            let line = format!(
                "  {}/{} {} ({:.2}s)",
                group,
                name,
                status,
                duration.as_secs_f64()
            );
            match status {
                CheckStatus::Passed | CheckStatus::Skipped => output::dim_success(&line),
                CheckStatus::TimedOut => output::warning(&line),
                CheckStatus::Failed => output::dim_failure(&line),
            }
        }

        ExecutionEvent::CheckStarted { .. } => {}

        ExecutionEvent::CheckCompleted {
            name,
            check,
            status,
            duration,
        } => {
            let line = format!(
                "      {} {} {} ({:.2}s)",
                name,
                check,
                status,
                duration.as_secs_f64()
            );
            if status.is_success() {
                output::dim(&line);
            } else {
                output::dim_failure(&line);
            }
        }

        ExecutionEvent::Log { level, message, .. } => match level {
            LogLevel::Error => output::error(message),
            LogLevel::Warning => output::warning(message),
            _ => output::dim(message),
        },

        ExecutionEvent::RunCompleted {
            success,
            total,
            failed,
            duration,
        } => {
            println!();
            if *success {
                output::success(&format!(
                    "{} entries passed in {:.2}s",
                    total,
                    duration.as_secs_f64()
                ));
            } else {
                output::failure(&format!(
                    "{} of {} entries failed after {:.2}s",
                    failed,
                    total,
                    duration.as_secs_f64()
                ));
            }
        }
    }
}

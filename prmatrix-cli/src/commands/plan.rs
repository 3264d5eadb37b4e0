use crate::commands::SourceArgs;
use crate::output;

use clap::Args;
use color_eyre::Result;

use matrix_service::runners::require_tool;
use matrix_service::{MatrixRun, RunContext};

/// Show the entries a run would check
#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Print every field of each entry
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

pub async fn execute(args: PlanArgs) -> Result<()> {
    let (repo, config) = args.source.load()?;
    for tool in ["git", "cargo", "rustup"] {
        require_tool(tool)?;
    }

    output::status("Planning", &repo.display().to_string());
    let run = MatrixRun::new(RunContext::local(&repo, config));
    let plan = run.plan(&args.source.changes).await?;

    for planned in &plan.entries {
        println!("{}  {}", planned.name, planned.key);
        if args.verbose {
            output::dim(&format!("    {}", planned.entry));
        }
    }

    println!();
    output::info(&format!(
        "{} entries, {} builds",
        plan.entries.len(),
        plan.memo_keys()
    ));

    if !plan.resolution_failures.is_empty() {
        for (change, error) in &plan.resolution_failures {
            output::failure(&format!("{}: {}", change, error));
        }
        std::process::exit(1);
    }

    Ok(())
}

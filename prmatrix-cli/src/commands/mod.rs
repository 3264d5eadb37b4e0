pub mod plan;
pub mod run;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use matrix_service::utils::{find_repo_root, resolve_repo_dir};
use matrix_service::RunConfig;

/// Arguments naming the changes to check and where they live
#[derive(Args, Debug)]
pub struct SourceArgs {
    /// Pull request numbers or commit ids
    #[arg(required = true, value_name = "PR|COMMIT")]
    pub changes: Vec<String>,

    /// Configuration file (default: prmatrix.yml at the repository root)
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Repository to test (default: the enclosing git repository)
    #[arg(long, short = 'r', value_name = "DIR")]
    pub repo: Option<PathBuf>,
}

impl SourceArgs {
    /// Repository root and the configuration that applies to it
    pub fn load(&self) -> Result<(PathBuf, RunConfig)> {
        let repo = match &self.repo {
            Some(dir) => {
                if !dir.is_dir() {
                    color_eyre::eyre::bail!("Repository not found: {}", dir.display());
                }
                find_repo_root(dir).unwrap_or_else(|| dir.clone())
            }
            None => resolve_repo_dir(),
        };

        let config = match &self.config {
            Some(path) => {
                if !path.exists() {
                    color_eyre::eyre::bail!("Config file not found: {}", path.display());
                }
                RunConfig::load(path)?
            }
            None => RunConfig::discover(&repo)?,
        };

        Ok((repo, config))
    }
}

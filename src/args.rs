use std::path::PathBuf;

use anyhow::{anyhow, Result};
use backfill::config::{self, BackfillConfig};
use clap::Args;

#[derive(Debug, Clone, Args)]
pub struct BaseArgs {
    /// Output as JSON
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// Increase log verbosity (-v info, -vv debug; RUST_LOG overrides)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// State directory (or via BACKFILL_ROOT) [default: ~/.backfill]
    #[arg(long, env = "BACKFILL_ROOT", global = true)]
    pub root: Option<PathBuf>,

    /// Engine config file [default: <root>/config.json]
    #[arg(long, env = "BACKFILL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Path to a .env file to load before running commands.
    #[arg(long, env = "BACKFILL_ENV_FILE", hide_env_values = true)]
    pub env_file: Option<PathBuf>,
}

impl BaseArgs {
    pub fn root_dir(&self) -> Result<PathBuf> {
        if let Some(root) = &self.root {
            return Ok(root.clone());
        }
        let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
        Ok(home.join(".backfill"))
    }

    pub fn load_config(&self) -> Result<BackfillConfig> {
        let root = self.root_dir()?;
        config::load(self.config.as_deref(), &root)
    }
}

#[derive(Debug, Clone, Args)]
pub struct CLIArgs<T: Args> {
    #[command(flatten)]
    pub base: BaseArgs,

    #[command(flatten)]
    pub args: T,
}

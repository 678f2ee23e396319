use std::path::PathBuf;

use clap::Parser;

/// strata: interactive shell over the strata access layer
#[derive(Debug, Parser)]
#[command(name = "strata", about = "strata interactive shell", version)]
pub struct Args {
    /// TOML configuration file
    #[arg(long, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database user
    #[arg(short = 'u', long, env = "STRATA_USER", default_value = "sys")]
    pub user: String,

    /// Password of the user
    #[arg(short = 'P', long, env = "STRATA_PASSWORD", default_value = "manager")]
    pub password: String,

    /// Run a single command line and exit
    #[arg(short = 'c', long)]
    pub command: Option<String>,
}

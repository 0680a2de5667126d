use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct Run {
    /// Path to the watchdog configuration file.
    #[clap(long, short, default_value = "pgward.toml")]
    pub config: PathBuf,
}

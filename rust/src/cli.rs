//! Command-line surface: `pull REMOTE [BRANCH|CHECKSUM...]`.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "pull", about = "Pull objects from a remote repository")]
pub struct Cli {
    /// Repo root containing `config` and the local object store.
    #[arg(long, default_value = "repo")]
    pub repo: PathBuf,

    /// Remote name, looked up under `remote "NAME"` in the local config.
    pub remote: String,

    /// Branch names or raw commit checksums to pull. Defaults to the
    /// remote's configured branches, or its `/refs/summary` if none.
    pub refs: Vec<String>,

    /// Increase diagnostic detail (repeatable: `-v`, `-vv`).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Also walk each commit's `related` field.
    #[arg(long)]
    pub related: bool,

    /// Maximum number of concurrent object fetches.
    #[arg(long, default_value_t = 8)]
    pub concurrency: usize,
}

use clap::Parser;
use std::path::PathBuf;

pub mod cache;
pub mod config;
pub mod convert;
pub mod error;
pub mod log;
pub mod panel;
pub mod pool;
pub mod refresh;
pub mod units;
pub mod v2board;

#[derive(Parser, Debug)]
#[clap(about, version, author)]
pub struct Args {
    /// JSON file mapping each host to its options and seed cache
    #[clap(long, default_value = "hosts.json")]
    pub hosts: PathBuf,

    #[clap(short, long, default_value = "4")]
    pub workers: usize,

    /// Directory receiving trials/ and trials_providers/
    #[clap(short, long, default_value = ".")]
    pub out_dir: PathBuf,

    #[clap(short, long, default_value = "info")]
    pub log_level: String,

    /// Print the final cache of every host as JSON
    #[clap(long)]
    pub dump_cache: bool,
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tonearm_types::ComponentName;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "tonearm", version = VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Engine config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Extra directory to scan for plugin libraries (repeatable)
    #[arg(long = "plugin-dir")]
    pub plugin_dirs: Vec<PathBuf>,

    /// Stream input component, e.g. `flac/decoder`
    #[arg(long)]
    pub input: Option<ComponentName>,

    /// Stream output component; defaults to `builtin/null`
    #[arg(long)]
    pub output: Option<ComponentName>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List plugin libraries and the components they provide
    List,

    /// Play files in order, then exit
    Play {
        /// Audio files to queue
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

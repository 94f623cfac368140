//! tonearm: play audio files through plugin-provided decoders and outputs.
//!
//! Plugins are shared libraries exporting the tonearm plugin ABI. They are found by scanning
//! the configured plugin directories; the decoder, output and sound processors are picked by
//! `module/component` name in the config file or on the command line.

mod cli;
mod runtime;

use anyhow::Result;
use clap::Parser;
use tonearm_engine::config::EngineConfig;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tonearm=info")),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    config.plugin_dirs.extend(args.plugin_dirs.iter().cloned());
    if args.input.is_some() {
        config.input = args.input.clone();
    }
    if args.output.is_some() {
        config.output = args.output.clone();
    }

    match args.cmd {
        cli::Command::List => runtime::list_components(config),
        cli::Command::Play { files } => runtime::run_play(config, files),
    }
}

//! Command implementations for the tonearm CLI.

use std::path::PathBuf;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use tonearm_engine::Engine;
use tonearm_engine::component::ComponentId;
use tonearm_engine::config::EngineConfig;
use tonearm_types::{Event, EventKind, PlaybackState};

/// Print each known plugin library and its components to stdout.
pub fn list_components(config: EngineConfig) -> Result<()> {
    let engine = Engine::new(config)?;
    for library in engine.registry().libraries() {
        println!(
            "{} ({}){}",
            library.module,
            library.path.display(),
            if library.open { " [open]" } else { "" }
        );
        for entry in &library.components {
            println!("  {}/{}  {}", library.module, entry.component, entry.kind);
        }
    }
    Ok(())
}

enum Exit {
    Finished,
    Interrupted,
}

/// Play `files` in order and return once the playlist ends or Ctrl-C is pressed.
pub fn run_play(config: EngineConfig, files: Vec<PathBuf>) -> Result<()> {
    let engine = Engine::new(config)?;
    engine
        .load_components()
        .context("configure playback components")?;

    let (exit_tx, exit_rx): (Sender<Exit>, Receiver<Exit>) = crossbeam_channel::bounded(1);
    let on_signal = exit_tx.clone();
    ctrlc::set_handler(move || {
        let _ = on_signal.try_send(Exit::Interrupted);
    })
    .context("install Ctrl-C handler")?;

    engine.hooks().install(ComponentId::next(), EventKind::SongChange, |event| {
        if let Event::SongChange { to, .. } = event {
            tracing::info!(index = to, "now playing");
        }
    });
    engine
        .hooks()
        .install(ComponentId::next(), EventKind::PlaybackChange, move |event| {
            if let Event::PlaybackChange {
                to: PlaybackState::Stopped,
                ..
            } = event
            {
                let _ = exit_tx.try_send(Exit::Finished);
            }
        });

    let playlist = engine.new_playlist("cli");
    for file in &files {
        playlist.add(file);
    }
    playlist.activate(engine.playback());
    engine.playback().play(true);
    if engine.playback().state() != PlaybackState::Playing {
        anyhow::bail!("nothing to play");
    }
    tracing::info!(tracks = files.len(), "playback started");

    match exit_rx.recv() {
        Ok(Exit::Finished) => tracing::info!("playlist finished"),
        Ok(Exit::Interrupted) => tracing::info!("interrupted"),
        Err(_) => tracing::warn!("exit channel closed"),
    }
    engine.shutdown();
    Ok(())
}

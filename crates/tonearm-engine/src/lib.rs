//! Tonearm playback engine.
//!
//! The engine discovers plugin libraries, instantiates the components they provide and streams
//! decoded PCM from a stream input, through an optional chain of sound processors, into a
//! bounded [`buffer::Buffer`] that a stream output drains.
//!
//! ## Threads
//! - **master** ([`worker::WorkerRuntime`]): starts prepared workers and reaps finished ones.
//! - **hooks** ([`hooks::HookDispatcher`]): delivers published events to installed hooks.
//! - **playback commands** ([`playback::PlaybackController`]): applies transport commands
//!   in order.
//! - **fill loop**: one per playback session, keeps the buffer topped up.
//!
//! [`engine::Engine`] wires all of these together and tears them down in order.

pub mod audio_file;
pub mod buffer;
pub mod builtin;
pub mod component;
pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod native;
pub mod playback;
pub mod playlist;
pub mod queue_thread;
pub mod registry;
pub mod settings;
pub mod worker;

mod sync;

#[cfg(test)]
pub(crate) mod testkit;

pub use engine::Engine;
pub use error::{EngineError, RegistryError};

//! Top-level wiring of the engine services.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use tonearm_types::{ComponentKind, ComponentName};

use crate::buffer::Buffer;
use crate::builtin;
use crate::component::{Component, EngineServices};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::hooks::HookDispatcher;
use crate::native::NativeLoader;
use crate::playback::PlaybackController;
use crate::playlist::{AudioFileCache, Playlist};
use crate::registry::{LibraryLoader, Registry};
use crate::settings::{JsonSettingsStore, MemorySettingsStore, SettingsStore};
use crate::worker::WorkerRuntime;

/// Owns every engine service and tears them down in dependency order.
pub struct Engine {
    config: EngineConfig,
    runtime: Arc<WorkerRuntime>,
    hooks: Arc<HookDispatcher>,
    settings: Arc<dyn SettingsStore>,
    audio_files: Arc<AudioFileCache>,
    playback: PlaybackController,
    registry: Registry,
    stopped: AtomicBool,
}

impl Engine {
    /// Build an engine that loads native plugin libraries and scan the configured directories.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let settings: Arc<dyn SettingsStore> = match &config.settings_dir {
            Some(dir) => Arc::new(JsonSettingsStore::new(dir.clone())),
            None => Arc::new(MemorySettingsStore::new()),
        };
        Self::with_loader(config, Arc::new(NativeLoader), settings)
    }

    pub fn with_loader(
        config: EngineConfig,
        loader: Arc<dyn LibraryLoader>,
        settings: Arc<dyn SettingsStore>,
    ) -> Result<Self> {
        let runtime = Arc::new(WorkerRuntime::start()?);
        let hooks = Arc::new(HookDispatcher::start(&runtime));
        let audio_files = AudioFileCache::new();
        let buffer = Arc::new(Buffer::new(config.buffer_frames));
        let playback = PlaybackController::new(runtime.clone(), hooks.clone(), buffer);

        let services = Arc::new(EngineServices {
            runtime: runtime.clone(),
            hooks: hooks.clone(),
            settings: settings.clone(),
            audio_files: audio_files.clone(),
            pcm: playback.pcm_source(),
            data_dir: config.data_dir.clone(),
        });
        let registry = Registry::new(loader, services);
        registry.register_builtin(builtin::library())?;

        let engine = Self {
            config,
            runtime,
            hooks,
            settings,
            audio_files,
            playback,
            registry,
            stopped: AtomicBool::new(false),
        };
        let found = engine.scan_plugins();
        tracing::info!(
            libraries = found,
            buffer_frames = engine.config.buffer_frames,
            "engine started"
        );
        Ok(engine)
    }

    /// Scan the configured plugin directories again. Returns how many libraries were added.
    pub fn scan_plugins(&self) -> usize {
        self.registry.scan(&self.config.plugin_dirs)
    }

    /// Instantiate and install the configured input, output and sound processors.
    ///
    /// A missing input is an error. Without a configured output the builtin null output is
    /// used. Sound processors that cannot be found are skipped.
    pub fn load_components(&self) -> Result<(), EngineError> {
        let input_name = self
            .config
            .input
            .clone()
            .ok_or(EngineError::NotConfigured(ComponentKind::StreamInput))?;
        let input = self.require(&input_name, ComponentKind::StreamInput)?;

        let output_name = self
            .config
            .output
            .clone()
            .unwrap_or_else(|| ComponentName::new(builtin::BUILTIN_MODULE, builtin::NULL_OUTPUT));
        let output = self.require(&output_name, ComponentKind::StreamOutput)?;

        let mut chain = Vec::new();
        for name in &self.config.dsp {
            match self.registry.find_kind(name, ComponentKind::SoundProcessor) {
                Some(processor) => chain.push(processor),
                None => tracing::warn!(component = %name, "sound processor not available; skipped"),
            }
        }

        self.release_all(self.playback.set_stream_input(Some(input))?);
        self.release_all(self.playback.set_stream_output(Some(output))?);
        self.release_all(self.playback.set_dsp_chain(chain)?);
        tracing::info!(input = %input_name, output = %output_name, "components loaded");
        Ok(())
    }

    fn require(&self, name: &ComponentName, kind: ComponentKind) -> Result<Component, EngineError> {
        if let Some(actual) = self.registry.kind_of(name)
            && actual != kind
        {
            return Err(EngineError::WrongKind {
                name: name.clone(),
                expected: kind,
                actual,
            });
        }
        self.registry
            .find_kind(name, kind)
            .ok_or_else(|| EngineError::NotFound(name.clone()))
    }

    fn release_all(&self, components: impl IntoIterator<Item = Component>) {
        for component in components {
            self.registry.release(component);
        }
    }

    /// New empty playlist sharing the engine's audio-file cache.
    pub fn new_playlist(&self, name: impl Into<String>) -> Arc<Playlist> {
        Playlist::new(self.audio_files.clone(), name)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn playback(&self) -> &PlaybackController {
        &self.playback
    }

    pub fn hooks(&self) -> &Arc<HookDispatcher> {
        &self.hooks
    }

    pub fn settings(&self) -> &Arc<dyn SettingsStore> {
        &self.settings
    }

    pub fn audio_files(&self) -> &Arc<AudioFileCache> {
        &self.audio_files
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stop playback, release components and stop every engine thread. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let components = self.playback.shutdown();
        self.release_all(components);
        self.hooks.shutdown();
        self.runtime.shutdown();
        tracing::info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

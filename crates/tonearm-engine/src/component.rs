//! Runtime components and the capability traits plugins implement.
//!
//! A [`Component`] is one instantiated plugin object. Its capability is a closed set of
//! variants ([`ComponentBody`]) rather than a type hierarchy, so callers match on the kind
//! instead of downcasting.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use tonearm_types::{AudioTags, ComponentKind, ComponentName, EventKind, PcmFormat, PcmPacket, PcmPacketUnit};

use crate::audio_file::AudioFile;
use crate::hooks::{HookDispatcher, HookId};
use crate::playlist::AudioFileCache;
use crate::registry::LibraryLease;
use crate::settings::{ScopedSettings, SettingsStore};
use crate::worker::WorkerRuntime;

/// Process-unique component instance id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(u64);

impl ComponentId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ComponentId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// In-place packet transform.
pub trait SoundProcessor: Send {
    /// Returns `true` when the unit was modified.
    fn modify_packet(&mut self, unit: &mut PcmPacketUnit) -> bool;
}

/// Decoder for audio files.
pub trait StreamInput: Send {
    /// Read up to `frames` frames starting at source position `from`.
    fn read_frames(&mut self, file: &AudioFile, from: u64, frames: u64) -> Result<PcmPacket>;
    fn calc_total_frames(&mut self, file: &AudioFile) -> Result<u64>;
    fn read_tags(&mut self, file: &AudioFile) -> Result<AudioTags>;
}

/// Output device driver. Pulls PCM through the [`PcmSource`] in its context.
pub trait StreamOutput: Send {
    fn start_playback(&mut self) -> Result<()>;
    fn stop_playback(&mut self) -> Result<()>;
    fn pause_playback(&mut self) -> Result<()>;
    fn resume_playback(&mut self) -> Result<()>;

    /// Fixed device latency in frames.
    fn output_delay(&self) -> u64 {
        0
    }
}

/// Plugin-wide lifecycle object with no audio role; typically installs hooks when built.
pub trait Module: Send {}

/// Front-end widget, resolved by name only.
pub trait Widget: Send {}

pub enum ComponentBody {
    Module(Box<dyn Module>),
    SoundProcessor(Box<dyn SoundProcessor>),
    StreamInput(Box<dyn StreamInput>),
    StreamOutput(Box<dyn StreamOutput>),
    Widget(Box<dyn Widget>),
}

impl ComponentBody {
    pub fn kind(&self) -> ComponentKind {
        match self {
            ComponentBody::Module(_) => ComponentKind::Module,
            ComponentBody::SoundProcessor(_) => ComponentKind::SoundProcessor,
            ComponentBody::StreamInput(_) => ComponentKind::StreamInput,
            ComponentBody::StreamOutput(_) => ComponentKind::StreamOutput,
            ComponentBody::Widget(_) => ComponentKind::Widget,
        }
    }
}

/// Read side of the playback buffer, as seen by stream outputs.
pub trait PcmSource: Send + Sync {
    fn filled_frames(&self) -> u64;
    /// Take up to `frames` frames. Never blocks.
    fn pull_packet(&self, frames: u64) -> PcmPacket;
    /// Format of the next frame to be pulled.
    fn pcm_format(&self) -> PcmFormat;
}

/// Engine services reachable from every component.
pub struct EngineServices {
    pub runtime: Arc<WorkerRuntime>,
    pub hooks: Arc<HookDispatcher>,
    pub settings: Arc<dyn SettingsStore>,
    pub audio_files: Arc<AudioFileCache>,
    pub pcm: Arc<dyn PcmSource>,
    /// Parent of every module's resource directory.
    pub data_dir: PathBuf,
}

/// Construction parameters and engine access for one component instance.
pub struct ComponentContext {
    name: ComponentName,
    id: ComponentId,
    services: Arc<EngineServices>,
    resource_dir: OnceLock<PathBuf>,
}

impl ComponentContext {
    pub(crate) fn new(name: ComponentName, services: Arc<EngineServices>) -> Self {
        Self {
            name,
            id: ComponentId::next(),
            services,
            resource_dir: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &ComponentName {
        &self.name
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    /// `<data_dir>/<module>`. Not created on disk.
    pub fn resource_dir(&self) -> &Path {
        self.resource_dir
            .get_or_init(|| self.services.data_dir.join(&self.name.module))
    }

    /// Settings scoped to this component's module.
    pub fn settings(&self) -> ScopedSettings {
        ScopedSettings::new(self.services.settings.clone(), &self.name.module)
    }

    /// Install a hook owned by this component; it is removed when the component is released.
    pub fn install_hook<F>(&self, kind: EventKind, hook: F) -> HookId
    where
        F: Fn(&tonearm_types::Event) + Send + Sync + 'static,
    {
        self.services.hooks.install(self.id, kind, hook)
    }

    pub fn pcm_source(&self) -> Arc<dyn PcmSource> {
        self.services.pcm.clone()
    }

    pub fn runtime(&self) -> &Arc<WorkerRuntime> {
        &self.services.runtime
    }

    pub(crate) fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }
}

/// One live component instance.
///
/// Dropping it (or passing it to [`Registry::release`](crate::registry::Registry::release))
/// removes its hooks, releases the private data it stored on audio files, drops the plugin
/// object and finally returns the library lease.
pub struct Component {
    ctx: Arc<ComponentContext>,
    kind: ComponentKind,
    body: Option<ComponentBody>,
    lease: Option<LibraryLease>,
}

impl Component {
    pub(crate) fn new(
        ctx: Arc<ComponentContext>,
        body: ComponentBody,
        lease: Option<LibraryLease>,
    ) -> Self {
        Self {
            kind: body.kind(),
            ctx,
            body: Some(body),
            lease,
        }
    }

    pub fn name(&self) -> &ComponentName {
        self.ctx.name()
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    pub fn id(&self) -> ComponentId {
        self.ctx.id()
    }

    pub fn resource_dir(&self) -> &Path {
        self.ctx.resource_dir()
    }

    pub fn context(&self) -> &Arc<ComponentContext> {
        &self.ctx
    }

    pub fn as_stream_input(&mut self) -> Option<&mut dyn StreamInput> {
        match self.body.as_mut()? {
            ComponentBody::StreamInput(input) => Some(input.as_mut()),
            _ => None,
        }
    }

    pub fn as_stream_output(&mut self) -> Option<&mut dyn StreamOutput> {
        match self.body.as_mut()? {
            ComponentBody::StreamOutput(output) => Some(output.as_mut()),
            _ => None,
        }
    }

    pub fn stream_output(&self) -> Option<&dyn StreamOutput> {
        match self.body.as_ref()? {
            ComponentBody::StreamOutput(output) => Some(output.as_ref()),
            _ => None,
        }
    }

    pub fn as_sound_processor(&mut self) -> Option<&mut dyn SoundProcessor> {
        match self.body.as_mut()? {
            ComponentBody::SoundProcessor(processor) => Some(processor.as_mut()),
            _ => None,
        }
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("name", self.name())
            .field("kind", &self.kind)
            .field("id", &self.id())
            .finish()
    }
}

impl Drop for Component {
    fn drop(&mut self) {
        let id = self.ctx.id();
        let services = self.ctx.services();
        services.hooks.uninstall_all(id);
        if self.kind == ComponentKind::StreamInput {
            services.audio_files.cleanup_private_data(id);
        }
        drop(self.body.take());
        drop(self.lease.take());
        tracing::debug!(component = %self.ctx.name(), %id, "component released");
    }
}

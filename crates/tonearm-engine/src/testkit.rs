//! Fakes shared by the unit tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use tonearm_types::{
    AudioTags, ComponentName, PcmFormat, PcmPacket, PcmPacketUnit, SampleType,
};

use crate::audio_file::AudioFile;
use crate::buffer::Buffer;
use crate::component::{
    Component, ComponentBody, ComponentContext, EngineServices, Module, PcmSource, SoundProcessor,
    StreamInput, StreamOutput,
};
use crate::hooks::HookDispatcher;
use crate::playlist::AudioFileCache;
use crate::settings::MemorySettingsStore;
use crate::sync::lock;
use crate::worker::WorkerRuntime;

/// Poll `cond` until it holds or five seconds pass.
pub(crate) fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

pub(crate) struct BufferSource(pub(crate) Arc<Buffer>);

impl PcmSource for BufferSource {
    fn filled_frames(&self) -> u64 {
        self.0.filled_frames()
    }

    fn pull_packet(&self, frames: u64) -> PcmPacket {
        self.0.cut(frames)
    }

    fn pcm_format(&self) -> PcmFormat {
        self.0.next_format()
    }
}

pub(crate) struct TestServices {
    pub(crate) runtime: Arc<WorkerRuntime>,
    pub(crate) hooks: Arc<HookDispatcher>,
    pub(crate) audio_files: Arc<AudioFileCache>,
    pub(crate) buffer: Arc<Buffer>,
    pub(crate) services: Arc<EngineServices>,
}

impl TestServices {
    pub(crate) fn new() -> Self {
        let runtime = Arc::new(WorkerRuntime::start().expect("worker runtime"));
        let hooks = Arc::new(HookDispatcher::start(&runtime));
        let audio_files = AudioFileCache::new();
        let buffer = Arc::new(Buffer::default());
        let services = Arc::new(EngineServices {
            runtime: runtime.clone(),
            hooks: hooks.clone(),
            settings: Arc::new(MemorySettingsStore::new()),
            audio_files: audio_files.clone(),
            pcm: Arc::new(BufferSource(buffer.clone())),
            data_dir: std::env::temp_dir(),
        });
        Self {
            runtime,
            hooks,
            audio_files,
            buffer,
            services,
        }
    }

    /// Wrap `body` as a component that is not backed by a library.
    pub(crate) fn component(&self, name: ComponentName, body: ComponentBody) -> Component {
        let ctx = Arc::new(ComponentContext::new(name, self.services.clone()));
        Component::new(ctx, body, None)
    }
}

pub(crate) fn test_format() -> PcmFormat {
    PcmFormat::new(SampleType::S16Le, 2, 44_100)
}

/// Decoder producing silence; song lengths are looked up by path.
pub(crate) struct FakeInput {
    default_total: u64,
    lengths: HashMap<PathBuf, u64>,
    reads: Arc<Mutex<Vec<(PathBuf, u64, u64)>>>,
}

impl FakeInput {
    pub(crate) fn new(default_total: u64) -> Self {
        Self {
            default_total,
            lengths: HashMap::new(),
            reads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn with_length(mut self, path: impl Into<PathBuf>, frames: u64) -> Self {
        self.lengths.insert(path.into(), frames);
        self
    }

    /// `(path, from, frames)` of every read.
    pub(crate) fn reads(&self) -> Arc<Mutex<Vec<(PathBuf, u64, u64)>>> {
        self.reads.clone()
    }
}

impl StreamInput for FakeInput {
    fn read_frames(&mut self, file: &AudioFile, from: u64, frames: u64) -> Result<PcmPacket> {
        lock(&self.reads).push((file.path().to_path_buf(), from, frames));
        let format = test_format();
        let pcm = vec![0; frames as usize * format.bytes_per_frame()];
        Ok(vec![PcmPacketUnit::new(format, from, pcm)])
    }

    fn calc_total_frames(&mut self, file: &AudioFile) -> Result<u64> {
        Ok(self
            .lengths
            .get(file.path())
            .copied()
            .unwrap_or(self.default_total))
    }

    fn read_tags(&mut self, file: &AudioFile) -> Result<AudioTags> {
        let mut tags = AudioTags::new();
        tags.insert("title".into(), file.path().display().to_string());
        Ok(tags)
    }
}

/// Output that records transport calls and never pulls.
#[derive(Default)]
pub(crate) struct RecordingOutput {
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl RecordingOutput {
    pub(crate) fn log(&self) -> Arc<Mutex<Vec<&'static str>>> {
        self.log.clone()
    }
}

impl StreamOutput for RecordingOutput {
    fn start_playback(&mut self) -> Result<()> {
        lock(&self.log).push("start");
        Ok(())
    }

    fn stop_playback(&mut self) -> Result<()> {
        lock(&self.log).push("stop");
        Ok(())
    }

    fn pause_playback(&mut self) -> Result<()> {
        lock(&self.log).push("pause");
        Ok(())
    }

    fn resume_playback(&mut self) -> Result<()> {
        lock(&self.log).push("resume");
        Ok(())
    }
}

pub(crate) struct NoopModule;

impl Module for NoopModule {}

/// Overwrites every byte it sees with a fixed value.
pub(crate) struct StampProcessor(pub(crate) u8);

impl SoundProcessor for StampProcessor {
    fn modify_packet(&mut self, unit: &mut PcmPacketUnit) -> bool {
        unit.pcm.fill(self.0);
        true
    }
}

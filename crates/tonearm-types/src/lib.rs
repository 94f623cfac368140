//! Value types shared by the engine, the CLI and in-process plugins.
//!
//! Everything here is plain data: PCM descriptions, component identifiers, playback state and
//! the events published through the hook dispatcher.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Frames in one packet period; the fill loop reads and refills in multiples of this.
pub const PCM_PACKET_PERIOD: u64 = 512;

/// Default PCM buffer capacity in frames.
pub const DEFAULT_BUFFER_FRAMES: u64 = PCM_PACKET_PERIOD * 32;

/// Tag map read from an audio file (`title`, `artist`, ...).
pub type AudioTags = BTreeMap<String, String>;

/// Sample encoding of a PCM stream.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SampleType {
    #[default]
    Unknown,
    /// 32-bit IEEE float.
    Float,
    S8,
    U8,
    S16Le,
    S16Be,
    U16Le,
    U16Be,
    /// Packed 24-bit (3 bytes per sample).
    S24Le,
    S24Be,
    U24Le,
    U24Be,
    S32Le,
    S32Be,
    U32Le,
    U32Be,
}

impl SampleType {
    /// Bytes per sample; `0` for [`SampleType::Unknown`].
    pub fn byte_width(self) -> usize {
        match self {
            SampleType::Unknown => 0,
            SampleType::S8 | SampleType::U8 => 1,
            SampleType::S16Le | SampleType::S16Be | SampleType::U16Le | SampleType::U16Be => 2,
            SampleType::S24Le | SampleType::S24Be | SampleType::U24Le | SampleType::U24Be => 3,
            SampleType::Float
            | SampleType::S32Le
            | SampleType::S32Be
            | SampleType::U32Le
            | SampleType::U32Be => 4,
        }
    }
}

/// Format of a contiguous run of interleaved PCM samples.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PcmFormat {
    /// Sample encoding.
    pub sample_type: SampleType,
    /// Interleaved channel count.
    pub channels: u16,
    /// Frames per second.
    pub sample_rate: u32,
}

impl PcmFormat {
    pub const fn new(sample_type: SampleType, channels: u16, sample_rate: u32) -> Self {
        Self {
            sample_type,
            channels,
            sample_rate,
        }
    }

    /// Sentinel reported when no format is known (for example an empty buffer).
    pub const fn unknown() -> Self {
        Self {
            sample_type: SampleType::Unknown,
            channels: 0,
            sample_rate: 0,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.bytes_per_frame() == 0 || self.sample_rate == 0
    }

    /// Bytes per interleaved frame (`channels * byte_width`).
    pub fn bytes_per_frame(&self) -> usize {
        self.sample_type.byte_width() * self.channels as usize
    }
}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}ch {}Hz",
            self.sample_type, self.channels, self.sample_rate
        )
    }
}

/// One contiguous span of decoded audio.
///
/// `frame_start..=frame_end` is the position range in the source file the samples were read
/// from. The range is only meaningful when the unit holds at least one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcmPacketUnit {
    pub format: PcmFormat,
    pub frame_start: u64,
    pub frame_end: u64,
    pub pcm: Vec<u8>,
}

impl PcmPacketUnit {
    /// Build a unit whose range starts at `frame_start` and covers every frame in `pcm`.
    ///
    /// Trailing bytes that do not form a whole frame are dropped.
    pub fn new(format: PcmFormat, frame_start: u64, mut pcm: Vec<u8>) -> Self {
        let width = format.bytes_per_frame();
        if width > 0 {
            pcm.truncate(pcm.len() - pcm.len() % width);
        }
        let mut unit = Self {
            format,
            frame_start,
            frame_end: frame_start,
            pcm,
        };
        unit.frame_end = frame_start + unit.frames().saturating_sub(1);
        unit
    }

    /// Whole frames held in `pcm`.
    pub fn frames(&self) -> u64 {
        match self.format.bytes_per_frame() {
            0 => 0,
            width => (self.pcm.len() / width) as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// Split after the first `frames` frames. `self` keeps the head; the tail is returned.
    ///
    /// The head covers `frame_start..=frame_start + frames - 1` and the tail resumes at the
    /// next position, so the two ranges never overlap.
    pub fn split_off(&mut self, frames: u64) -> PcmPacketUnit {
        let width = self.format.bytes_per_frame();
        let frames = frames.min(self.frames());
        let mut tail_pcm = self.pcm.split_off(frames as usize * width);
        if width > 0 {
            tail_pcm.truncate(tail_pcm.len() - tail_pcm.len() % width);
        }

        let tail_start = (self.frame_start + frames).min(self.frame_end.max(self.frame_start));
        let tail = PcmPacketUnit {
            format: self.format,
            frame_start: tail_start,
            frame_end: self.frame_end.max(tail_start),
            pcm: tail_pcm,
        };
        if frames > 0 {
            self.frame_end = (self.frame_start + frames - 1).min(self.frame_end);
        }
        tail
    }
}

/// Ordered units; the format may change between units (for example at a song boundary).
pub type PcmPacket = Vec<PcmPacketUnit>;

/// Total frames across every unit of a packet.
pub fn packet_frames(packet: &[PcmPacketUnit]) -> u64 {
    packet.iter().map(PcmPacketUnit::frames).sum()
}

/// Registry key of a component: the owning module plus the component id inside it.
///
/// Serialized as `"module/component"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ComponentName {
    pub module: String,
    pub component: String,
}

impl ComponentName {
    pub fn new(module: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            component: component.into(),
        }
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.component)
    }
}

impl FromStr for ComponentName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((module, component)) if !module.is_empty() && !component.is_empty() => {
                Ok(ComponentName::new(module.trim(), component.trim()))
            }
            _ => Err(format!("expected `module/component`, got `{s}`")),
        }
    }
}

impl TryFrom<String> for ComponentName {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ComponentName> for String {
    fn from(value: ComponentName) -> Self {
        value.to_string()
    }
}

/// Capability a component provides.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Plugin-wide lifecycle only; no audio role.
    Module,
    /// Transforms packets in place.
    SoundProcessor,
    /// Decodes audio files.
    StreamInput,
    /// Drives the output device.
    StreamOutput,
    /// Front-end widget; resolved by name only.
    Widget,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ComponentKind::Module => "module",
            ComponentKind::SoundProcessor => "sound_processor",
            ComponentKind::StreamInput => "stream_input",
            ComponentKind::StreamOutput => "stream_output",
            ComponentKind::Widget => "widget",
        };
        f.write_str(label)
    }
}

/// Transport state of the playback controller.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Discriminant used when installing hooks.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PlaybackChange,
    SongChange,
}

/// Payload delivered to installed hooks.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Transport state changed.
    PlaybackChange {
        from: PlaybackState,
        to: PlaybackState,
    },
    /// The playlist cursor moved to another entry. `from` is `None` when playback starts.
    SongChange { from: Option<usize>, to: usize },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::PlaybackChange { .. } => EventKind::PlaybackChange,
            Event::SongChange { .. } => EventKind::SongChange,
        }
    }
}

/// Point-in-time view of the playback controller.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaybackStatus {
    /// Current transport state.
    pub state: PlaybackState,
    /// Index of the entry the cursor points at, if a playlist is playing.
    pub playing_index: Option<usize>,
    /// Estimated playback position in frames of the current song.
    pub position_frames: Option<u64>,
    /// Total frames of the current song, when known.
    pub song_frames: Option<u64>,
    /// Sample rate of the most recently delivered packet.
    pub sample_rate: Option<u32>,
    /// Frames waiting in the PCM buffer.
    pub buffered_frames: u64,
    /// PCM buffer capacity in frames.
    pub buffer_capacity_frames: u64,
    /// Entries after the current one.
    pub playlist_left: usize,
}

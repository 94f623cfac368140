//! Playback state machine.
//!
//! Transport commands are queued to one consumer thread and applied in order. While playing, a
//! fill loop worker decodes from the stream input through the sound-processor chain into the
//! [`Buffer`]; the stream output drains the buffer from its own thread through [`PcmSource`].
//!
//! ## Lock order
//! playlist members, then cursor, then input, then dsp, then the buffer. The output lock is
//! taken before the state lock. Neither is held while taking a playlist lock.

mod fill;
mod position;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;

use tonearm_types::{ComponentKind, Event, PcmFormat, PcmPacket, PlaybackState, PlaybackStatus};

use crate::audio_file::AudioFile;
use crate::buffer::Buffer;
use crate::component::{Component, PcmSource};
use crate::error::EngineError;
use crate::hooks::HookDispatcher;
use crate::playlist::{Playlist, PlaylistObserver};
use crate::queue_thread::{BatchProcessor, QueueHandle, QueueThread};
use crate::sync::lock;
use crate::worker::{Worker, WorkerRuntime};

use position::PlayingPacket;

/// A queued transport request.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PlaybackCommand {
    Play,
    Stop,
    Pause,
    Resume,
    /// Fraction of the current song, `0.0..=1.0`.
    SeekAbs(f64),
    /// Offset from the current position as a fraction of the song, `-1.0..=1.0`.
    SeekRel(f64),
    SongAbs(usize),
    SongRel(i64),
}

/// Song and frame the fill loop reads next.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct FilledFramePos {
    pub(crate) song: usize,
    pub(crate) frame: u64,
}

impl FilledFramePos {
    /// Returns `true` when an entry after the cursor was inserted.
    fn on_insert(&mut self, pos: usize) -> bool {
        if pos <= self.song {
            self.song += 1;
            false
        } else {
            true
        }
    }

    /// Returns `true` when the playing entry itself was removed.
    fn on_erase(&mut self, pos: usize) -> bool {
        if pos < self.song {
            self.song -= 1;
            false
        } else if pos == self.song {
            self.frame = 0;
            true
        } else {
            false
        }
    }
}

pub(crate) struct PlaybackShared {
    buffer: Arc<Buffer>,
    hooks: Arc<HookDispatcher>,
    runtime: Arc<WorkerRuntime>,

    input: Mutex<Option<Component>>,
    output: Mutex<Option<Component>>,
    dsp: Mutex<Vec<Component>>,
    playlist: Mutex<Option<Arc<Playlist>>>,

    cursor: Mutex<FilledFramePos>,
    playing: Mutex<PlayingPacket>,
    state: Mutex<PlaybackState>,
    paused_at: AtomicU64,
    output_delay: AtomicU64,

    /// Started, but the output has not been told to start yet.
    starting: AtomicBool,
    /// Output paused by an underrun, waiting for the buffer to refill.
    frozen: AtomicBool,
    /// Set by the underrun handler; the fill loop performs the freeze.
    freeze_requested: AtomicBool,
    /// Every remaining frame of the playlist is already buffered.
    end_of_playlist: AtomicBool,

    fill: Mutex<Option<Worker>>,
    commands: OnceLock<QueueHandle<PlaybackCommand>>,
}

impl PlaybackShared {
    fn enqueue(&self, command: PlaybackCommand) {
        if let Some(commands) = self.commands.get() {
            commands.enqueue(command);
        }
    }

    fn state(&self) -> PlaybackState {
        *lock(&self.state)
    }

    fn set_state(&self, to: PlaybackState) {
        let from = std::mem::replace(&mut *lock(&self.state), to);
        if from != to {
            tracing::info!(?from, ?to, "playback state changed");
            self.hooks.publish(Event::PlaybackChange { from, to });
        }
    }

    fn playlist(&self) -> Option<Arc<Playlist>> {
        lock(&self.playlist).clone()
    }

    fn on_underrun(&self) {
        if self.end_of_playlist.load(Ordering::SeqCst) {
            tracing::debug!("underrun after the last song; stopping");
            self.enqueue(PlaybackCommand::Stop);
        } else {
            self.freeze_requested.store(true, Ordering::SeqCst);
            self.buffer.notify_refill();
        }
    }

    fn estimate(&self) -> u64 {
        lock(&self.playing).estimate(Instant::now(), self.output_delay.load(Ordering::SeqCst))
    }

    fn position(&self) -> Option<u64> {
        match self.state() {
            PlaybackState::Stopped => None,
            PlaybackState::Paused => Some(self.paused_at.load(Ordering::SeqCst)),
            PlaybackState::Playing => Some(self.estimate()),
        }
    }

    fn refresh_output_delay(&self) {
        let delay = lock(&self.output)
            .as_ref()
            .and_then(Component::stream_output)
            .map(|o| o.output_delay())
            .unwrap_or(0);
        self.output_delay.store(delay, Ordering::SeqCst);
    }

    fn apply(self: &Arc<Self>, command: PlaybackCommand) {
        tracing::debug!(?command, "playback command");
        match command {
            PlaybackCommand::Play => self.play(),
            PlaybackCommand::Stop => self.stop(),
            PlaybackCommand::Pause => self.pause(),
            PlaybackCommand::Resume => self.resume(),
            PlaybackCommand::SeekAbs(rate) => self.seek_abs(rate),
            PlaybackCommand::SeekRel(rate) => self.seek_rel(rate),
            PlaybackCommand::SongAbs(index) => self.song_abs(index),
            PlaybackCommand::SongRel(delta) => self.song_rel(delta),
        }
    }

    fn play(self: &Arc<Self>) {
        match self.state() {
            PlaybackState::Playing => return,
            PlaybackState::Paused => return self.resume(),
            PlaybackState::Stopped => {}
        }
        let Some(playlist) = self.playlist() else {
            tracing::debug!("play ignored: no playlist");
            return;
        };
        if lock(&self.input).is_none() || lock(&self.output).is_none() {
            tracing::warn!("play ignored: stream input or output not set");
            return;
        }
        {
            let members = playlist.members();
            if members.is_empty() {
                tracing::debug!("play ignored: playlist is empty");
                return;
            }
            *lock(&self.cursor) = FilledFramePos::default();
        }

        self.buffer.clear();
        self.buffer.reset_finish();
        self.end_of_playlist.store(false, Ordering::SeqCst);
        self.frozen.store(false, Ordering::SeqCst);
        self.freeze_requested.store(false, Ordering::SeqCst);
        self.starting.store(true, Ordering::SeqCst);
        {
            let mut playing = lock(&self.playing);
            playing.reset();
            playing.seeked_to = Some(0);
        }
        self.refresh_output_delay();

        self.hooks.publish(Event::SongChange { from: None, to: 0 });
        self.set_state(PlaybackState::Playing);
        let shared = self.clone();
        *lock(&self.fill) = Some(self.runtime.spawn("tonearm-fill", move || fill::run(shared)));
    }

    fn stop(&self) {
        if self.state() == PlaybackState::Stopped {
            return;
        }
        self.buffer.request_finish();
        let fill = lock(&self.fill).take();
        if let Some(worker) = fill {
            worker.join();
        }

        let device_started = !self.starting.swap(false, Ordering::SeqCst);
        {
            let mut output = lock(&self.output);
            if device_started
                && let Some(out) = output.as_mut().and_then(Component::as_stream_output)
                && let Err(e) = out.stop_playback()
            {
                tracing::warn!("output stop failed: {e:#}");
            }
            self.set_state(PlaybackState::Stopped);
        }
        self.frozen.store(false, Ordering::SeqCst);
        self.freeze_requested.store(false, Ordering::SeqCst);
        self.end_of_playlist.store(false, Ordering::SeqCst);
        self.buffer.clear();
        lock(&self.playing).reset();
    }

    fn pause(&self) {
        if self.state() != PlaybackState::Playing {
            return;
        }
        self.paused_at.store(self.estimate(), Ordering::SeqCst);
        let mut output = lock(&self.output);
        if !self.starting.load(Ordering::SeqCst)
            && !self.frozen.load(Ordering::SeqCst)
            && let Some(out) = output.as_mut().and_then(Component::as_stream_output)
            && let Err(e) = out.pause_playback()
        {
            tracing::warn!("output pause failed: {e:#}");
        }
        self.set_state(PlaybackState::Paused);
    }

    fn resume(&self) {
        if self.state() != PlaybackState::Paused {
            return;
        }
        lock(&self.playing).restart_clock(Instant::now());
        {
            let mut output = lock(&self.output);
            if !self.starting.load(Ordering::SeqCst)
                && !self.frozen.load(Ordering::SeqCst)
                && let Some(out) = output.as_mut().and_then(Component::as_stream_output)
                && let Err(e) = out.resume_playback()
            {
                tracing::warn!("output resume failed: {e:#}");
            }
            self.set_state(PlaybackState::Playing);
        }
        // The fill loop re-checks whether a pending start or un-freeze can happen now.
        self.buffer.notify_refill();
    }

    /// Total frames of the entry at the cursor. Caller holds the member and cursor locks.
    fn song_total(&self, file: &AudioFile) -> Option<u64> {
        let mut input = lock(&self.input);
        let decoder = input.as_mut().and_then(Component::as_stream_input)?;
        match file.total_frames(decoder) {
            Ok(total) => Some(total),
            Err(e) => {
                tracing::warn!(path = ?file.path(), "cannot determine length: {e:#}");
                None
            }
        }
    }

    /// Point the cursor at `target`, make it the reported position and drop buffered audio.
    fn jump(&self, cursor: &mut FilledFramePos, target: FilledFramePos, exhausted: bool) {
        *cursor = target;
        self.end_of_playlist.store(exhausted, Ordering::SeqCst);
        lock(&self.playing).seeked_to = Some(target.frame);
        self.buffer.clear();
    }

    fn seek_abs(&self, rate: f64) {
        if self.state() == PlaybackState::Stopped || !(0.0..=1.0).contains(&rate) {
            return;
        }
        let Some(playlist) = self.playlist() else {
            return;
        };
        let members = playlist.members();
        let mut cursor = lock(&self.cursor);
        let Some(total) = members.get(cursor.song).and_then(|f| self.song_total(f)) else {
            return;
        };
        let frame = ((total as f64 * rate) as u64).min(total);
        let song = cursor.song;
        self.jump(&mut cursor, FilledFramePos { song, frame }, false);
        tracing::debug!(song, frame, "seeked");
    }

    fn seek_rel(&self, rate: f64) {
        if self.state() == PlaybackState::Stopped || !(-1.0..=1.0).contains(&rate) {
            return;
        }
        let current = self.position().unwrap_or(0);
        let Some(playlist) = self.playlist() else {
            return;
        };
        let members = playlist.members();
        let mut cursor = lock(&self.cursor);
        let Some(total) = members.get(cursor.song).and_then(|f| self.song_total(f)) else {
            return;
        };

        let target = (current as f64 + total as f64 * rate).max(0.0) as u64;
        let song = cursor.song;
        if target < total {
            self.jump(&mut cursor, FilledFramePos { song, frame: target }, false);
        } else if song + 1 < members.len() {
            self.hooks.publish(Event::SongChange {
                from: Some(song),
                to: song + 1,
            });
            self.jump(&mut cursor, FilledFramePos { song: song + 1, frame: 0 }, false);
        } else {
            self.jump(&mut cursor, FilledFramePos { song, frame: total }, true);
        }
        tracing::debug!(song = cursor.song, frame = cursor.frame, "seeked relative");
    }

    fn change_song(&self, resolve: impl FnOnce(usize, usize) -> Option<usize>) {
        if self.state() == PlaybackState::Stopped {
            return;
        }
        let Some(playlist) = self.playlist() else {
            return;
        };
        let members = playlist.members();
        let mut cursor = lock(&self.cursor);
        let Some(to) = resolve(cursor.song, members.len()) else {
            return;
        };
        self.hooks.publish(Event::SongChange {
            from: Some(cursor.song),
            to,
        });
        self.jump(&mut cursor, FilledFramePos { song: to, frame: 0 }, false);
    }

    fn song_abs(&self, index: usize) {
        self.change_song(|_, len| (index < len).then_some(index));
    }

    fn song_rel(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        self.change_song(|song, len| {
            (song as i64)
                .checked_add(delta)
                .filter(|target| (0..len as i64).contains(target))
                .map(|target| target as usize)
        });
    }
}

impl PcmSource for PlaybackShared {
    fn filled_frames(&self) -> u64 {
        self.buffer.filled_frames()
    }

    fn pull_packet(&self, frames: u64) -> PcmPacket {
        let packet = self.buffer.cut(frames);
        if !packet.is_empty() {
            lock(&self.playing).refresh(&packet, Instant::now());
        }
        packet
    }

    fn pcm_format(&self) -> PcmFormat {
        self.buffer.next_format()
    }
}

impl PlaylistObserver for PlaybackShared {
    fn on_insert(&self, pos: usize, _len_after: usize) {
        let after_cursor = lock(&self.cursor).on_insert(pos);
        if after_cursor && self.end_of_playlist.swap(false, Ordering::SeqCst) {
            tracing::debug!(pos, "entry appended to an exhausted playlist; resuming fill");
            self.buffer.notify_refill();
        }
    }

    fn on_erase(&self, pos: usize, len_after: usize) {
        let erased_playing = lock(&self.cursor).on_erase(pos);
        if len_after == 0 {
            self.enqueue(PlaybackCommand::Stop);
        } else if erased_playing {
            self.end_of_playlist.store(false, Ordering::SeqCst);
            self.buffer.notify_refill();
        }
    }

    fn on_clear(&self) {
        *lock(&self.cursor) = FilledFramePos::default();
        self.enqueue(PlaybackCommand::Stop);
    }
}

struct CommandProcessor {
    shared: Arc<PlaybackShared>,
}

impl BatchProcessor<PlaybackCommand> for CommandProcessor {
    fn process(&mut self, batch: Vec<PlaybackCommand>) {
        for command in batch {
            self.shared.apply(command);
        }
    }
}

/// Public face of the playback state machine.
pub struct PlaybackController {
    shared: Arc<PlaybackShared>,
    commands: QueueThread<PlaybackCommand>,
}

impl PlaybackController {
    pub fn new(
        runtime: Arc<WorkerRuntime>,
        hooks: Arc<HookDispatcher>,
        buffer: Arc<Buffer>,
    ) -> Self {
        let shared = Arc::new(PlaybackShared {
            buffer,
            hooks,
            runtime,
            input: Mutex::new(None),
            output: Mutex::new(None),
            dsp: Mutex::new(Vec::new()),
            playlist: Mutex::new(None),
            cursor: Mutex::new(FilledFramePos::default()),
            playing: Mutex::new(PlayingPacket::default()),
            state: Mutex::new(PlaybackState::Stopped),
            paused_at: AtomicU64::new(0),
            output_delay: AtomicU64::new(0),
            starting: AtomicBool::new(false),
            frozen: AtomicBool::new(false),
            freeze_requested: AtomicBool::new(false),
            end_of_playlist: AtomicBool::new(false),
            fill: Mutex::new(None),
            commands: OnceLock::new(),
        });
        let commands = QueueThread::start(
            &shared.runtime,
            "tonearm-playback",
            CommandProcessor {
                shared: shared.clone(),
            },
        );
        let _ = shared.commands.set(commands.handle());

        let weak = Arc::downgrade(&shared);
        shared.buffer.set_underrun_handler(Some(Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.on_underrun();
            }
        })));
        Self { shared, commands }
    }

    fn send(&self, command: PlaybackCommand, blocking: bool) {
        self.commands.enqueue(command);
        if blocking {
            drop(self.commands.wait_empty());
        }
    }

    fn settle(&self) {
        drop(self.commands.wait_empty());
    }

    pub fn play(&self, blocking: bool) {
        self.send(PlaybackCommand::Play, blocking);
    }

    pub fn stop(&self, blocking: bool) {
        self.send(PlaybackCommand::Stop, blocking);
    }

    pub fn pause(&self, blocking: bool) {
        self.send(PlaybackCommand::Pause, blocking);
    }

    pub fn resume(&self, blocking: bool) {
        self.send(PlaybackCommand::Resume, blocking);
    }

    pub fn seek_abs(&self, rate: f64, blocking: bool) {
        self.send(PlaybackCommand::SeekAbs(rate), blocking);
    }

    pub fn seek_rel(&self, rate: f64, blocking: bool) {
        self.send(PlaybackCommand::SeekRel(rate), blocking);
    }

    pub fn song_abs(&self, index: usize, blocking: bool) {
        self.send(PlaybackCommand::SongAbs(index), blocking);
    }

    pub fn song_rel(&self, delta: i64, blocking: bool) {
        self.send(PlaybackCommand::SongRel(delta), blocking);
    }

    /// Current state, after every queued command has been applied.
    pub fn state(&self) -> PlaybackState {
        self.settle();
        self.shared.state()
    }

    /// Entry the cursor points at; `None` while stopped.
    pub fn playing_index(&self) -> Option<usize> {
        self.settle();
        if self.shared.state() == PlaybackState::Stopped {
            return None;
        }
        Some(lock(&self.shared.cursor).song)
    }

    /// Estimated audible frame of the current song; `None` while stopped.
    pub fn playback_pos(&self) -> Option<u64> {
        self.settle();
        self.shared.position()
    }

    /// Total frames of the entry at the cursor.
    pub fn playing_song_length(&self) -> Option<u64> {
        self.settle();
        let playlist = self.shared.playlist()?;
        let members = playlist.members();
        let cursor = lock(&self.shared.cursor);
        members.get(cursor.song).and_then(|f| self.shared.song_total(f))
    }

    /// Whether anything of the playlist is still waiting to be buffered.
    pub fn playlist_left(&self) -> bool {
        self.settle();
        !self.shared.end_of_playlist.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> PlaybackStatus {
        self.settle();
        let state = self.shared.state();
        let (playing_index, song_frames, playlist_left) = match self.shared.playlist() {
            Some(playlist) if state != PlaybackState::Stopped => {
                let members = playlist.members();
                let song = lock(&self.shared.cursor).song;
                (
                    Some(song),
                    members.get(song).and_then(|f| f.cached_total_frames()),
                    members.len().saturating_sub(song + 1),
                )
            }
            _ => (None, None, 0),
        };
        PlaybackStatus {
            state,
            playing_index,
            position_frames: self.shared.position(),
            song_frames,
            sample_rate: lock(&self.shared.playing).sample_rate(),
            buffered_frames: self.shared.buffer.filled_frames(),
            buffer_capacity_frames: self.shared.buffer.capacity(),
            playlist_left,
        }
    }

    /// Make `playlist` the playing playlist, stopping playback first.
    pub fn set_playlist(&self, playlist: Option<Arc<Playlist>>) {
        self.stop(true);
        let previous = std::mem::replace(&mut *lock(&self.shared.playlist), playlist.clone());
        if let Some(previous) = previous {
            previous.set_observer(None);
        }
        if let Some(playlist) = &playlist {
            let weak = Arc::downgrade(&self.shared);
            let observer: Weak<dyn PlaylistObserver> = weak;
            playlist.set_observer(Some(observer));
            tracing::debug!(
                playlist = %playlist.name(),
                entries = playlist.len(),
                "playlist activated"
            );
        }
        *lock(&self.shared.cursor) = FilledFramePos::default();
    }

    pub fn playlist(&self) -> Option<Arc<Playlist>> {
        self.shared.playlist()
    }

    /// Install the stream input. Stops playback first; returns the previous input.
    pub fn set_stream_input(
        &self,
        input: Option<Component>,
    ) -> Result<Option<Component>, EngineError> {
        if let Some(input) = &input {
            expect_kind(input, ComponentKind::StreamInput)?;
        }
        self.stop(true);
        Ok(std::mem::replace(&mut *lock(&self.shared.input), input))
    }

    /// Install the stream output. Stops playback first; returns the previous output.
    pub fn set_stream_output(
        &self,
        output: Option<Component>,
    ) -> Result<Option<Component>, EngineError> {
        if let Some(output) = &output {
            expect_kind(output, ComponentKind::StreamOutput)?;
        }
        self.stop(true);
        let previous = std::mem::replace(&mut *lock(&self.shared.output), output);
        self.shared.refresh_output_delay();
        Ok(previous)
    }

    /// Replace the sound-processor chain; returns the previous chain.
    pub fn set_dsp_chain(&self, chain: Vec<Component>) -> Result<Vec<Component>, EngineError> {
        for processor in &chain {
            expect_kind(processor, ComponentKind::SoundProcessor)?;
        }
        Ok(std::mem::replace(&mut *lock(&self.shared.dsp), chain))
    }

    /// Read side of the buffer for stream outputs.
    pub fn pcm_source(&self) -> Arc<dyn PcmSource> {
        self.shared.clone()
    }

    /// Stop, finish the command thread and hand back every installed component.
    pub fn shutdown(&self) -> Vec<Component> {
        self.stop(true);
        self.commands.finish();
        self.shared.buffer.set_underrun_handler(None);
        if let Some(playlist) = lock(&self.shared.playlist).take() {
            playlist.set_observer(None);
        }
        let mut components = Vec::new();
        components.extend(lock(&self.shared.input).take());
        components.extend(lock(&self.shared.output).take());
        components.append(&mut lock(&self.shared.dsp));
        components
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> FilledFramePos {
        *lock(&self.shared.cursor)
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        drop(self.shutdown());
    }
}

fn expect_kind(component: &Component, expected: ComponentKind) -> Result<(), EngineError> {
    if component.kind() == expected {
        Ok(())
    } else {
        Err(EngineError::WrongKind {
            name: component.name().clone(),
            expected,
            actual: component.kind(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{self, FakeInput, RecordingOutput, TestServices};
    use tonearm_types::{ComponentName, PCM_PACKET_PERIOD, packet_frames};

    struct Rig {
        services: TestServices,
        controller: PlaybackController,
        playlist: Arc<Playlist>,
        output_log: Arc<Mutex<Vec<&'static str>>>,
        reads: Arc<Mutex<Vec<(std::path::PathBuf, u64, u64)>>>,
    }

    impl Rig {
        fn new(songs: &[u64]) -> Self {
            let services = TestServices::new();
            let controller = PlaybackController::new(
                services.runtime.clone(),
                services.hooks.clone(),
                Arc::new(Buffer::default()),
            );

            let mut input = FakeInput::new(0);
            let playlist = Playlist::new(services.audio_files.clone(), "test");
            for (i, frames) in songs.iter().enumerate() {
                let path = format!("song-{i}.flac");
                input = input.with_length(&path, *frames);
                playlist.add(&path);
            }
            let reads = input.reads();
            let output = RecordingOutput::default();
            let output_log = output.log();

            let input = services.component(
                ComponentName::new("fake", "input"),
                crate::component::ComponentBody::StreamInput(Box::new(input)),
            );
            let output = services.component(
                ComponentName::new("fake", "output"),
                crate::component::ComponentBody::StreamOutput(Box::new(output)),
            );
            controller.set_stream_input(Some(input)).expect("input");
            controller.set_stream_output(Some(output)).expect("output");
            playlist.activate(&controller);

            Self {
                services,
                controller,
                playlist,
                output_log,
                reads,
            }
        }

        fn output_called(&self, call: &str) -> bool {
            lock(&self.output_log).iter().any(|c| *c == call)
        }

        fn buffer_full(&self) -> bool {
            self.controller.pcm_source().filled_frames() + PCM_PACKET_PERIOD > 16_384
        }
    }

    #[test]
    fn empty_playlist_stays_stopped() {
        let rig = Rig::new(&[]);
        rig.controller.play(true);
        assert_eq!(rig.controller.state(), PlaybackState::Stopped);
        assert_eq!(rig.controller.playing_index(), None);
        assert_eq!(rig.controller.playback_pos(), None);
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        let rig = Rig::new(&[100_000]);
        let c = &rig.controller;

        c.resume(true);
        c.pause(true);
        c.seek_abs(0.5, true);
        assert_eq!(c.state(), PlaybackState::Stopped);

        c.play(true);
        assert_eq!(c.state(), PlaybackState::Playing);
        c.resume(true);
        assert_eq!(c.state(), PlaybackState::Playing);
        c.pause(true);
        assert_eq!(c.state(), PlaybackState::Paused);
        c.pause(true);
        assert_eq!(c.state(), PlaybackState::Paused);
        c.play(true);
        assert_eq!(c.state(), PlaybackState::Playing);
        c.pause(true);
        c.stop(true);
        assert_eq!(c.state(), PlaybackState::Stopped);
        assert_eq!(rig.controller.pcm_source().filled_frames(), 0);
    }

    #[test]
    fn output_starts_once_buffered() {
        let rig = Rig::new(&[100_000]);
        rig.controller.play(true);
        assert!(testkit::wait_until(|| rig.output_called("start")));
        assert!(rig.controller.pcm_source().filled_frames() > 16_384 / 2);

        rig.controller.stop(true);
        assert!(rig.output_called("stop"));
    }

    #[test]
    fn short_playlist_starts_output_without_reaching_threshold() {
        let rig = Rig::new(&[1000]);
        rig.controller.play(true);
        assert!(testkit::wait_until(|| rig.output_called("start")));
        assert_eq!(rig.controller.pcm_source().filled_frames(), 1000);
        assert!(!rig.controller.playlist_left());
    }

    #[test]
    fn seek_sets_cursor_and_refills_from_there() {
        let rig = Rig::new(&[1000]);
        let c = &rig.controller;
        c.play(true);
        assert!(testkit::wait_until(|| c.pcm_source().filled_frames() == 1000));

        c.seek_abs(0.5, true);
        assert_eq!(c.playback_pos(), Some(500));
        assert!(testkit::wait_until(|| c.pcm_source().filled_frames() == 500));
        let packet = c.pcm_source().pull_packet(100);
        assert_eq!(packet[0].frame_start, 500);
        assert_eq!(packet_frames(&packet), 100);
        assert!(
            lock(&rig.reads)
                .iter()
                .any(|(path, from, _)| path.ends_with("song-0.flac") && *from == 500)
        );

        c.seek_abs(1.5, true);
        c.seek_abs(-0.1, true);
        assert_eq!(c.cursor().frame, 1000);
    }

    #[test]
    fn relative_seek_rolls_into_next_song() {
        let rig = Rig::new(&[100_000, 100_000]);
        let c = &rig.controller;
        c.play(true);
        c.seek_abs(0.5, true);
        assert_eq!(c.playback_pos(), Some(50_000));
        c.seek_rel(0.25, true);
        assert_eq!(c.playback_pos(), Some(75_000));
        c.seek_rel(-1.0, true);
        assert_eq!(c.playback_pos(), Some(0));
        c.seek_rel(0.75, true);
        c.seek_rel(0.5, true);
        assert_eq!(c.playing_index(), Some(1));
        assert_eq!(c.playback_pos(), Some(0));
        c.seek_rel(2.0, true);
        assert_eq!(c.playing_index(), Some(1));
    }

    #[test]
    fn song_changes_are_bounds_checked() {
        let rig = Rig::new(&[100_000, 100_000, 100_000]);
        let c = &rig.controller;
        c.play(true);
        c.song_abs(5, true);
        assert_eq!(c.playing_index(), Some(0));
        c.song_abs(2, true);
        assert_eq!(c.playing_index(), Some(2));
        assert_eq!(c.playback_pos(), Some(0));
        c.song_rel(-1, true);
        assert_eq!(c.playing_index(), Some(1));
        c.song_rel(-5, true);
        c.song_rel(2, true);
        assert_eq!(c.playing_index(), Some(1));
        assert_eq!(c.playing_song_length(), Some(100_000));
    }

    #[test]
    fn extreme_song_offsets_are_ignored() {
        let rig = Rig::new(&[100_000, 100_000, 100_000]);
        let c = &rig.controller;
        c.play(true);
        c.song_abs(1, true);

        // Applied directly so a panic fails the test rather than being caught by the queue thread.
        c.shared.song_rel(i64::MAX);
        c.shared.song_rel(i64::MIN);
        assert_eq!(c.playing_index(), Some(1));

        c.song_rel(i64::MAX, true);
        c.song_rel(i64::MIN, true);
        assert_eq!(c.playing_index(), Some(1));
        assert_eq!(c.state(), PlaybackState::Playing);
        c.song_rel(1, true);
        assert_eq!(c.playing_index(), Some(2));
    }

    #[test]
    fn playlist_left_sees_queued_commands() {
        let rig = Rig::new(&[1000]);
        let c = &rig.controller;
        c.play(true);
        assert!(testkit::wait_until(|| !c.playlist_left()));

        c.stop(false);
        assert!(c.playlist_left());
        assert_eq!(c.state(), PlaybackState::Stopped);
    }

    #[test]
    fn erasing_the_playing_entry_rewinds_without_moving() {
        let rig = Rig::new(&[100_000, 100_000, 100_000]);
        let c = &rig.controller;
        c.play(true);
        c.song_abs(1, true);
        assert!(testkit::wait_until(|| rig.buffer_full()));
        assert!(c.cursor().frame > 0);

        rig.playlist.erase(1);
        assert_eq!(c.cursor(), FilledFramePos { song: 1, frame: 0 });

        rig.playlist.insert(0, "intro.flac");
        assert_eq!(c.cursor().song, 2);
        rig.playlist.erase(0);
        assert_eq!(c.cursor().song, 1);
        rig.playlist.add("outro.flac");
        assert_eq!(c.cursor().song, 1);
    }

    #[test]
    fn clearing_the_playing_playlist_stops() {
        let rig = Rig::new(&[100_000]);
        rig.controller.play(true);
        rig.playlist.clear();
        assert!(testkit::wait_until(|| rig.controller.state() == PlaybackState::Stopped));
    }

    #[test]
    fn underrun_after_last_song_stops() {
        let rig = Rig::new(&[1000]);
        let c = &rig.controller;
        c.play(true);
        assert!(testkit::wait_until(|| rig.output_called("start")));

        let packet = c.pcm_source().pull_packet(2000);
        assert_eq!(packet_frames(&packet), 1000);
        assert!(testkit::wait_until(|| c.state() == PlaybackState::Stopped));
        assert!(rig.output_called("stop"));
    }

    #[test]
    fn underrun_mid_playlist_freezes_then_resumes() {
        let rig = Rig::new(&[100_000]);
        let c = &rig.controller;
        c.play(true);
        assert!(testkit::wait_until(|| rig.output_called("start")));

        let _ = c.pcm_source().pull_packet(50_000);
        assert!(testkit::wait_until(|| rig.output_called("pause")));
        assert!(testkit::wait_until(|| rig.output_called("resume")));
        assert_eq!(c.state(), PlaybackState::Playing);
    }

    #[test]
    fn events_reach_hooks() {
        let rig = Rig::new(&[600, 600]);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let owner = crate::component::ComponentId::next();
        rig.services.hooks.install(owner, tonearm_types::EventKind::PlaybackChange, {
            let sink = sink.clone();
            move |e| lock(&sink).push(e.clone())
        });
        rig.services
            .hooks
            .install(owner, tonearm_types::EventKind::SongChange, move |e| {
                lock(&sink).push(e.clone())
            });

        rig.controller.play(true);
        assert!(testkit::wait_until(|| !rig.controller.playlist_left()));
        rig.controller.stop(true);
        rig.services.hooks.flush();

        let events = lock(&events).clone();
        assert_eq!(events[0], Event::SongChange { from: None, to: 0 });
        assert_eq!(
            events[1],
            Event::PlaybackChange {
                from: PlaybackState::Stopped,
                to: PlaybackState::Playing
            }
        );
        assert!(events.contains(&Event::SongChange {
            from: Some(0),
            to: 1
        }));
        assert_eq!(
            events.last(),
            Some(&Event::PlaybackChange {
                from: PlaybackState::Playing,
                to: PlaybackState::Stopped
            })
        );
    }

    #[test]
    fn sound_processors_run_before_buffering() {
        let rig = Rig::new(&[1000]);
        let stamp = rig.services.component(
            ComponentName::new("fake", "stamp"),
            crate::component::ComponentBody::SoundProcessor(Box::new(testkit::StampProcessor(9))),
        );
        let previous = rig.controller.set_dsp_chain(vec![stamp]).expect("chain");
        assert!(previous.is_empty());

        rig.controller.play(true);
        assert!(testkit::wait_until(|| rig.controller.pcm_source().filled_frames() == 1000));
        let packet = rig.controller.pcm_source().pull_packet(1000);
        assert!(packet.iter().all(|u| u.pcm.iter().all(|b| *b == 9)));
    }

    #[test]
    fn wrong_component_kind_is_rejected() {
        let rig = Rig::new(&[10]);
        let output = rig.services.component(
            ComponentName::new("fake", "speaker"),
            crate::component::ComponentBody::StreamOutput(Box::new(RecordingOutput::default())),
        );
        let err = rig
            .controller
            .set_stream_input(Some(output))
            .expect_err("wrong kind");
        assert!(matches!(
            err,
            EngineError::WrongKind {
                expected: ComponentKind::StreamInput,
                actual: ComponentKind::StreamOutput,
                ..
            }
        ));
    }

    #[test]
    fn status_reports_snapshot() {
        let rig = Rig::new(&[1000, 2000]);
        assert_eq!(rig.controller.status().state, PlaybackState::Stopped);
        rig.controller.play(true);
        assert!(testkit::wait_until(|| !rig.controller.playlist_left()));
        let status = rig.controller.status();
        assert_eq!(status.state, PlaybackState::Playing);
        assert_eq!(status.buffer_capacity_frames, 16_384);
        assert_eq!(status.buffered_frames, 3000);
        assert_eq!(status.playing_index, Some(1));
        assert_eq!(status.song_frames, Some(2000));
        assert_eq!(status.playlist_left, 0);
    }
}

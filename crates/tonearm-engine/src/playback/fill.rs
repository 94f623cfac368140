//! The fill loop: decode ahead of the output device and keep the buffer topped up.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tonearm_types::{Event, PCM_PACKET_PERIOD, PlaybackState, packet_frames};

use super::{FilledFramePos, PlaybackCommand, PlaybackShared};
use crate::component::Component;
use crate::sync::lock;

enum Step {
    Continue,
    Idle,
}

pub(super) fn run(shared: Arc<PlaybackShared>) {
    tracing::debug!("fill loop started");
    loop {
        update_output_latch(&shared);
        if !shared.buffer.wait_refill() {
            break;
        }
        while shared.buffer.free_frames() >= PCM_PACKET_PERIOD
            && !shared.end_of_playlist.load(Ordering::SeqCst)
            && !shared.buffer.finish_requested()
        {
            if let Step::Idle = fill_once(&shared) {
                break;
            }
        }
    }
    tracing::debug!("fill loop finished");
}

/// Start or resume the output once enough is buffered; freeze it after an underrun.
fn update_output_latch(shared: &PlaybackShared) {
    if shared.freeze_requested.swap(false, Ordering::SeqCst)
        && !shared.starting.load(Ordering::SeqCst)
        && !shared.frozen.load(Ordering::SeqCst)
    {
        let mut output = lock(&shared.output);
        if *lock(&shared.state) == PlaybackState::Playing
            && let Some(out) = output.as_mut().and_then(Component::as_stream_output)
        {
            tracing::debug!(buffered = shared.buffer.filled_frames(), "freezing output until refilled");
            if let Err(e) = out.pause_playback() {
                tracing::warn!("output pause failed: {e:#}");
            }
            shared.frozen.store(true, Ordering::SeqCst);
        }
    }

    let starting = shared.starting.load(Ordering::SeqCst);
    let frozen = shared.frozen.load(Ordering::SeqCst);
    if !starting && !frozen {
        return;
    }

    let exhausted = shared.end_of_playlist.load(Ordering::SeqCst);
    let filled = shared.buffer.filled_frames();
    if starting && exhausted && filled == 0 {
        tracing::debug!("playlist produced no audio; stopping");
        shared.enqueue(PlaybackCommand::Stop);
        return;
    }
    if !shared.buffer.has_enough_packets() && !(exhausted && filled > 0) {
        return;
    }

    let mut output = lock(&shared.output);
    if *lock(&shared.state) != PlaybackState::Playing {
        return;
    }
    let Some(out) = output.as_mut().and_then(Component::as_stream_output) else {
        return;
    };
    if starting {
        match out.start_playback() {
            Ok(()) => tracing::debug!(buffered = filled, "output started"),
            Err(e) => tracing::warn!("output start failed: {e:#}"),
        }
        shared.starting.store(false, Ordering::SeqCst);
    } else {
        match out.resume_playback() {
            Ok(()) => tracing::debug!(buffered = filled, "output resumed after underrun"),
            Err(e) => tracing::warn!("output resume failed: {e:#}"),
        }
        shared.frozen.store(false, Ordering::SeqCst);
    }
}

/// Move the cursor past the current song. Marks the playlist exhausted after the last one.
fn finish_song(shared: &PlaybackShared, cursor: &mut FilledFramePos, len: usize) {
    if cursor.song + 1 < len {
        let from = cursor.song;
        cursor.song += 1;
        cursor.frame = 0;
        shared.hooks.publish(Event::SongChange {
            from: Some(from),
            to: cursor.song,
        });
    } else {
        shared.end_of_playlist.store(true, Ordering::SeqCst);
        tracing::debug!(songs = len, "whole playlist buffered");
    }
}

/// Decode at most one packet period at the cursor and append it.
fn fill_once(shared: &PlaybackShared) -> Step {
    let Some(playlist) = lock(&shared.playlist).clone() else {
        shared.end_of_playlist.store(true, Ordering::SeqCst);
        return Step::Idle;
    };
    let members = playlist.members();
    let mut cursor = lock(&shared.cursor);
    let Some(file) = members.get(cursor.song) else {
        shared.end_of_playlist.store(true, Ordering::SeqCst);
        return Step::Idle;
    };

    let mut input = lock(&shared.input);
    let Some(decoder) = input.as_mut().and_then(Component::as_stream_input) else {
        tracing::warn!("no stream input; nothing to buffer");
        shared.end_of_playlist.store(true, Ordering::SeqCst);
        return Step::Idle;
    };

    let total = match file.total_frames(decoder) {
        Ok(total) => total,
        Err(e) => {
            tracing::warn!(path = ?file.path(), "cannot determine length; skipping: {e:#}");
            finish_song(shared, &mut cursor, members.len());
            return Step::Continue;
        }
    };

    let frames_left = total.saturating_sub(cursor.frame);
    if frames_left == 0 {
        finish_song(shared, &mut cursor, members.len());
        return Step::Continue;
    }

    let mut packet = match decoder.read_frames(file, cursor.frame, frames_left.min(PCM_PACKET_PERIOD)) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::warn!(path = ?file.path(), frame = cursor.frame, "decode failed; skipping: {e:#}");
            finish_song(shared, &mut cursor, members.len());
            return Step::Continue;
        }
    };
    drop(input);

    let read = packet_frames(&packet);
    {
        let mut dsp = lock(&shared.dsp);
        for unit in packet.iter_mut() {
            for processor in dsp.iter_mut().filter_map(Component::as_sound_processor) {
                processor.modify_packet(unit);
            }
        }
    }

    cursor.frame = if read == 0 { total } else { cursor.frame + read };
    shared.buffer.append_packet(packet);
    if cursor.frame >= total {
        finish_song(shared, &mut cursor, members.len());
    }
    Step::Continue
}

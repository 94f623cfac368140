//! Bounded PCM buffer between the fill loop and the stream output.
//!
//! The producer (fill loop) appends decoded units while at least one packet period is free;
//! the consumer (the output device thread) cuts exact frame counts from the front.
//!
//! ## Contract
//! - `cut(n)` never blocks and returns `min(n, filled)` frames, splitting a straddling unit on
//!   a frame boundary.
//! - Asking for more than is buffered is an underrun: the handler fires once, then stays quiet
//!   until a non-empty append ends the depletion episode.
//! - Every structural change raises the refill signal the fill loop waits on.
//!
//! Size queries are snapshots; nothing ties a `filled_frames()` result to a later `cut()`.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use tonearm_types::{DEFAULT_BUFFER_FRAMES, PcmFormat, PcmPacket, PcmPacketUnit};

use crate::sync::{lock, wait};

pub type UnderrunHandler = Arc<dyn Fn() + Send + Sync>;

struct BufferState {
    units: VecDeque<PcmPacketUnit>,
    filled: u64,
    depleted: bool,
}

struct RefillState {
    need_fill: bool,
    finish: bool,
}

/// Thread-safe queue of PCM units bounded by a frame capacity.
pub struct Buffer {
    capacity: u64,
    state: Mutex<BufferState>,
    refill: Mutex<RefillState>,
    refill_cv: Condvar,
    underrun: Mutex<Option<UnderrunHandler>>,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_FRAMES)
    }
}

impl Buffer {
    pub fn new(capacity_frames: u64) -> Self {
        Self {
            capacity: capacity_frames,
            state: Mutex::new(BufferState {
                units: VecDeque::new(),
                filled: 0,
                depleted: false,
            }),
            refill: Mutex::new(RefillState {
                need_fill: true,
                finish: false,
            }),
            refill_cv: Condvar::new(),
            underrun: Mutex::new(None),
        }
    }

    /// Capacity in frames.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn set_underrun_handler(&self, handler: Option<UnderrunHandler>) {
        *lock(&self.underrun) = handler;
    }

    /// Append one unit. Appends are not capped; the producer checks `free_frames()` first.
    pub fn append(&self, unit: PcmPacketUnit) {
        let frames = unit.frames();
        if frames == 0 {
            return;
        }
        {
            let mut st = lock(&self.state);
            st.units.push_back(unit);
            st.filled += frames;
            st.depleted = false;
        }
        self.notify_refill();
    }

    pub fn append_packet(&self, packet: PcmPacket) {
        for unit in packet {
            self.append(unit);
        }
    }

    /// Remove up to `frames` frames from the front.
    pub fn cut(&self, frames: u64) -> PcmPacket {
        let mut st = lock(&self.state);
        if frames > st.filled && !st.depleted {
            st.depleted = true;
            let handler = lock(&self.underrun).clone();
            if let Some(handler) = handler {
                drop(st);
                tracing::debug!(requested = frames, "buffer underrun");
                handler();
                st = lock(&self.state);
            }
        }

        let mut remaining = frames.min(st.filled);
        let mut out = Vec::new();
        while remaining > 0 {
            let Some(mut unit) = st.units.pop_front() else {
                break;
            };
            let unit_frames = unit.frames();
            if unit_frames <= remaining {
                remaining -= unit_frames;
                st.filled -= unit_frames;
                out.push(unit);
            } else {
                let tail = unit.split_off(remaining);
                st.filled -= remaining;
                remaining = 0;
                out.push(unit);
                st.units.push_front(tail);
            }
        }
        drop(st);
        self.notify_refill();
        out
    }

    pub fn clear(&self) {
        {
            let mut st = lock(&self.state);
            st.units.clear();
            st.filled = 0;
        }
        self.notify_refill();
    }

    pub fn filled_frames(&self) -> u64 {
        lock(&self.state).filled
    }

    /// Free space in frames, clamped at zero.
    pub fn free_frames(&self) -> u64 {
        self.capacity.saturating_sub(self.filled_frames())
    }

    /// Format of the first queued unit, or [`PcmFormat::unknown`] when empty.
    pub fn next_format(&self) -> PcmFormat {
        lock(&self.state)
            .units
            .front()
            .map(|u| u.format)
            .unwrap_or_else(PcmFormat::unknown)
    }

    /// Whether more than half the capacity is filled.
    pub fn has_enough_packets(&self) -> bool {
        self.filled_frames() > self.capacity / 2
    }

    /// Raise the refill signal.
    pub fn notify_refill(&self) {
        lock(&self.refill).need_fill = true;
        self.refill_cv.notify_all();
    }

    /// Block until a refill is signalled. Returns `false` once finish was requested.
    pub fn wait_refill(&self) -> bool {
        let mut st = lock(&self.refill);
        while !st.need_fill && !st.finish {
            st = wait(&self.refill_cv, st);
        }
        if st.finish {
            return false;
        }
        st.need_fill = false;
        true
    }

    pub fn finish_requested(&self) -> bool {
        lock(&self.refill).finish
    }

    /// Ask the fill loop to exit.
    pub fn request_finish(&self) {
        lock(&self.refill).finish = true;
        self.refill_cv.notify_all();
    }

    /// Re-arm the refill signal for a new fill session.
    pub fn reset_finish(&self) {
        let mut st = lock(&self.refill);
        st.finish = false;
        st.need_fill = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;
    use tonearm_types::{PCM_PACKET_PERIOD, SampleType, packet_frames};

    fn fmt() -> PcmFormat {
        PcmFormat::new(SampleType::S16Le, 2, 48_000)
    }

    fn unit(start: u64, frames: u64) -> PcmPacketUnit {
        let bytes = (0..frames * 4).map(|i| (i % 251) as u8).collect();
        PcmPacketUnit::new(fmt(), start, bytes)
    }

    #[test]
    fn cut_splits_on_frame_boundary() {
        let buf = Buffer::default();
        for i in 0..3 {
            buf.append(unit(i * 512, 512));
        }
        let out = buf.cut(1000);
        assert_eq!(packet_frames(&out), 1000);
        assert_eq!(buf.filled_frames(), 536);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].frame_start, 512);
        assert_eq!(out[1].frame_end, 999);

        let rest = buf.cut(10_000);
        assert_eq!(packet_frames(&rest), 536);
        assert_eq!(rest[0].frame_start, 1000);
        assert_eq!(rest.last().map(|u| u.frame_end), Some(1535));
    }

    #[test]
    fn filled_plus_free_is_capacity() {
        let buf = Buffer::default();
        let mut next = 0;
        for step in 0..40u64 {
            if step % 3 == 2 {
                let _ = buf.cut(700);
            } else {
                buf.append(unit(next, 512));
                next += 512;
            }
            let filled = buf.filled_frames();
            if filled <= buf.capacity() {
                assert_eq!(filled + buf.free_frames(), buf.capacity());
            }
        }
    }

    #[test]
    fn free_frames_clamps_at_zero() {
        let buf = Buffer::default();
        let mut appended = 0;
        while appended < 20_000 {
            buf.append(unit(appended, PCM_PACKET_PERIOD));
            appended += PCM_PACKET_PERIOD;
        }
        assert!(buf.filled_frames() > buf.capacity());
        assert_eq!(buf.free_frames(), 0);
    }

    #[test]
    fn cut_preserves_bytes_and_range_continuity() {
        let buf = Buffer::default();
        let mut original = Vec::new();
        let mut next = 0;
        for frames in [100, 333, 512, 7, 260] {
            let u = unit(next, frames);
            original.extend_from_slice(&u.pcm);
            next += frames;
            buf.append(u);
        }

        let mut bytes = Vec::new();
        let mut expect_start = 0;
        for n in [50, 200, 1, 600, 361] {
            for u in buf.cut(n) {
                assert_eq!(u.frame_start, expect_start);
                assert_eq!(u.frame_end, u.frame_start + u.frames() - 1);
                expect_start = u.frame_end + 1;
                bytes.extend_from_slice(&u.pcm);
            }
        }
        assert_eq!(expect_start, next);
        assert_eq!(bytes, original);
    }

    #[test]
    fn underrun_fires_once_per_episode() {
        let buf = Buffer::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_handler = fired.clone();
        buf.set_underrun_handler(Some(Arc::new(move || {
            fired_handler.fetch_add(1, Ordering::SeqCst);
        })));

        buf.append(unit(0, 100));
        assert_eq!(packet_frames(&buf.cut(300)), 100);
        let _ = buf.cut(300);
        let _ = buf.cut(1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        buf.append(unit(100, 50));
        let _ = buf.cut(10);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let _ = buf.cut(100);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn next_format_reports_unknown_when_empty() {
        let buf = Buffer::default();
        assert!(buf.next_format().is_unknown());
        buf.append(unit(0, 4));
        assert_eq!(buf.next_format(), fmt());
        buf.clear();
        assert!(buf.next_format().is_unknown());
        assert_eq!(buf.filled_frames(), 0);
    }

    #[test]
    fn has_enough_packets_uses_half_capacity() {
        let buf = Buffer::new(1024);
        buf.append(unit(0, 512));
        assert!(!buf.has_enough_packets());
        buf.append(unit(512, 1));
        assert!(buf.has_enough_packets());
    }

    #[test]
    fn wait_refill_wakes_on_cut_and_on_finish() {
        let buf = Arc::new(Buffer::default());
        assert!(buf.wait_refill());

        let waiter = {
            let buf = buf.clone();
            thread::spawn(move || buf.wait_refill())
        };
        thread::sleep(Duration::from_millis(10));
        let _ = buf.cut(0);
        assert!(waiter.join().expect("join"));

        let waiter = {
            let buf = buf.clone();
            thread::spawn(move || buf.wait_refill())
        };
        thread::sleep(Duration::from_millis(10));
        buf.request_finish();
        assert!(!waiter.join().expect("join"));

        buf.reset_finish();
        assert!(buf.wait_refill());
    }
}

//! Playback position estimation from the most recently delivered packet.

use std::time::Instant;

use tonearm_types::PcmPacketUnit;

#[derive(Clone, Copy, Debug)]
struct DeliveredUnit {
    start: u64,
    end: u64,
    rate: u32,
}

/// What the output device pulled last, and when.
#[derive(Debug, Default)]
pub(crate) struct PlayingPacket {
    units: Vec<DeliveredUnit>,
    delivered_at: Option<Instant>,
    /// Authoritative position after a seek or song change, until the next delivery.
    pub(crate) seeked_to: Option<u64>,
    last_estimate: u64,
}

impl PlayingPacket {
    pub(crate) fn refresh(&mut self, packet: &[PcmPacketUnit], now: Instant) {
        self.units = packet
            .iter()
            .map(|u| DeliveredUnit {
                start: u.frame_start,
                end: u.frame_end,
                rate: u.format.sample_rate,
            })
            .collect();
        self.delivered_at = Some(now);
        self.seeked_to = None;
    }

    /// Restart the clock, so time spent paused does not count as playback.
    pub(crate) fn restart_clock(&mut self, now: Instant) {
        if self.delivered_at.is_some() {
            self.delivered_at = Some(now);
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn sample_rate(&self) -> Option<u32> {
        self.units.last().map(|u| u.rate).filter(|r| *r > 0)
    }

    /// Estimated source frame currently audible, net of `output_delay`.
    pub(crate) fn estimate(&mut self, now: Instant, output_delay: u64) -> u64 {
        if let Some(frame) = self.seeked_to {
            return frame;
        }
        let Some(delivered_at) = self.delivered_at else {
            return self.last_estimate;
        };

        let mut remaining = now.saturating_duration_since(delivered_at).as_secs_f64();
        let mut current = None;
        for unit in self.units.iter().filter(|u| u.rate > 0) {
            let frames = unit.end - unit.start + 1;
            let duration = frames as f64 / unit.rate as f64;
            if remaining >= duration {
                remaining -= duration;
                current = Some(unit.end);
                continue;
            }
            current = Some(unit.start + (remaining * unit.rate as f64) as u64);
            break;
        }

        match current {
            Some(frame) => {
                self.last_estimate = frame.saturating_sub(output_delay);
                self.last_estimate
            }
            None => self.last_estimate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tonearm_types::{PcmFormat, SampleType};

    fn unit(start: u64, frames: u64, rate: u32) -> PcmPacketUnit {
        let format = PcmFormat::new(SampleType::S16Le, 2, rate);
        PcmPacketUnit::new(format, start, vec![0; frames as usize * 4])
    }

    #[test]
    fn seeked_to_wins_until_next_delivery() {
        let mut playing = PlayingPacket::default();
        let t0 = Instant::now();
        playing.seeked_to = Some(500);
        assert_eq!(playing.estimate(t0, 0), 500);

        playing.refresh(&[unit(500, 1000, 1000)], t0);
        assert_eq!(playing.seeked_to, None);
        assert_eq!(playing.estimate(t0, 0), 500);
    }

    #[test]
    fn extrapolates_from_elapsed_time() {
        let mut playing = PlayingPacket::default();
        let t0 = Instant::now();
        playing.refresh(&[unit(0, 1000, 1000), unit(1000, 1000, 1000)], t0);

        assert_eq!(playing.estimate(t0 + Duration::from_millis(250), 0), 250);
        assert_eq!(playing.estimate(t0 + Duration::from_millis(1500), 0), 1500);
        assert_eq!(playing.estimate(t0 + Duration::from_millis(1500), 100), 1400);
        // Past the end of what was delivered: clamp to the last frame.
        assert_eq!(playing.estimate(t0 + Duration::from_secs(10), 0), 1999);
    }

    #[test]
    fn output_delay_clamps_at_zero() {
        let mut playing = PlayingPacket::default();
        let t0 = Instant::now();
        playing.refresh(&[unit(10, 100, 1000)], t0);
        assert_eq!(playing.estimate(t0, 500), 0);
    }

    #[test]
    fn falls_back_to_previous_estimate() {
        let mut playing = PlayingPacket::default();
        let t0 = Instant::now();
        assert_eq!(playing.estimate(t0, 0), 0);

        playing.refresh(&[unit(0, 1000, 1000)], t0);
        assert_eq!(playing.estimate(t0 + Duration::from_millis(100), 0), 100);
        playing.refresh(&[unit(0, 4, 0)], t0);
        assert_eq!(playing.estimate(t0 + Duration::from_millis(200), 0), 100);
    }

    #[test]
    fn restart_clock_discards_paused_time() {
        let mut playing = PlayingPacket::default();
        let t0 = Instant::now();
        playing.refresh(&[unit(0, 1000, 1000)], t0);
        let resumed = t0 + Duration::from_secs(5);
        playing.restart_clock(resumed);
        assert_eq!(playing.estimate(resumed + Duration::from_millis(10), 0), 10);
        assert_eq!(playing.sample_rate(), Some(1000));
    }
}

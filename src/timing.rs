use std::time::{Duration, Instant};

use crate::packet::{Packet, PacketKind};

/// MPEG-TS PTS clock rate.
pub const PTS_CLOCK_RATE: u64 = 90_000;
/// Largest encodable PTS value (33 bits).
pub const MAX_PTS: u64 = (1 << 33) - 1;
/// Wall-clock span of the PTS range, ~26.5 hours.
pub const MAX_PTS_SPAN: Duration = Duration::from_millis(MAX_PTS / 90);
/// Composition time applied to keyframes that arrive with none.
const DEFAULT_CTS: Duration = Duration::from_millis(2);
/// PCR drift tolerated before anything is reported.
const MAX_DRIFT: Duration = Duration::from_millis(10);
/// Extra tolerance before a drift report escalates to a warning.
const WARN_BUFFER: Duration = Duration::from_millis(80);
/// Minimum spacing between keyframe-triggered base resets.
const MIN_KEYFRAME_INTERVAL: Duration = Duration::from_secs(2);
/// Wall-clock gap that invalidates the PCR sampling state.
const MAX_PCR_GAP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default)]
pub struct TimingStats {
    pub total_packets: u64,
    pub corrected_packets: u64,
    pub pcr_drifts: u64,
    pub pts_wraps: u64,
}

/// Rewrites per-packet presentation times into a monotonic, base-aligned,
/// wrap-safe timeline for an MPEG-TS egress. One instance per stream;
/// video and audio monotonicity are tracked independently.
pub struct TimingNormalizer {
    base_time: Option<Duration>,
    last_video: Duration,
    last_audio: Duration,
    last_keyframe_reset: Option<Instant>,
    last_pcr_at: Option<Instant>,
    last_pcr: Duration,
    stats: TimingStats,
}

impl TimingNormalizer {
    pub fn new() -> Self {
        Self {
            base_time: None,
            last_video: Duration::ZERO,
            last_audio: Duration::ZERO,
            last_keyframe_reset: None,
            last_pcr_at: None,
            last_pcr: Duration::ZERO,
            stats: TimingStats::default(),
        }
    }

    pub fn stats(&self) -> TimingStats {
        self.stats
    }

    pub fn base_time(&self) -> Option<Duration> {
        self.base_time
    }

    pub fn process(&mut self, pkt: &mut Packet) {
        self.process_at(pkt, Instant::now())
    }

    fn process_at(&mut self, pkt: &mut Packet, now: Instant) {
        self.stats.total_packets += 1;

        self.validate_basic(pkt);
        self.set_base_time(pkt, now);
        self.normalize(pkt);
        self.enforce_monotonicity(pkt);
        self.validate_final(pkt);

        if pkt.kind == PacketKind::Video {
            self.monitor_pcr(pkt.time, now);
        }
    }

    fn validate_basic(&mut self, pkt: &mut Packet) {
        if pkt.keyframe && pkt.composition_time.is_zero() {
            pkt.composition_time = DEFAULT_CTS;
        }
    }

    fn set_base_time(&mut self, pkt: &Packet, now: Instant) {
        if self.base_time.is_some() || !pkt.keyframe || pkt.time.is_zero() {
            return;
        }
        let allow = match self.last_keyframe_reset {
            None => true,
            Some(last) => now.saturating_duration_since(last) > MIN_KEYFRAME_INTERVAL,
        };
        if allow {
            self.base_time = Some(pkt.time);
            self.last_keyframe_reset = Some(now);
            log::info!("Timing base set: {:?}", pkt.time);
        }
    }

    fn normalize(&mut self, pkt: &mut Packet) {
        if let Some(base) = self.base_time {
            pkt.time = pkt.time.saturating_sub(base);
        }
    }

    fn enforce_monotonicity(&mut self, pkt: &mut Packet) {
        let last = match pkt.kind {
            PacketKind::Video => &mut self.last_video,
            PacketKind::Audio => &mut self.last_audio,
        };
        if pkt.time < *last {
            pkt.time = *last + Duration::from_millis(1);
            self.stats.corrected_packets += 1;
        }
        *last = pkt.time;
    }

    fn validate_final(&mut self, pkt: &mut Packet) {
        while pkt.time >= MAX_PTS_SPAN {
            pkt.time -= MAX_PTS_SPAN;
            // fold the wrap into the base so the following packets come
            // out already reduced and the event is counted once
            self.base_time = Some(match self.base_time {
                Some(base) => base + MAX_PTS_SPAN,
                None => MAX_PTS_SPAN,
            });
            self.last_video = self.last_video.saturating_sub(MAX_PTS_SPAN);
            self.last_audio = self.last_audio.saturating_sub(MAX_PTS_SPAN);
            self.stats.pts_wraps += 1;
            log::info!("PTS wrap: {:?}", pkt.time);
        }

        if !pkt.composition_time.is_zero() && pkt.time < pkt.composition_time {
            pkt.composition_time = Duration::ZERO;
            self.stats.corrected_packets += 1;
        }
    }

    fn monitor_pcr(&mut self, current: Duration, now: Instant) {
        let (last_at, last_val) = match self.last_pcr_at {
            Some(at) => (at, self.last_pcr),
            None => {
                log::debug!("First PCR sample: {:?}", current);
                self.last_pcr_at = Some(now);
                self.last_pcr = current;
                return;
            }
        };

        let since_last = now.saturating_duration_since(last_at);
        if since_last > MAX_PCR_GAP {
            log::warn!("Large gap since last PCR sample: {:?}", since_last);
            self.reset_pcr_state(now, current);
            return;
        }

        if current < last_val {
            log::warn!("Non-monotonic PCR: {:?} < {:?}", current, last_val);
            self.reset_pcr_state(now, current);
            return;
        }

        let expected = current - last_val;
        let drift = abs_diff(since_last, expected);

        if drift > Duration::from_secs(1) {
            log::error!(
                "Critical PCR drift: {:?} (expected {:?}, actual {:?})",
                drift,
                expected,
                since_last
            );
            self.reset_pcr_state(now, current);
            return;
        } else if drift > Duration::from_millis(100) {
            log::warn!(
                "PCR drift: {:?} (expected {:?}, actual {:?})",
                drift,
                expected,
                since_last
            );
            self.stats.pcr_drifts += 1;
        } else if drift > MAX_DRIFT + WARN_BUFFER {
            log::info!(
                "PCR drift: {:?} (expected {:?}, actual {:?})",
                drift,
                expected,
                since_last
            );
            self.stats.pcr_drifts += 1;
        }

        self.last_pcr_at = Some(now);
        self.last_pcr = current;
    }

    fn reset_pcr_state(&mut self, now: Instant, current: Duration) {
        self.last_pcr_at = Some(now);
        self.last_pcr = current;
    }
}

impl Default for TimingNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

fn abs_diff(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    fn video(time_ms: u64, keyframe: bool) -> Packet {
        Packet::video(time_ms, 0, keyframe, vec![0u8])
    }

    fn audio(time_ms: u64) -> Packet {
        Packet::audio(time_ms, vec![0u8])
    }

    #[test]
    fn base_aligned_timeline_starts_at_zero() {
        let mut tn = TimingNormalizer::new();

        let mut first = video(5_000, true);
        tn.process(&mut first);
        assert_eq!(first.time, Duration::ZERO);

        let mut later = video(5_000 + 33_333, false);
        tn.process(&mut later);
        assert_eq!(later.time, Duration::from_millis(33_333));
    }

    #[test]
    fn monotonic_input_stays_monotonic_on_both_streams() {
        let mut tn = TimingNormalizer::new();
        let mut last_video = Duration::ZERO;
        let mut last_audio = Duration::ZERO;

        tn.process(&mut video(1_000, true));
        for i in 0..100u64 {
            let mut v = video(1_000 + i * 33, false);
            let mut a = audio(1_000 + i * 21);
            tn.process(&mut v);
            tn.process(&mut a);
            assert!(v.time >= last_video);
            assert!(a.time >= last_audio);
            last_video = v.time;
            last_audio = a.time;
        }
    }

    #[test]
    fn regression_becomes_last_plus_one_ms() {
        let mut tn = TimingNormalizer::new();
        tn.process(&mut video(1_000, true));
        let corrected_before = tn.stats().corrected_packets;

        let mut a = video(1_200, false);
        tn.process(&mut a);
        assert_eq!(a.time, Duration::from_millis(200));

        // source timestamp jumped backwards
        let mut b = video(1_100, false);
        tn.process(&mut b);
        assert_eq!(b.time, Duration::from_millis(201));
        assert_eq!(tn.stats().corrected_packets, corrected_before + 1);

        let mut c = video(1_300, false);
        tn.process(&mut c);
        assert_eq!(c.time, Duration::from_millis(300));
    }

    #[test]
    fn streams_are_corrected_independently() {
        let mut tn = TimingNormalizer::new();
        tn.process(&mut video(1_000, true));
        tn.process(&mut video(1_500, false));

        // audio far behind video is left alone
        let mut a = audio(1_100);
        tn.process(&mut a);
        assert_eq!(a.time, Duration::from_millis(100));
    }

    #[test]
    fn base_ignores_non_keyframes_and_zero_times() {
        let mut tn = TimingNormalizer::new();

        tn.process(&mut video(700, false));
        assert!(tn.base_time().is_none());

        tn.process(&mut video(0, true));
        assert!(tn.base_time().is_none());

        tn.process(&mut video(800, true));
        assert_eq!(tn.base_time(), Some(Duration::from_millis(800)));
    }

    #[test]
    fn keyframe_with_zero_cts_gets_default() {
        let mut tn = TimingNormalizer::new();
        let mut kf = Packet::video(5_000, 0, true, vec![0u8]);
        tn.process(&mut kf);
        assert_eq!(kf.composition_time, Duration::from_millis(2));
    }

    #[test]
    fn cts_larger_than_emitted_time_is_zeroed() {
        let mut tn = TimingNormalizer::new();
        tn.process(&mut video(5_000, true));

        let mut p = Packet::video(5_010, 500, false, vec![0u8]);
        tn.process(&mut p);
        assert_eq!(p.time, Duration::from_millis(10));
        assert_eq!(p.composition_time, Duration::ZERO);
    }

    #[test]
    fn wrap_is_contained_and_counted_once() {
        let mut tn = TimingNormalizer::new();
        let span_ms = MAX_PTS_SPAN.as_millis() as u64;

        tn.process(&mut video(1_000, true));

        let mut near = video(1_000 + span_ms - 5, false);
        tn.process(&mut near);
        assert!(near.time < MAX_PTS_SPAN);
        assert_eq!(tn.stats().pts_wraps, 0);

        let mut over = video(1_000 + span_ms + 5, false);
        tn.process(&mut over);
        assert!(over.time < MAX_PTS_SPAN);
        assert_eq!(tn.stats().pts_wraps, 1);

        // the timeline keeps running in the wrapped domain without
        // triggering again
        let mut after = video(1_000 + span_ms + 40, false);
        tn.process(&mut after);
        assert!(after.time < MAX_PTS_SPAN);
        assert!(after.time >= over.time);
        assert_eq!(tn.stats().pts_wraps, 1);
    }

    #[test]
    fn counters_track_total_packets() {
        let mut tn = TimingNormalizer::new();
        for i in 0..10u64 {
            tn.process(&mut video(1_000 + i * 33, i == 0));
        }
        assert_eq!(tn.stats().total_packets, 10);
    }
}

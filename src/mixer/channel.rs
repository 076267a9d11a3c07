// channel.rs - Playback channel state and per-callback mixing

//! Playback channels.
//!
//! A `Channel` is a slot that binds one shared source and owns everything
//! about its playback: loop counter, timeout, fade state, per-channel
//! volume and rate, read position, the cached conversion descriptor, and
//! the per-channel filter chain. Its `mix` operation produces the
//! channel's contribution to one device callback.
//!
//! Channels are created by the engine at allocation time and live until
//! the channel count shrinks or the engine shuts down. Binding a new
//! source replaces the previous playback, which fires its finished
//! handlers first.

use std::sync::Arc;

use crate::mixer::convert::{self, convert_mix, Converter};
use crate::mixer::source::SharedSource;
use crate::mixer::types::{
    AudioFormat, ChannelState, FadeKind, FilterId, HookId, MixerError, MixerResult, SampleFormat,
    INFINITE, MAX_VOLUME,
};

/// Callback invoked with the channel index when playback finishes.
pub type FinishedHook = Arc<dyn Fn(usize) + Send + Sync>;

/// A filter over accumulator samples: `(buffer, frames, format)`.
///
/// Filters always see the mixer format; per-channel filters run on the
/// post-conversion view of the channel's contribution.
pub type FilterFn = Arc<dyn Fn(&mut [i32], usize, &AudioFormat) + Send + Sync>;

/// Per-callback context handed to `Channel::mix` by the engine.
pub(crate) struct MixContext<'a> {
    pub format: AudioFormat,
    pub now_ms: u64,
    pub pre_filters: &'a [(FilterId, FilterFn)],
    pub on_finished: Option<&'a FinishedHook>,
}

pub struct Channel {
    index: usize,
    state: ChannelState,
    source: Option<SharedSource>,
    volume: i32,
    rate: f32,
    loops: i32,
    timeout_ms: i32,
    fade: FadeKind,
    fade_start_ms: u64,
    fade_duration_ms: u64,
    fade_start_volume: i32,
    position: u64,
    start_time_ms: u64,
    convert: bool,
    cvt: Option<Converter>,
    cvt_src_freq: u32,
    in_buf: Vec<u8>,
    filter_buf: Vec<i32>,
    filters: Vec<(FilterId, FilterFn)>,
    finished: Vec<(HookId, FinishedHook)>,
}

impl Channel {
    pub(crate) fn new(index: usize) -> Channel {
        Channel {
            index,
            state: ChannelState::Idle,
            source: None,
            volume: MAX_VOLUME,
            rate: 1.0,
            loops: 0,
            timeout_ms: INFINITE,
            fade: FadeKind::None,
            fade_start_ms: 0,
            fade_duration_ms: 0,
            fade_start_volume: 0,
            position: 0,
            start_time_ms: 0,
            convert: false,
            cvt: None,
            cvt_src_freq: 0,
            in_buf: Vec::new(),
            filter_buf: Vec::new(),
            filters: Vec::new(),
            finished: Vec::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn volume(&self) -> i32 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: i32) -> MixerResult<()> {
        if !(0..=MAX_VOLUME).contains(&volume) {
            return Err(MixerError::OutOfRange(format!("channel volume {}", volume)));
        }
        self.volume = volume;
        Ok(())
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn set_rate(&mut self, rate: f32) -> MixerResult<()> {
        if rate < 0.0 || !rate.is_finite() {
            return Err(MixerError::OutOfRange(format!("channel rate {}", rate)));
        }
        self.rate = rate;
        Ok(())
    }

    /// Frame offset the next mix pass will read from.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Advisory; the next mix pass seeks the source here if it can.
    pub fn set_position(&mut self, frames: u64) {
        self.position = frames;
    }

    pub(crate) fn source(&self) -> Option<&SharedSource> {
        self.source.as_ref()
    }

    /// Milliseconds since the current playback began.
    pub(crate) fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.start_time_ms)
    }

    pub(crate) fn add_filter(&mut self, id: FilterId, filter: FilterFn) {
        self.filters.push((id, filter));
    }

    pub(crate) fn remove_filter(&mut self, id: FilterId) -> bool {
        let before = self.filters.len();
        self.filters.retain(|(fid, _)| *fid != id);
        self.filters.len() != before
    }

    pub(crate) fn add_finished(&mut self, id: HookId, hook: FinishedHook) {
        self.finished.push((id, hook));
    }

    pub(crate) fn remove_finished(&mut self, id: HookId) -> bool {
        let before = self.finished.len();
        self.finished.retain(|(hid, _)| *hid != id);
        self.finished.len() != before
    }

    /// Bind a source and start playing, replacing any prior binding.
    ///
    /// The caller has already validated the source and built the
    /// conversion descriptor.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn bind(
        &mut self,
        source: SharedSource,
        loops: i32,
        fade_in_ms: Option<u64>,
        timeout_ms: i32,
        cvt: Option<Converter>,
        start_position: u64,
        now: u64,
        hook: Option<&FinishedHook>,
    ) {
        self.halt(hook);
        self.convert = cvt.is_some();
        self.cvt_src_freq = cvt.as_ref().map(|c| c.src_format().frequency).unwrap_or(0);
        self.cvt = cvt;
        self.source = Some(source);
        self.loops = loops.max(INFINITE);
        self.timeout_ms = timeout_ms;
        self.position = start_position;
        self.start_time_ms = now;
        match fade_in_ms {
            Some(ms) if ms > 0 => {
                self.fade = FadeKind::In;
                self.fade_start_ms = now;
                self.fade_duration_ms = ms;
                self.fade_start_volume = 0;
            }
            _ => self.fade = FadeKind::None,
        }
        self.state = ChannelState::Playing;
    }

    pub(crate) fn pause(&mut self) {
        if self.state == ChannelState::Playing {
            self.state = ChannelState::Paused;
        }
    }

    pub(crate) fn resume(&mut self) {
        if self.state == ChannelState::Paused {
            self.state = ChannelState::Playing;
        }
    }

    /// Stop the current binding and enter `Idle`.
    ///
    /// Fires the channel's finished handlers, then the engine hook, in
    /// that order, synchronously. Idempotent on an idle channel.
    pub(crate) fn halt(&mut self, hook: Option<&FinishedHook>) {
        let was_active = self.source.is_some();
        self.source = None;
        self.state = ChannelState::Idle;
        self.fade = FadeKind::None;
        self.cvt = None;
        self.cvt_src_freq = 0;
        self.convert = false;
        self.loops = 0;
        self.position = 0;
        if was_active {
            for (_, h) in &self.finished {
                h(self.index);
            }
            if let Some(h) = hook {
                h(self.index);
            }
        }
    }

    /// Begin a linear fade from the currently applied volume to zero;
    /// the channel stops when the fade completes. Returns whether a
    /// playback was affected.
    pub(crate) fn fade_out(&mut self, ms: i32, now: u64, hook: Option<&FinishedHook>) -> bool {
        let effective = match &self.source {
            Some(s) => {
                let src = s.lock();
                self.effective_volume(src.volume())
            }
            None => return false,
        };
        if self.state == ChannelState::Idle {
            return false;
        }
        if ms <= 0 {
            self.halt(hook);
            return true;
        }
        let current = self.applied_volume(now, effective);
        self.fade = FadeKind::Out;
        self.fade_start_ms = now;
        self.fade_duration_ms = ms as u64;
        self.fade_start_volume = current;
        true
    }

    fn effective_volume(&self, source_volume: i32) -> i32 {
        if source_volume != MAX_VOLUME {
            (self.volume * source_volume) >> 8
        } else {
            self.volume
        }
    }

    /// The volume actually applied at `now`, fade included.
    fn applied_volume(&self, now: u64, effective: i32) -> i32 {
        if self.fade == FadeKind::None || self.fade_duration_ms == 0 {
            return effective;
        }
        let elapsed = now.saturating_sub(self.fade_start_ms);
        let target = if self.fade == FadeKind::Out { 0 } else { effective };
        if elapsed >= self.fade_duration_ms {
            return target;
        }
        let delta = (target - self.fade_start_volume) as i64;
        self.fade_start_volume + ((delta * elapsed as i64) / self.fade_duration_ms as i64) as i32
    }

    /// Produce up to `frames` frames of this channel's contribution into
    /// the accumulator. Runs with the channel lock held; takes the source
    /// lock for the duration of the pass.
    pub(crate) fn mix(&mut self, acc: &mut [i32], frames: usize, ctx: &MixContext<'_>) {
        if self.state != ChannelState::Playing {
            return;
        }
        let source = match &self.source {
            Some(s) => Arc::clone(s),
            None => return,
        };
        let mut src = source.lock();

        let effective = self.effective_volume(src.volume());
        let eff_rate = src.rate() * self.rate;

        if self.timeout_ms != INFINITE
            && ctx.now_ms.saturating_sub(self.start_time_ms) > self.timeout_ms as u64
        {
            drop(src);
            self.halt(ctx.on_finished);
            return;
        }

        let mut vol = effective;
        if self.fade != FadeKind::None {
            let elapsed = ctx.now_ms.saturating_sub(self.fade_start_ms);
            if elapsed >= self.fade_duration_ms {
                let fading_out = self.fade == FadeKind::Out;
                self.fade = FadeKind::None;
                if fading_out {
                    drop(src);
                    self.halt(ctx.on_finished);
                    return;
                }
            } else {
                let target = if self.fade == FadeKind::Out { 0 } else { effective };
                let delta = (target - self.fade_start_volume) as i64;
                vol = self.fade_start_volume
                    + ((delta * elapsed as i64) / self.fade_duration_ms as i64) as i32;
            }
        }

        // Other channels may share a seekable source; pin it to our
        // position before reading.
        if src.can_seek() && src.set_position(self.position).is_err() {
            drop(src);
            self.halt(ctx.on_finished);
            return;
        }

        let direct = !self.convert && eff_rate == 1.0;
        if !direct && !self.refresh_converter(&src, eff_rate, ctx) {
            return;
        }
        let cvt = self.cvt.clone();

        let ch = ctx.format.channels as usize;
        let use_filters = !(self.filters.is_empty() && ctx.pre_filters.is_empty());
        let mut done = 0usize;
        let mut stalled = false;
        while done < frames {
            let want = frames - done;
            let read = if direct {
                if use_filters {
                    let needed = want * ch;
                    if self.filter_buf.len() < needed {
                        self.filter_buf.resize(needed, 0);
                    }
                    src.read_frames(&mut self.filter_buf[..needed], want, -1)
                } else {
                    let out = &mut acc[done * ch..(done + want) * ch];
                    src.read_frames(out, want, vol)
                }
            } else {
                match &cvt {
                    Some(c) => self.read_converted(&mut src, c, want, ch, use_filters),
                    None => return,
                }
            };
            let n = match read {
                Ok(n) => n,
                Err(e) => {
                    log::warn!("channel {}: source read failed: {}", self.index, e);
                    drop(src);
                    self.halt(ctx.on_finished);
                    return;
                }
            };
            if n == 0 {
                // end of stream
                if stalled || self.loops == 0 || src.rewind().is_err() {
                    drop(src);
                    self.halt(ctx.on_finished);
                    return;
                }
                self.position = 0;
                if self.loops != INFINITE {
                    self.loops -= 1;
                }
                stalled = true;
                continue;
            }
            stalled = false;
            if use_filters {
                let samples = n * ch;
                apply_filters(
                    &mut self.filter_buf[..samples],
                    n,
                    &ctx.format,
                    &self.filters,
                    ctx.pre_filters,
                );
                convert::mix(
                    &mut acc[done * ch..done * ch + samples],
                    &self.filter_buf[..samples],
                    vol,
                );
            } else if !direct {
                let samples = n * ch;
                convert_mix(
                    &mut acc[done * ch..done * ch + samples],
                    &self.in_buf,
                    samples,
                    SampleFormat::Mixer,
                    vol,
                );
            }
            done += n;
        }
        self.position = src.position();
    }

    /// Rebuild the cached converter when the snapped source frequency
    /// changed. Returns false when the channel cannot produce samples
    /// this callback.
    fn refresh_converter(
        &mut self,
        src: &crate::mixer::source::AudioSource,
        eff_rate: f32,
        ctx: &MixContext<'_>,
    ) -> bool {
        let src_fmt = src.format();
        let snapped = if eff_rate == 1.0 {
            src_fmt.frequency
        } else {
            // Snap to a 50 Hz grid so small rate changes reuse the
            // cached descriptor.
            ((src_fmt.frequency as f64 * eff_rate as f64) / 50.0).round() as u32 * 50
        };
        if snapped == 0 {
            return false;
        }
        if self.cvt.is_some() && self.cvt_src_freq == snapped {
            return true;
        }
        let mut adjusted = src_fmt;
        adjusted.frequency = snapped;
        match Converter::setup(adjusted, ctx.format) {
            Ok(cvt) => {
                log::debug!(
                    "channel {}: converter {} Hz -> {} Hz",
                    self.index,
                    snapped,
                    ctx.format.frequency
                );
                self.cvt = Some(cvt);
                self.cvt_src_freq = snapped;
                true
            }
            Err(e) => {
                log::warn!("channel {}: conversion unavailable: {}", self.index, e);
                self.halt(ctx.on_finished);
                false
            }
        }
    }

    /// Read from the source through the conversion scratch.
    ///
    /// On success the accumulator samples sit at the front of `in_buf`
    /// (and, when filtering, have been copied into `filter_buf` plain).
    fn read_converted(
        &mut self,
        src: &mut crate::mixer::source::AudioSource,
        cvt: &Converter,
        want: usize,
        ch: usize,
        use_filters: bool,
    ) -> MixerResult<usize> {
        let need = cvt.bytes_for_output(want);
        if self.in_buf.len() < need {
            self.in_buf.resize(need, 0);
        }
        let got = src.read_bytes(&mut self.in_buf[..need])?;
        if got == 0 {
            return Ok(0);
        }
        let out_bytes = cvt.convert(&mut self.in_buf, got);
        let mut n = out_bytes / 4 / ch;
        if n > want {
            n = want;
        }
        if use_filters && n > 0 {
            let samples = n * ch;
            if self.filter_buf.len() < samples {
                self.filter_buf.resize(samples, 0);
            }
            self.filter_buf[..samples].fill(0);
            convert_mix(
                &mut self.filter_buf[..samples],
                &self.in_buf,
                samples,
                SampleFormat::Mixer,
                MAX_VOLUME,
            );
        }
        Ok(n)
    }
}

fn apply_filters(
    buf: &mut [i32],
    frames: usize,
    format: &AudioFormat,
    channel_chain: &[(FilterId, FilterFn)],
    global_chain: &[(FilterId, FilterFn)],
) {
    for (_, f) in channel_chain {
        f(buf, frames, format);
    }
    for (_, f) in global_chain {
        f(buf, frames, format);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::source::AudioSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mono_fmt() -> AudioFormat {
        AudioFormat::new(22050, SampleFormat::S16Lsb, 1)
    }

    fn sample_source(values: &[i16]) -> SharedSource {
        let mut data = Vec::new();
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        AudioSource::sample(data, mono_fmt()).into_shared()
    }

    fn ctx(now: u64) -> MixContext<'static> {
        MixContext {
            format: mono_fmt(),
            now_ms: now,
            pre_filters: &[],
            on_finished: None,
        }
    }

    #[test]
    fn test_new_channel_is_idle() {
        let ch = Channel::new(3);
        assert_eq!(ch.index(), 3);
        assert_eq!(ch.state(), ChannelState::Idle);
        assert_eq!(ch.volume(), MAX_VOLUME);
        assert_eq!(ch.rate(), 1.0);
    }

    #[test]
    fn test_volume_and_rate_bounds() {
        let mut ch = Channel::new(0);
        assert!(ch.set_volume(0).is_ok());
        assert!(ch.set_volume(256).is_ok());
        assert!(matches!(ch.set_volume(300), Err(MixerError::OutOfRange(_))));
        assert!(matches!(ch.set_rate(-1.0), Err(MixerError::OutOfRange(_))));
    }

    #[test]
    fn test_pause_resume_transitions() {
        let mut ch = Channel::new(0);
        ch.bind(sample_source(&[1, 2]), 0, None, INFINITE, None, 0, 0, None);
        assert_eq!(ch.state(), ChannelState::Playing);
        ch.pause();
        assert_eq!(ch.state(), ChannelState::Paused);
        ch.pause();
        assert_eq!(ch.state(), ChannelState::Paused);
        ch.resume();
        assert_eq!(ch.state(), ChannelState::Playing);
        ch.halt(None);
        assert_eq!(ch.state(), ChannelState::Idle);
    }

    #[test]
    fn test_halt_fires_handlers_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let hook: FinishedHook = Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let mut ch = Channel::new(0);
        ch.bind(sample_source(&[1]), 0, None, INFINITE, None, 0, 0, None);
        ch.halt(Some(&hook));
        ch.halt(Some(&hook));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bind_replaces_and_fires_finished() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let hook: FinishedHook = Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let mut ch = Channel::new(0);
        ch.bind(sample_source(&[1]), 0, None, INFINITE, None, 0, 0, Some(&hook));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        ch.bind(sample_source(&[2]), 0, None, INFINITE, None, 0, 0, Some(&hook));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mix_direct_path() {
        let mut ch = Channel::new(0);
        ch.bind(sample_source(&[100, -100, 50]), 0, None, INFINITE, None, 0, 0, None);
        let mut acc = vec![0i32; 3];
        ch.mix(&mut acc, 3, &ctx(0));
        assert_eq!(acc, vec![100, -100, 50]);
        assert_eq!(ch.position(), 3);
    }

    #[test]
    fn test_mix_applies_channel_volume() {
        let mut ch = Channel::new(0);
        ch.set_volume(128).unwrap();
        ch.bind(sample_source(&[100, 100]), 0, None, INFINITE, None, 0, 0, None);
        let mut acc = vec![0i32; 2];
        ch.mix(&mut acc, 2, &ctx(0));
        assert_eq!(acc, vec![50, 50]);
    }

    #[test]
    fn test_mix_paused_leaves_accumulator() {
        let mut ch = Channel::new(0);
        ch.bind(sample_source(&[100]), 0, None, INFINITE, None, 0, 0, None);
        ch.pause();
        let mut acc = vec![7i32; 1];
        ch.mix(&mut acc, 1, &ctx(0));
        assert_eq!(acc, vec![7]);
    }

    #[test]
    fn test_mix_end_of_stream_halts() {
        let mut ch = Channel::new(0);
        ch.bind(sample_source(&[1, 2]), 0, None, INFINITE, None, 0, 0, None);
        let mut acc = vec![0i32; 4];
        ch.mix(&mut acc, 4, &ctx(0));
        assert_eq!(ch.state(), ChannelState::Idle);
        assert_eq!(&acc[..2], &[1, 2]);
        assert_eq!(&acc[2..], &[0, 0]);
    }

    #[test]
    fn test_mix_loops_then_stops() {
        let mut ch = Channel::new(0);
        ch.bind(sample_source(&[5, 6]), 1, None, INFINITE, None, 0, 0, None);
        let mut acc = vec![0i32; 4];
        ch.mix(&mut acc, 4, &ctx(0));
        // one repeat fills the whole block
        assert_eq!(acc, vec![5, 6, 5, 6]);
        assert_eq!(ch.state(), ChannelState::Playing);

        let mut acc = vec![0i32; 4];
        ch.mix(&mut acc, 4, &ctx(0));
        // loop budget exhausted mid-block
        assert_eq!(ch.state(), ChannelState::Idle);
    }

    #[test]
    fn test_timeout_stops_channel() {
        let mut ch = Channel::new(0);
        ch.bind(sample_source(&[1, 2, 3, 4]), INFINITE, None, 100, None, 0, 0, None);
        let mut acc = vec![0i32; 2];
        ch.mix(&mut acc, 2, &ctx(50));
        assert_eq!(ch.state(), ChannelState::Playing);
        ch.mix(&mut acc, 2, &ctx(101));
        assert_eq!(ch.state(), ChannelState::Idle);
    }

    #[test]
    fn test_fade_in_interpolates() {
        let mut ch = Channel::new(0);
        ch.bind(sample_source(&[100; 8]), INFINITE, Some(400), INFINITE, None, 0, 0, None);
        let mut acc = vec![0i32; 2];
        ch.mix(&mut acc, 2, &ctx(0));
        assert_eq!(acc, vec![0, 0]);

        let mut acc = vec![0i32; 2];
        ch.mix(&mut acc, 2, &ctx(200));
        // halfway through the fade: half volume
        assert_eq!(acc, vec![50, 50]);

        let mut acc = vec![0i32; 2];
        ch.mix(&mut acc, 2, &ctx(400));
        assert_eq!(acc, vec![100, 100]);
        assert_eq!(ch.state(), ChannelState::Playing);
    }

    #[test]
    fn test_fade_out_completion_halts() {
        let mut ch = Channel::new(0);
        ch.bind(sample_source(&[100; 8]), INFINITE, None, INFINITE, None, 0, 0, None);
        assert!(ch.fade_out(200, 0, None));

        let mut acc = vec![0i32; 2];
        ch.mix(&mut acc, 2, &ctx(100));
        assert_eq!(acc, vec![50, 50]);
        assert_eq!(ch.state(), ChannelState::Playing);

        let mut acc = vec![0i32; 2];
        ch.mix(&mut acc, 2, &ctx(200));
        assert_eq!(ch.state(), ChannelState::Idle);
        assert_eq!(acc, vec![0, 0]);
    }

    #[test]
    fn test_fade_out_zero_ms_halts_immediately() {
        let mut ch = Channel::new(0);
        ch.bind(sample_source(&[1]), 0, None, INFINITE, None, 0, 0, None);
        assert!(ch.fade_out(0, 0, None));
        assert_eq!(ch.state(), ChannelState::Idle);
    }

    #[test]
    fn test_empty_source_does_not_spin() {
        let mut ch = Channel::new(0);
        ch.bind(sample_source(&[]), INFINITE, None, INFINITE, None, 0, 0, None);
        let mut acc = vec![0i32; 4];
        ch.mix(&mut acc, 4, &ctx(0));
        assert_eq!(ch.state(), ChannelState::Idle);
    }

    #[test]
    fn test_channel_filter_runs_on_contribution() {
        let mut ch = Channel::new(0);
        let filter: FilterFn = Arc::new(|buf, _frames, _fmt| {
            for s in buf.iter_mut() {
                *s = -*s;
            }
        });
        ch.add_filter(FilterId(1), filter);
        ch.bind(sample_source(&[100, 100]), 0, None, INFINITE, None, 0, 0, None);
        let mut acc = vec![0i32; 2];
        ch.mix(&mut acc, 2, &ctx(0));
        assert_eq!(acc, vec![-100, -100]);
    }
}

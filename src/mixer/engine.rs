// engine.rs - Mixer engine coordinator

//! The process-wide mixer coordinator.
//!
//! `Engine` owns the channel array, the group registry, the reservation
//! window, the admission and mix policies, the global filter chains, and
//! the device callback. Constructing it opens the host device; `close`
//! (or dropping the engine) shuts it down.
//!
//! Locking follows a fixed order everywhere: the engine state lock, then
//! a channel lock, then the channel's source lock. The device callback
//! holds the state lock for the whole block, so application-side
//! mutations are atomic from its perspective.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::mixer::channel::{Channel, FilterFn, FinishedHook, MixContext};
use crate::mixer::convert::{divide_accumulator, volume_scale, Converter};
use crate::mixer::device::{DeviceCallback, HostDevice};
use crate::mixer::source::SharedSource;
use crate::mixer::types::{
    AudioFormat, ChannelState, DeviceRequest, FilterId, GroupId, HookId, MixPolicy, MixerError,
    MixerResult, PlayPolicy, SampleFormat, Target, TimeSource, WallClock, INFINITE, MAX_VOLUME,
};

struct MixerState {
    alive: bool,
    format: AudioFormat,
    buffer_frames: usize,
    channels: Vec<Arc<Mutex<Channel>>>,
    reserved: usize,
    groups: Vec<Option<Vec<usize>>>,
    pre_filters: Vec<(FilterId, FilterFn)>,
    post_filters: Vec<(FilterId, FilterFn)>,
    play_policy: PlayPolicy,
    mix_policy: MixPolicy,
    master_volume: i32,
    on_finished: Option<FinishedHook>,
    next_token: u64,
}

impl MixerState {
    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }
}

struct Shared {
    state: Mutex<MixerState>,
    clock: Arc<dyn TimeSource>,
}

impl Shared {
    /// The device callback body: zero the accumulator, mix every channel
    /// in index order, run the post chain, then apply the mix policy and
    /// master volume.
    fn mix_block(&self, out: &mut [i32]) {
        let state = self.state.lock();
        out.fill(0);
        if !state.alive {
            return;
        }
        let width = state.format.channels as usize;
        if width == 0 {
            return;
        }
        let frames = out.len() / width;
        let ctx = MixContext {
            format: state.format,
            now_ms: self.clock.now_ms(),
            pre_filters: &state.pre_filters,
            on_finished: state.on_finished.as_ref(),
        };
        for ch in &state.channels {
            ch.lock().mix(out, frames, &ctx);
        }
        for (_, f) in &state.post_filters {
            f(out, frames, &state.format);
        }
        if state.mix_policy == MixPolicy::Divide {
            divide_accumulator(out, state.channels.len() as i32);
        }
        if state.master_volume != MAX_VOLUME {
            volume_scale(out, state.master_volume);
        }
    }
}

/// The interactive mixing engine.
///
/// One engine owns one host device for its whole lifetime; all channel,
/// group, and filter state hangs off it.
pub struct Engine {
    shared: Arc<Shared>,
    host: Mutex<Box<dyn HostDevice>>,
    exact: bool,
}

impl Engine {
    /// Open `host` with `request` and stand the mixer up around it.
    ///
    /// The channel array starts empty; call `allocate_channels` before
    /// playing anything.
    pub fn new(host: Box<dyn HostDevice>, request: &DeviceRequest) -> MixerResult<Engine> {
        Self::with_clock(host, request, Arc::new(WallClock::new()))
    }

    /// Like `new`, but with an explicit time source.
    pub fn with_clock(
        mut host: Box<dyn HostDevice>,
        request: &DeviceRequest,
        clock: Arc<dyn TimeSource>,
    ) -> MixerResult<Engine> {
        let shared = Arc::new(Shared {
            state: Mutex::new(MixerState {
                alive: false,
                format: request.format(),
                buffer_frames: 0,
                channels: Vec::new(),
                reserved: 0,
                groups: Vec::new(),
                pre_filters: Vec::new(),
                post_filters: Vec::new(),
                play_policy: PlayPolicy::Oldest,
                mix_policy: MixPolicy::DontDivide,
                master_volume: MAX_VOLUME,
                on_finished: None,
                next_token: 0,
            }),
            clock,
        });

        let callback: DeviceCallback = {
            let shared = Arc::clone(&shared);
            Arc::new(move |buf: &mut [i32], _frames: usize| shared.mix_block(buf))
        };

        let granted = host.open(request, callback)?;
        let exact = granted == request.format();
        {
            let mut st = shared.state.lock();
            st.alive = true;
            st.format = granted;
            st.buffer_frames =
                (granted.frequency as u64 * request.buffer_ms as u64 / 1000) as usize;
        }
        log::info!(
            "mixer initialized: {} Hz {:?} x{}{}",
            granted.frequency,
            granted.sample,
            granted.channels,
            if exact { "" } else { " (host adjusted the format)" }
        );
        Ok(Engine { shared, host: Mutex::new(host), exact })
    }

    fn state(&self) -> MixerResult<parking_lot::MutexGuard<'_, MixerState>> {
        let guard = self.shared.state.lock();
        if !guard.alive {
            return Err(MixerError::NotInitialized);
        }
        Ok(guard)
    }

    /// Whether the host granted exactly the requested format.
    pub fn opened_exact(&self) -> bool {
        self.exact
    }

    /// The negotiated mixer format.
    pub fn format(&self) -> MixerResult<AudioFormat> {
        Ok(self.state()?.format)
    }

    /// Frames per callback implied by the request's `buffer_ms`.
    pub fn buffer_frames(&self) -> MixerResult<usize> {
        Ok(self.state()?.buffer_frames)
    }

    /// Stop everything and release the device.
    ///
    /// Every active channel fires its finished handlers. Any operation
    /// after this fails with `NotInitialized`.
    pub fn close(&self) -> MixerResult<()> {
        let (hook, channels) = {
            let mut st = self.state()?;
            st.alive = false;
            (st.on_finished.clone(), st.channels.clone())
        };
        for ch in channels {
            ch.lock().halt(hook.as_ref());
        }
        self.host.lock().close();
        log::info!("mixer shut down");
        Ok(())
    }

    /// Suspend or resume device callbacks.
    pub fn set_device_paused(&self, paused: bool) -> MixerResult<()> {
        self.state()?;
        self.host.lock().set_paused(paused);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Channel array
    // ------------------------------------------------------------------

    /// Grow or shrink the channel array to `n` slots.
    ///
    /// Shrinking stops the removed channels first (their finished
    /// handlers fire) and prunes them from every group; the reservation
    /// window is clamped to the new size.
    pub fn allocate_channels(&self, n: usize) -> MixerResult<usize> {
        let mut st = self.state()?;
        let hook = st.on_finished.clone();
        if n < st.channels.len() {
            let removed: Vec<_> = st.channels[n..].to_vec();
            for ch in &removed {
                ch.lock().halt(hook.as_ref());
            }
            st.channels.truncate(n);
            for group in st.groups.iter_mut().flatten() {
                group.retain(|&i| i < n);
            }
        } else {
            for i in st.channels.len()..n {
                st.channels.push(Arc::new(Mutex::new(Channel::new(i))));
            }
        }
        if st.reserved > n {
            st.reserved = n;
        }
        log::debug!("channel array resized to {}", n);
        Ok(n)
    }

    pub fn channel_count(&self) -> MixerResult<usize> {
        Ok(self.state()?.channels.len())
    }

    /// Channels `[0, n)` are exempt from implicit allocation.
    pub fn set_reserved_channels(&self, n: usize) -> MixerResult<usize> {
        let mut st = self.state()?;
        st.reserved = n.min(st.channels.len());
        Ok(st.reserved)
    }

    pub fn reserved_channels(&self) -> MixerResult<usize> {
        Ok(self.state()?.reserved)
    }

    // ------------------------------------------------------------------
    // Engine-wide settings
    // ------------------------------------------------------------------

    pub fn master_volume(&self) -> MixerResult<i32> {
        Ok(self.state()?.master_volume)
    }

    pub fn set_master_volume(&self, volume: i32) -> MixerResult<()> {
        if !(0..=MAX_VOLUME).contains(&volume) {
            return Err(MixerError::OutOfRange(format!("master volume {}", volume)));
        }
        self.state()?.master_volume = volume;
        Ok(())
    }

    pub fn play_policy(&self) -> MixerResult<PlayPolicy> {
        Ok(self.state()?.play_policy)
    }

    pub fn set_play_policy(&self, policy: PlayPolicy) -> MixerResult<()> {
        self.state()?.play_policy = policy;
        Ok(())
    }

    pub fn mix_policy(&self) -> MixerResult<MixPolicy> {
        Ok(self.state()?.mix_policy)
    }

    pub fn set_mix_policy(&self, policy: MixPolicy) -> MixerResult<()> {
        self.state()?.mix_policy = policy;
        Ok(())
    }

    /// Install the hook fired whenever any channel finishes.
    pub fn set_finished_hook(&self, hook: FinishedHook) -> MixerResult<()> {
        self.state()?.on_finished = Some(hook);
        Ok(())
    }

    pub fn clear_finished_hook(&self) -> MixerResult<()> {
        self.state()?.on_finished = None;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Start `source` on a channel chosen by `target`.
    ///
    /// Returns the channel index, or `-1` when every candidate is busy
    /// and the play policy forbids eviction.
    pub fn play(
        &self,
        source: &SharedSource,
        loops: i32,
        timeout_ms: i32,
        target: Target,
    ) -> MixerResult<i32> {
        self.start(source, loops, None, timeout_ms, target)
    }

    /// Like `play`, but ramping the volume from zero over `fade_ms`.
    pub fn fade_in(
        &self,
        source: &SharedSource,
        fade_ms: i32,
        loops: i32,
        timeout_ms: i32,
        target: Target,
    ) -> MixerResult<i32> {
        if fade_ms < 0 {
            return Err(MixerError::OutOfRange(format!("fade duration {}", fade_ms)));
        }
        self.start(source, loops, Some(fade_ms as u64), timeout_ms, target)
    }

    fn start(
        &self,
        source: &SharedSource,
        loops: i32,
        fade_in_ms: Option<u64>,
        timeout_ms: i32,
        target: Target,
    ) -> MixerResult<i32> {
        if loops < INFINITE {
            return Err(MixerError::OutOfRange(format!("loop count {}", loops)));
        }
        if timeout_ms < INFINITE {
            return Err(MixerError::OutOfRange(format!("timeout {}", timeout_ms)));
        }
        let st = self.state()?;
        let now = self.shared.clock.now_ms();

        let (cvt, start_pos, seekable) = {
            let src = source.lock();
            if loops != 0 && !src.can_rewind() {
                return Err(MixerError::InvalidArgument(
                    "looping requires a rewindable source".to_string(),
                ));
            }
            let cvt = conversion_for(&src.format(), &st.format)?;
            // a stream that cannot seek plays from wherever it stands
            let pos = if src.can_seek() { 0 } else { src.position() };
            (cvt, pos, src.can_seek())
        };

        let index = match pick_channel(&st, target, now) {
            Ok(i) => i,
            Err(MixerError::CapacityExceeded) => return Ok(-1),
            Err(e) => return Err(e),
        };

        // A non-seekable source may be held by at most one channel. The
        // chosen channel is about to be rebound (its current playback
        // stops), so it does not count against that limit.
        if !seekable {
            for (i, ch) in st.channels.iter().enumerate() {
                if i == index {
                    continue;
                }
                let c = ch.lock();
                if let Some(other) = c.source() {
                    if Arc::ptr_eq(other, source) {
                        return Err(MixerError::InvalidArgument(
                            "non-seekable source is already bound to a channel".to_string(),
                        ));
                    }
                }
            }
        }
        let hook = st.on_finished.clone();
        let channel = Arc::clone(&st.channels[index]);
        channel.lock().bind(
            Arc::clone(source),
            loops,
            fade_in_ms,
            timeout_ms,
            cvt,
            start_pos,
            now,
            hook.as_ref(),
        );
        Ok(index as i32)
    }

    // ------------------------------------------------------------------
    // Per-channel operations
    // ------------------------------------------------------------------

    fn channel(&self, index: usize) -> MixerResult<(Arc<Mutex<Channel>>, Option<FinishedHook>)> {
        let st = self.state()?;
        let ch = st
            .channels
            .get(index)
            .ok_or_else(|| MixerError::OutOfRange(format!("channel index {}", index)))?;
        Ok((Arc::clone(ch), st.on_finished.clone()))
    }

    pub fn channel_state(&self, index: usize) -> MixerResult<ChannelState> {
        let (ch, _) = self.channel(index)?;
        let state = ch.lock().state();
        Ok(state)
    }

    pub fn pause(&self, index: usize) -> MixerResult<()> {
        let (ch, _) = self.channel(index)?;
        ch.lock().pause();
        Ok(())
    }

    pub fn resume(&self, index: usize) -> MixerResult<()> {
        let (ch, _) = self.channel(index)?;
        ch.lock().resume();
        Ok(())
    }

    /// Stop the channel; final for the current binding.
    pub fn halt(&self, index: usize) -> MixerResult<()> {
        let (ch, hook) = self.channel(index)?;
        ch.lock().halt(hook.as_ref());
        Ok(())
    }

    /// Fade the channel to silence over `ms`, then stop it.
    pub fn fade_out(&self, index: usize, ms: i32) -> MixerResult<bool> {
        let (ch, hook) = self.channel(index)?;
        let now = self.shared.clock.now_ms();
        let result = ch.lock().fade_out(ms, now, hook.as_ref());
        Ok(result)
    }

    pub fn channel_volume(&self, index: usize) -> MixerResult<i32> {
        let (ch, _) = self.channel(index)?;
        let v = ch.lock().volume();
        Ok(v)
    }

    pub fn set_channel_volume(&self, index: usize, volume: i32) -> MixerResult<()> {
        let (ch, _) = self.channel(index)?;
        let result = ch.lock().set_volume(volume);
        result
    }

    pub fn channel_rate(&self, index: usize) -> MixerResult<f32> {
        let (ch, _) = self.channel(index)?;
        let r = ch.lock().rate();
        Ok(r)
    }

    pub fn set_channel_rate(&self, index: usize, rate: f32) -> MixerResult<()> {
        let (ch, _) = self.channel(index)?;
        let result = ch.lock().set_rate(rate);
        result
    }

    pub fn channel_position(&self, index: usize) -> MixerResult<u64> {
        let (ch, _) = self.channel(index)?;
        let p = ch.lock().position();
        Ok(p)
    }

    /// Advisory: the next mix pass seeks the source here if it can.
    pub fn set_channel_position(&self, index: usize, frames: u64) -> MixerResult<()> {
        let (ch, _) = self.channel(index)?;
        ch.lock().set_position(frames);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Groups and bulk operations
    // ------------------------------------------------------------------

    /// Create an empty group in the lowest free slot.
    pub fn add_group(&self) -> MixerResult<GroupId> {
        let mut st = self.state()?;
        if let Some(slot) = st.groups.iter().position(|g| g.is_none()) {
            st.groups[slot] = Some(Vec::new());
            return Ok(GroupId::from_slot(slot));
        }
        st.groups.push(Some(Vec::new()));
        Ok(GroupId::from_slot(st.groups.len() - 1))
    }

    /// Drop a group; other group ids stay stable.
    pub fn remove_group(&self, group: GroupId) -> MixerResult<()> {
        let mut st = self.state()?;
        let slot = resolve_group(&st, group)?;
        st.groups[slot] = None;
        Ok(())
    }

    /// Add one channel to a group.
    pub fn group_channel(&self, index: usize, group: GroupId) -> MixerResult<()> {
        let mut st = self.state()?;
        if index >= st.channels.len() {
            return Err(MixerError::OutOfRange(format!("channel index {}", index)));
        }
        let slot = resolve_group(&st, group)?;
        if let Some(members) = st.groups[slot].as_mut() {
            if !members.contains(&index) {
                members.push(index);
            }
        }
        Ok(())
    }

    /// Add channels `[lo, hi]` to a group.
    pub fn group_range(&self, lo: usize, hi: usize, group: GroupId) -> MixerResult<()> {
        let mut st = self.state()?;
        if lo > hi || hi >= st.channels.len() {
            return Err(MixerError::OutOfRange(format!("channel range {}..={}", lo, hi)));
        }
        let slot = resolve_group(&st, group)?;
        if let Some(members) = st.groups[slot].as_mut() {
            for i in lo..=hi {
                if !members.contains(&i) {
                    members.push(i);
                }
            }
        }
        Ok(())
    }

    /// Remove one channel from every group.
    pub fn ungroup_channel(&self, index: usize) -> MixerResult<()> {
        let mut st = self.state()?;
        if index >= st.channels.len() {
            return Err(MixerError::OutOfRange(format!("channel index {}", index)));
        }
        for group in st.groups.iter_mut().flatten() {
            group.retain(|&i| i != index);
        }
        Ok(())
    }

    pub fn group_size(&self, group: GroupId) -> MixerResult<usize> {
        let st = self.state()?;
        if group == GroupId::ALL {
            return Ok(st.channels.len());
        }
        let slot = resolve_group(&st, group)?;
        Ok(st.groups[slot].as_ref().map(|m| m.len()).unwrap_or(0))
    }

    pub fn group_channels(&self, group: GroupId) -> MixerResult<Vec<usize>> {
        let st = self.state()?;
        Ok(scope_members(&st, group)?)
    }

    /// Pause every channel in the scope; returns how many were playing.
    pub fn pause_scope(&self, scope: GroupId) -> MixerResult<usize> {
        self.for_scope(scope, |ch, _| {
            if ch.state() == ChannelState::Playing {
                ch.pause();
                true
            } else {
                false
            }
        })
    }

    /// Resume every paused channel in the scope.
    pub fn resume_scope(&self, scope: GroupId) -> MixerResult<usize> {
        self.for_scope(scope, |ch, _| {
            if ch.state() == ChannelState::Paused {
                ch.resume();
                true
            } else {
                false
            }
        })
    }

    /// Stop every channel in the scope; returns how many were active.
    pub fn halt_scope(&self, scope: GroupId) -> MixerResult<usize> {
        self.for_scope(scope, |ch, hook| {
            if ch.state() != ChannelState::Idle {
                ch.halt(hook);
                true
            } else {
                false
            }
        })
    }

    /// Begin a fade-out on every active channel in the scope.
    pub fn fade_out_scope(&self, scope: GroupId, ms: i32) -> MixerResult<usize> {
        let now = self.shared.clock.now_ms();
        self.for_scope(scope, move |ch, hook| ch.fade_out(ms, now, hook))
    }

    fn for_scope<F>(&self, scope: GroupId, mut op: F) -> MixerResult<usize>
    where
        F: FnMut(&mut Channel, Option<&FinishedHook>) -> bool,
    {
        let st = self.state()?;
        let members = scope_members(&st, scope)?;
        let hook = st.on_finished.clone();
        let mut touched = 0;
        for index in members {
            if let Some(ch) = st.channels.get(index) {
                if op(&mut ch.lock(), hook.as_ref()) {
                    touched += 1;
                }
            }
        }
        Ok(touched)
    }

    /// The longest-playing channel in the scope.
    pub fn oldest_channel(
        &self,
        scope: GroupId,
        include_reserved: bool,
    ) -> MixerResult<Option<usize>> {
        let st = self.state()?;
        let members = scope_members(&st, scope)?;
        let now = self.shared.clock.now_ms();
        let mut best: Option<(usize, u64)> = None;
        for index in members {
            if !include_reserved && index < st.reserved {
                continue;
            }
            let ch = match st.channels.get(index) {
                Some(c) => c,
                None => continue,
            };
            let guard = ch.lock();
            if guard.state() == ChannelState::Idle {
                continue;
            }
            let age = guard.age_ms(now);
            if best.map(|(_, a)| age > a).unwrap_or(true) {
                best = Some((index, age));
            }
        }
        Ok(best.map(|(i, _)| i))
    }

    // ------------------------------------------------------------------
    // Filters and finished handlers
    // ------------------------------------------------------------------

    /// Register a filter run over every channel's post-conversion
    /// contribution.
    pub fn add_pre_filter(&self, filter: FilterFn) -> MixerResult<FilterId> {
        let mut st = self.state()?;
        let id = FilterId(st.token());
        st.pre_filters.push((id, filter));
        Ok(id)
    }

    pub fn remove_pre_filter(&self, id: FilterId) -> MixerResult<bool> {
        let mut st = self.state()?;
        let before = st.pre_filters.len();
        st.pre_filters.retain(|(fid, _)| *fid != id);
        Ok(st.pre_filters.len() != before)
    }

    /// Register a filter run over the summed accumulator.
    pub fn add_post_filter(&self, filter: FilterFn) -> MixerResult<FilterId> {
        let mut st = self.state()?;
        let id = FilterId(st.token());
        st.post_filters.push((id, filter));
        Ok(id)
    }

    pub fn remove_post_filter(&self, id: FilterId) -> MixerResult<bool> {
        let mut st = self.state()?;
        let before = st.post_filters.len();
        st.post_filters.retain(|(fid, _)| *fid != id);
        Ok(st.post_filters.len() != before)
    }

    /// Register a filter on one channel's contribution.
    pub fn add_channel_filter(&self, index: usize, filter: FilterFn) -> MixerResult<FilterId> {
        let mut st = self.state()?;
        let id = FilterId(st.token());
        let ch = st
            .channels
            .get(index)
            .ok_or_else(|| MixerError::OutOfRange(format!("channel index {}", index)))?;
        ch.lock().add_filter(id, filter);
        Ok(id)
    }

    pub fn remove_channel_filter(&self, index: usize, id: FilterId) -> MixerResult<bool> {
        let (ch, _) = self.channel(index)?;
        let removed = ch.lock().remove_filter(id);
        Ok(removed)
    }

    /// Register a handler fired when this channel's playback finishes.
    pub fn add_channel_finished(&self, index: usize, hook: FinishedHook) -> MixerResult<HookId> {
        let mut st = self.state()?;
        let id = HookId(st.token());
        let ch = st
            .channels
            .get(index)
            .ok_or_else(|| MixerError::OutOfRange(format!("channel index {}", index)))?;
        ch.lock().add_finished(id, hook);
        Ok(id)
    }

    pub fn remove_channel_finished(&self, index: usize, id: HookId) -> MixerResult<bool> {
        let (ch, _) = self.channel(index)?;
        let removed = ch.lock().remove_finished(id);
        Ok(removed)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// No conversion is needed when the frequency and layout match and the
/// samples are either the device encoding or already widened.
fn conversion_for(src: &AudioFormat, mixer: &AudioFormat) -> MixerResult<Option<Converter>> {
    let compatible = src.frequency == mixer.frequency
        && src.channels == mixer.channels
        && (src.sample == mixer.sample || src.sample == SampleFormat::Mixer);
    if compatible {
        return Ok(None);
    }
    Converter::setup(*src, *mixer).map(Some)
}

fn resolve_group(st: &MixerState, group: GroupId) -> MixerResult<usize> {
    let slot = group
        .slot()
        .ok_or_else(|| MixerError::InvalidArgument(format!("bad group id {}", group.0)))?;
    match st.groups.get(slot) {
        Some(Some(_)) => Ok(slot),
        _ => Err(MixerError::InvalidArgument(format!("no such group {}", group.0))),
    }
}

/// The channel indices addressed by a bulk-operation scope.
fn scope_members(st: &MixerState, scope: GroupId) -> MixerResult<Vec<usize>> {
    if scope == GroupId::ALL {
        return Ok((0..st.channels.len()).collect());
    }
    let slot = resolve_group(st, scope)?;
    Ok(st.groups[slot].as_ref().map(|m| m.clone()).unwrap_or_default())
}

/// Resolve a play target to a channel index, applying the play policy
/// when no candidate is idle. `CapacityExceeded` means "no channel"; the
/// caller maps it to the non-exceptional `-1`.
fn pick_channel(st: &MixerState, target: Target, now: u64) -> MixerResult<usize> {
    let candidates: Vec<usize> = match target {
        Target::Channel(index) => {
            if index >= st.channels.len() {
                return Err(MixerError::OutOfRange(format!("channel index {}", index)));
            }
            // explicit targeting always wins, reservation included
            return Ok(index);
        }
        Target::Free => {
            if st.reserved == st.channels.len() {
                return Err(MixerError::CapacityExceeded);
            }
            (st.reserved..st.channels.len()).collect()
        }
        Target::Group(group) => {
            if group == GroupId::ALL {
                (st.reserved..st.channels.len()).collect()
            } else {
                let slot = resolve_group(st, group)?;
                st.groups[slot]
                    .as_ref()
                    .map(|m| {
                        m.iter()
                            .copied()
                            .filter(|&i| i >= st.reserved && i < st.channels.len())
                            .collect()
                    })
                    .unwrap_or_default()
            }
        }
    };

    for &index in &candidates {
        if st.channels[index].lock().state() == ChannelState::Idle {
            return Ok(index);
        }
    }

    if st.play_policy == PlayPolicy::Fail {
        return Err(MixerError::CapacityExceeded);
    }

    // (index, age, priority) for every busy candidate, in scan order
    let mut busy: Vec<(usize, u64, i32)> = Vec::with_capacity(candidates.len());
    for &index in &candidates {
        let ch = st.channels[index].lock();
        let age = ch.age_ms(now);
        let priority = match ch.source() {
            Some(s) => s.lock().priority(),
            None => i32::MIN,
        };
        busy.push((index, age, priority));
    }
    if busy.is_empty() {
        return Err(MixerError::CapacityExceeded);
    }

    let victim = match st.play_policy {
        PlayPolicy::Fail => return Err(MixerError::CapacityExceeded),
        PlayPolicy::Oldest => {
            let mut best = busy[0];
            for &c in &busy[1..] {
                if c.1 > best.1 {
                    best = c;
                }
            }
            best.0
        }
        PlayPolicy::Priority => {
            let mut best = busy[0];
            for &c in &busy[1..] {
                if c.2 < best.2 {
                    best = c;
                }
            }
            best.0
        }
        PlayPolicy::OldestPriority => {
            let min_priority = busy.iter().map(|c| c.2).min().unwrap_or(0);
            let mut best: Option<(usize, u64)> = None;
            for &(index, age, priority) in &busy {
                if priority != min_priority {
                    continue;
                }
                if best.map(|(_, a)| age > a).unwrap_or(true) {
                    best = Some((index, age));
                }
            }
            best.map(|(i, _)| i).unwrap_or(busy[0].0)
        }
    };
    Ok(victim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::device::NullDevice;
    use crate::mixer::source::AudioSource;
    use crate::mixer::types::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mono_request() -> DeviceRequest {
        DeviceRequest {
            frequency: 22050,
            sample: SampleFormat::S16Lsb,
            channels: 1,
            buffer_ms: 100,
        }
    }

    fn engine_with_clock() -> (Engine, NullDevice, Arc<ManualClock>) {
        let device = NullDevice::new();
        let handle = device.handle();
        let clock = Arc::new(ManualClock::new());
        let engine =
            Engine::with_clock(Box::new(device), &mono_request(), clock.clone()).unwrap();
        (engine, handle, clock)
    }

    fn tone(frames: usize, value: i16) -> SharedSource {
        let mut data = Vec::with_capacity(frames * 2);
        for _ in 0..frames {
            data.extend_from_slice(&value.to_le_bytes());
        }
        AudioSource::sample(data, AudioFormat::new(22050, SampleFormat::S16Lsb, 1)).into_shared()
    }

    #[test]
    fn test_initialize_reports_format() {
        let (engine, _, _) = engine_with_clock();
        assert!(engine.opened_exact());
        let fmt = engine.format().unwrap();
        assert_eq!(fmt.frequency, 22050);
        assert_eq!(fmt.channels, 1);
        assert_eq!(engine.buffer_frames().unwrap(), 2205);
        assert_eq!(engine.channel_count().unwrap(), 0);
    }

    #[test]
    fn test_host_adjusted_format_is_reported() {
        let forced = AudioFormat::new(48000, SampleFormat::S16Lsb, 2);
        let device = NullDevice::granting(forced);
        let engine = Engine::new(Box::new(device), &mono_request()).unwrap();
        assert!(!engine.opened_exact());
        assert_eq!(engine.format().unwrap(), forced);
    }

    #[test]
    fn test_ops_after_close_fail() {
        let (engine, _, _) = engine_with_clock();
        engine.close().unwrap();
        assert!(matches!(engine.channel_count(), Err(MixerError::NotInitialized)));
        assert!(matches!(engine.allocate_channels(2), Err(MixerError::NotInitialized)));
        assert!(matches!(engine.close(), Err(MixerError::NotInitialized)));
    }

    #[test]
    fn test_callback_is_silent_after_close() {
        let (engine, handle, _) = engine_with_clock();
        engine.allocate_channels(1).unwrap();
        engine.play(&tone(1000, 100), 0, INFINITE, Target::Free).unwrap();
        engine.close().unwrap();
        let out = handle.render(16);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_allocate_shrink_stops_channels() {
        let (engine, _, _) = engine_with_clock();
        engine.allocate_channels(2).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        engine
            .set_finished_hook(Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        engine.play(&tone(1000, 10), 0, INFINITE, Target::Channel(1)).unwrap();
        engine.allocate_channels(1).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(engine.channel_count().unwrap(), 1);
    }

    #[test]
    fn test_reserved_clamped_on_shrink() {
        let (engine, _, _) = engine_with_clock();
        engine.allocate_channels(8).unwrap();
        assert_eq!(engine.set_reserved_channels(6).unwrap(), 6);
        engine.allocate_channels(4).unwrap();
        assert_eq!(engine.reserved_channels().unwrap(), 4);
        assert_eq!(engine.set_reserved_channels(100).unwrap(), 4);
    }

    #[test]
    fn test_master_volume_validation() {
        let (engine, _, _) = engine_with_clock();
        assert_eq!(engine.master_volume().unwrap(), MAX_VOLUME);
        engine.set_master_volume(100).unwrap();
        assert_eq!(engine.master_volume().unwrap(), 100);
        assert!(matches!(engine.set_master_volume(257), Err(MixerError::OutOfRange(_))));
        assert!(matches!(engine.set_master_volume(-1), Err(MixerError::OutOfRange(_))));
    }

    #[test]
    fn test_play_on_explicit_channel() {
        let (engine, handle, _) = engine_with_clock();
        engine.allocate_channels(2).unwrap();
        let idx = engine.play(&tone(100, 50), 0, INFINITE, Target::Channel(1)).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(engine.channel_state(1).unwrap(), ChannelState::Playing);
        let out = handle.render(4);
        assert_eq!(out, vec![50, 50, 50, 50]);
    }

    #[test]
    fn test_play_free_scans_in_order() {
        let (engine, _, _) = engine_with_clock();
        engine.allocate_channels(3).unwrap();
        assert_eq!(engine.play(&tone(100, 1), 0, INFINITE, Target::Free).unwrap(), 0);
        assert_eq!(engine.play(&tone(100, 2), 0, INFINITE, Target::Free).unwrap(), 1);
        assert_eq!(engine.play(&tone(100, 3), 0, INFINITE, Target::Free).unwrap(), 2);
    }

    #[test]
    fn test_play_fail_policy_returns_minus_one() {
        let (engine, _, _) = engine_with_clock();
        engine.allocate_channels(1).unwrap();
        engine.set_play_policy(PlayPolicy::Fail).unwrap();
        assert_eq!(engine.play(&tone(100, 1), 0, INFINITE, Target::Free).unwrap(), 0);
        assert_eq!(engine.play(&tone(100, 2), 0, INFINITE, Target::Free).unwrap(), -1);
    }

    #[test]
    fn test_play_all_reserved_returns_minus_one() {
        let (engine, _, _) = engine_with_clock();
        engine.allocate_channels(2).unwrap();
        engine.set_reserved_channels(2).unwrap();
        assert_eq!(engine.play(&tone(100, 1), 0, INFINITE, Target::Free).unwrap(), -1);
    }

    #[test]
    fn test_loop_on_forward_source_rejected() {
        let (engine, _, _) = engine_with_clock();
        engine.allocate_channels(1).unwrap();
        let data = vec![0u8; 64];
        let src = AudioSource::raw_reader(
            std::io::Cursor::new(data),
            AudioFormat::new(22050, SampleFormat::S16Lsb, 1),
        )
        .into_shared();
        assert!(matches!(
            engine.play(&src, 2, INFINITE, Target::Free),
            Err(MixerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_nonseekable_source_single_binding() {
        let (engine, _, _) = engine_with_clock();
        engine.allocate_channels(2).unwrap();
        let data = vec![0u8; 4096];
        let src = AudioSource::raw_reader(
            std::io::Cursor::new(data),
            AudioFormat::new(22050, SampleFormat::S16Lsb, 1),
        )
        .into_shared();
        assert_eq!(engine.play(&src, 0, INFINITE, Target::Channel(0)).unwrap(), 0);
        assert!(matches!(
            engine.play(&src, 0, INFINITE, Target::Channel(1)),
            Err(MixerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_nonseekable_source_can_rebind_same_channel() {
        let (engine, _, _) = engine_with_clock();
        engine.allocate_channels(2).unwrap();
        let data = vec![0u8; 4096];
        let src = AudioSource::raw_reader(
            std::io::Cursor::new(data),
            AudioFormat::new(22050, SampleFormat::S16Lsb, 1),
        )
        .into_shared();
        // explicit targeting replaces the channel's own binding, so the
        // source is still held by only one channel
        assert_eq!(engine.play(&src, 0, INFINITE, Target::Channel(0)).unwrap(), 0);
        assert_eq!(engine.play(&src, 0, INFINITE, Target::Channel(0)).unwrap(), 0);
        assert_eq!(engine.channel_state(0).unwrap(), ChannelState::Playing);
    }

    #[test]
    fn test_group_lifecycle() {
        let (engine, _, _) = engine_with_clock();
        engine.allocate_channels(4).unwrap();

        let g0 = engine.add_group().unwrap();
        let g1 = engine.add_group().unwrap();
        assert_eq!(g0, GroupId(-2));
        assert_eq!(g1, GroupId(-3));

        engine.group_range(0, 2, g0).unwrap();
        assert_eq!(engine.group_size(g0).unwrap(), 3);
        engine.ungroup_channel(1).unwrap();
        assert_eq!(engine.group_channels(g0).unwrap(), vec![0, 2]);

        engine.remove_group(g0).unwrap();
        assert!(matches!(engine.group_size(g0), Err(MixerError::InvalidArgument(_))));
        // slot 0 is free again; ids stay stable
        let g2 = engine.add_group().unwrap();
        assert_eq!(g2, GroupId(-2));
        assert_eq!(engine.group_size(g1).unwrap(), 0);
    }

    #[test]
    fn test_group_play_and_bulk_ops() {
        let (engine, _, _) = engine_with_clock();
        engine.allocate_channels(4).unwrap();
        let g = engine.add_group().unwrap();
        engine.group_range(2, 3, g).unwrap();

        let idx = engine.play(&tone(1000, 1), 0, INFINITE, Target::Group(g)).unwrap();
        assert_eq!(idx, 2);
        let idx = engine.play(&tone(1000, 2), 0, INFINITE, Target::Group(g)).unwrap();
        assert_eq!(idx, 3);

        assert_eq!(engine.pause_scope(g).unwrap(), 2);
        assert_eq!(engine.channel_state(2).unwrap(), ChannelState::Paused);
        assert_eq!(engine.resume_scope(g).unwrap(), 2);
        assert_eq!(engine.halt_scope(g).unwrap(), 2);
        assert_eq!(engine.channel_state(3).unwrap(), ChannelState::Idle);
    }

    #[test]
    fn test_oldest_channel_scoping() {
        let (engine, _, clock) = engine_with_clock();
        engine.allocate_channels(3).unwrap();
        engine.set_reserved_channels(1).unwrap();

        engine.play(&tone(1000, 1), 0, INFINITE, Target::Channel(0)).unwrap();
        clock.advance(100);
        engine.play(&tone(1000, 2), 0, INFINITE, Target::Channel(1)).unwrap();
        clock.advance(100);
        engine.play(&tone(1000, 3), 0, INFINITE, Target::Channel(2)).unwrap();
        clock.advance(100);

        assert_eq!(engine.oldest_channel(GroupId::ALL, true).unwrap(), Some(0));
        assert_eq!(engine.oldest_channel(GroupId::ALL, false).unwrap(), Some(1));
    }

    #[test]
    fn test_post_filter_and_master_volume() {
        let (engine, handle, _) = engine_with_clock();
        engine.allocate_channels(1).unwrap();
        engine
            .add_post_filter(Arc::new(|buf, _frames, _fmt| {
                for s in buf.iter_mut() {
                    *s += 1;
                }
            }))
            .unwrap();
        engine.set_master_volume(128).unwrap();
        engine.play(&tone(100, 100), 0, INFINITE, Target::Free).unwrap();
        let out = handle.render(2);
        // (100 + 1) * 128 / 256
        assert_eq!(out, vec![50, 50]);
    }

    #[test]
    fn test_divide_policy() {
        let (engine, handle, _) = engine_with_clock();
        engine.allocate_channels(2).unwrap();
        engine.set_mix_policy(MixPolicy::Divide).unwrap();
        engine.play(&tone(100, 100), 0, INFINITE, Target::Channel(0)).unwrap();
        engine.play(&tone(100, 50), 0, INFINITE, Target::Channel(1)).unwrap();
        let out = handle.render(2);
        assert_eq!(out, vec![75, 75]);
    }

    #[test]
    fn test_filter_tokens_remove() {
        let (engine, handle, _) = engine_with_clock();
        engine.allocate_channels(1).unwrap();
        let id = engine
            .add_post_filter(Arc::new(|buf, _, _| {
                for s in buf.iter_mut() {
                    *s = 9;
                }
            }))
            .unwrap();
        assert!(engine.remove_post_filter(id).unwrap());
        assert!(!engine.remove_post_filter(id).unwrap());
        engine.play(&tone(100, 3), 0, INFINITE, Target::Free).unwrap();
        assert_eq!(handle.render(1), vec![3]);
    }
}

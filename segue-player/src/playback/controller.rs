//! Multi-track coordination
//!
//! The controller owns the shared clock and the master gain. Tracks observe it
//! and report loading progress through [`Controller::notify`]; from those
//! reports and its own ticks it runs the buffering state machine, keeping the
//! clock suspended while any track's current segment is missing.
//!
//! Desired state (what the user asked for) is kept apart from the actual clock
//! state: leaving buffering resumes the clock only when the user wants it
//! running.

use super::fade;
use super::timeline::{PlayWindow, Timeframe, Timeline};
use super::track::Track;
use crate::audio::{AudioContext, GainNode};
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, SubscriptionId};
use crate::timer::Timer;
use futures::future::BoxFuture;
use segue_common::{ClockState, EventTopic, PlayerEvent};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Playback state requested by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    Resumed,
    Suspended,
}

/// Progress reports from a track
#[derive(Debug, Clone, PartialEq)]
pub enum TrackNotification {
    LoadingStart,
    LoadingEnd,
    Error(String),
    /// Manifest loaded
    Init,
    DurationChanged,
}

struct ControllerState {
    tracks: Vec<Track>,
    timeline: Timeline,
    desired: DesiredState,
    buffering: bool,
    duration_override: Option<f64>,
    play_duration_override: Option<f64>,
    offset: f64,
    looping: bool,
    volume: f64,
    tick: Option<Timer>,
    /// Last duration published
    last_duration: Option<f64>,
    watcher: Option<JoinHandle<()>>,
    destroyed: bool,
}

pub(crate) struct ControllerInner {
    context: Arc<dyn AudioContext>,
    gain: Arc<dyn GainNode>,
    config: ControllerConfig,
    events: EventBus,
    state: Mutex<ControllerState>,
}

/// Shared handle to the controller
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

/// Non-owning handle held by tracks and timers
#[derive(Clone)]
pub(crate) struct WeakController(Weak<ControllerInner>);

impl WeakController {
    pub(crate) fn upgrade(&self) -> Option<Controller> {
        self.0.upgrade().map(|inner| Controller { inner })
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Controller")
            .field("tracks", &state.tracks.len())
            .field("desired", &state.desired)
            .field("buffering", &state.buffering)
            .field("looping", &state.looping)
            .finish()
    }
}

impl Controller {
    /// Take over `context`: suspend it and route the master gain to its output
    pub async fn new(context: Arc<dyn AudioContext>, config: ControllerConfig) -> Result<Self> {
        let gain = context.create_gain();
        gain.connect(context.destination());
        gain.set_value(config.volume);

        if context.state() == ClockState::Running {
            context.suspend().await?;
        }

        let controller = Self {
            inner: Arc::new(ControllerInner {
                context,
                gain,
                events: EventBus::new(),
                state: Mutex::new(ControllerState {
                    tracks: Vec::new(),
                    timeline: Timeline::new(),
                    desired: DesiredState::Suspended,
                    buffering: false,
                    duration_override: None,
                    play_duration_override: None,
                    offset: 0.0,
                    looping: false,
                    volume: config.volume,
                    tick: None,
                    last_duration: None,
                    watcher: None,
                    destroyed: false,
                }),
                config,
            }),
        };

        let watcher = controller.spawn_clock_watcher();
        controller.lock_state().watcher = watcher;
        Ok(controller)
    }

    /// Tick while the clock runs, stop ticking when it does not
    fn spawn_clock_watcher(&self) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let mut changes = self.inner.context.state_changes();
        changes.borrow_and_update();
        let weak = self.downgrade();

        Some(runtime.spawn(async move {
            while changes.changed().await.is_ok() {
                let state = *changes.borrow_and_update();
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                debug!(state = %state, "Clock state changed");
                match state {
                    ClockState::Running => controller.tick(),
                    ClockState::Suspended => controller.untick(),
                    ClockState::Closed => {
                        controller.untick();
                        break;
                    }
                }
            }
        }))
    }

    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn downgrade(&self) -> WeakController {
        WeakController(Arc::downgrade(&self.inner))
    }

    pub(crate) fn context(&self) -> Arc<dyn AudioContext> {
        self.inner.context.clone()
    }

    pub(crate) fn master_gain(&self) -> Arc<dyn GainNode> {
        self.inner.gain.clone()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    pub(crate) fn observe(&self, track: &Track) {
        {
            let mut state = self.lock_state();
            if state.destroyed || state.tracks.contains(track) {
                return;
            }
            state.tracks.push(track.clone());
        }
        self.check_duration();
    }

    pub(crate) fn unobserve(&self, track: &Track) {
        self.lock_state().tracks.retain(|t| t != track);
        self.check_duration();
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.lock_state().tracks.clone()
    }

    /// Longest track end, counting only tracks with a known duration
    pub fn audio_duration(&self) -> Option<f64> {
        self.tracks()
            .iter()
            .filter_map(Track::end)
            .fold(None, |max, end| Some(max.map_or(end, |m: f64| m.max(end))))
    }

    /// Manual override, or the longest track
    pub fn duration(&self) -> Option<f64> {
        let duration_override = self.lock_state().duration_override;
        duration_override.or_else(|| self.audio_duration())
    }

    /// Override the duration derived from the tracks
    pub fn set_duration(&self, duration: Option<f64>) {
        self.lock_state().duration_override = duration;
        self.check_duration();
    }

    pub fn offset(&self) -> f64 {
        self.lock_state().offset
    }

    /// Move the start of the play window
    pub fn set_offset(&self, offset: f64) -> Result<()> {
        if !offset.is_finite() || offset < 0.0 {
            return Err(Error::InvalidTiming(format!("Invalid offset {}", offset)));
        }
        self.lock_state().offset = offset;
        info!(offset, "Offset changed");
        self.inner.events.publish(PlayerEvent::Offset { offset });
        self.reset_tracks();
        Ok(())
    }

    /// Manual override, or the rest of the content after the offset
    pub fn play_duration(&self) -> Option<f64> {
        self.play_window().map(|window| window.play_duration)
    }

    /// Restrict playback to a sub-range starting at the offset
    pub fn set_play_duration(&self, play_duration: Option<f64>) -> Result<()> {
        if let Some(d) = play_duration {
            if !d.is_finite() || d <= 0.0 {
                return Err(Error::InvalidTiming(format!("Invalid play duration {}", d)));
            }
        }
        self.lock_state().play_duration_override = play_duration;
        let play_duration = self.play_duration();
        info!(?play_duration, "Play duration changed");
        self.inner
            .events
            .publish(PlayerEvent::PlayDuration { play_duration });
        self.reset_tracks();
        Ok(())
    }

    pub fn looping(&self) -> bool {
        self.lock_state().looping
    }

    pub fn set_loop(&self, looping: bool) {
        self.lock_state().looping = looping;
        self.reset_tracks();
    }

    pub(crate) fn play_window(&self) -> Option<PlayWindow> {
        let duration = self.duration()?;
        let state = self.lock_state();
        let play_duration = state
            .play_duration_override
            .unwrap_or((duration - state.offset).max(0.0));
        Some(PlayWindow {
            offset: state.offset,
            play_duration,
            looping: state.looping,
        })
    }

    /// Logical playback position, if the timeline has been started
    pub fn current_time(&self) -> Option<f64> {
        let now = self.inner.context.current_time();
        self.lock_state().timeline.current_time(now)
    }

    /// Timeline epoch; changes on every re-base and reset
    pub fn epoch(&self) -> u64 {
        self.lock_state().timeline.epoch()
    }

    /// Snapshot for a schedule pass
    pub fn current_timeframe(&self) -> Option<Timeframe> {
        let window = self.play_window()?;
        let now = self.inner.context.current_time();
        let state = self.lock_state();
        let adjusted_start = state.timeline.adjusted_start()?;
        Some(Timeframe {
            adjusted_start,
            adjusted_end: adjusted_start + window.end(),
            current_time: now - adjusted_start,
            play_duration: window.play_duration,
            offset: window.offset,
            looping: window.looping,
            epoch: state.timeline.epoch(),
            loops: state.timeline.loops(),
        })
    }

    /// Position as a fraction of the duration
    pub fn pct(&self) -> Option<f64> {
        let t = self.current_time()?;
        let duration = self.duration().filter(|d| *d > 0.0)?;
        Some(t / duration)
    }

    /// Seconds left before the end of the play window
    pub fn remaining(&self) -> Option<f64> {
        let t = self.current_time()?;
        let window = self.play_window()?;
        Some(window.end() - t)
    }

    /// Actual clock state
    pub fn state(&self) -> ClockState {
        self.inner.context.state()
    }

    pub fn desired_state(&self) -> DesiredState {
        self.lock_state().desired
    }

    pub fn is_buffering(&self) -> bool {
        self.lock_state().buffering
    }

    /// Every track has its current segment ready, or nothing to play now
    pub fn can_play(&self) -> bool {
        let t = self.current_time();
        self.tracks()
            .iter()
            .all(|track| track.should_and_can_play_at(t))
    }

    /// Start or continue playback
    ///
    /// Fails while no track knows its duration or while buffering. The first
    /// play starts at the offset. The clock resumes right away only when every
    /// track can play; otherwise buffering resumes it later.
    pub async fn play(&self) -> Result<()> {
        let window = self
            .play_window()
            .ok_or_else(|| Error::InvalidState("Cannot play before the duration is known".to_string()))?;

        let first_play = {
            let mut state = self.lock_state();
            if state.destroyed {
                return Err(Error::InvalidState("Controller destroyed".to_string()));
            }
            if state.buffering {
                return Err(Error::InvalidState("Cannot play while buffering".to_string()));
            }
            state.desired = DesiredState::Resumed;
            if state.timeline.is_set() {
                false
            } else {
                let now = self.inner.context.current_time();
                state.timeline.rebase(now, window.offset);
                true
            }
        };

        if first_play {
            self.reset_tracks();
        }

        info!(first_play, t = ?self.current_time(), "Play");
        if self.can_play() {
            self.inner.context.resume().await?;
        } else {
            for track in self.tracks() {
                track.kick();
            }
        }
        self.inner.events.publish(PlayerEvent::Start);
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        self.lock_state().desired = DesiredState::Suspended;
        if self.inner.context.state() == ClockState::Running {
            self.inner.context.suspend().await?;
        }
        info!(t = ?self.current_time(), "Pause");
        self.inner.events.publish(PlayerEvent::Pause);
        Ok(())
    }

    /// Try to play; when buffering, play once buffering ends
    pub async fn play_when_ready(&self) -> Result<()> {
        match self.play().await {
            Err(Error::InvalidState(_)) if self.is_buffering() => {
                debug!("Buffering, deferring play");
                let weak = self.downgrade();
                self.inner.events.once(EventTopic::PauseEnd, move |_| {
                    let Some(controller) = weak.upgrade() else {
                        return;
                    };
                    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                        runtime.spawn(async move {
                            if let Err(e) = controller.play().await {
                                warn!(error = %e, "Deferred play failed");
                            }
                        });
                    }
                });
                Ok(())
            }
            other => other,
        }
    }

    /// Jump to logical time `t`
    ///
    /// `t` must lie in `[0, duration]`; a target outside the play window is
    /// clamped into it. Out of range targets leave everything untouched.
    pub async fn seek(&self, t: f64) -> Result<()> {
        let duration = self
            .duration()
            .ok_or_else(|| Error::InvalidState("Cannot seek before the duration is known".to_string()))?;
        if !t.is_finite() || t < 0.0 || t > duration {
            return Err(Error::InvalidTiming(format!(
                "Seek target {} outside [0, {}]",
                t, duration
            )));
        }
        let window = self
            .play_window()
            .ok_or_else(|| Error::InvalidState("Play window unavailable".to_string()))?;
        let t = window.clamp(t);

        // Disconnecting nodes on a running clock is audible
        if self.inner.context.state() == ClockState::Running {
            self.inner.context.suspend().await?;
        }

        {
            let now = self.inner.context.current_time();
            self.lock_state().timeline.rebase(now, t);
        }

        let pct = if duration > 0.0 { t / duration } else { 0.0 };
        info!(t, "Seek");
        self.inner.events.publish(PlayerEvent::Seek {
            t,
            pct,
            remaining: window.end() - t,
        });

        for track in self.tracks() {
            track.on_seek();
        }

        let (desired, buffering) = {
            let state = self.lock_state();
            (state.desired, state.buffering)
        };
        if desired == DesiredState::Resumed && !buffering && self.can_play() {
            self.inner.context.resume().await?;
        }
        Ok(())
    }

    /// Seek to a fraction of the duration, clamped to `[0, 1]`
    pub async fn seek_pct(&self, pct: f64) -> Result<()> {
        let duration = self
            .duration()
            .ok_or_else(|| Error::InvalidState("Cannot seek before the duration is known".to_string()))?;
        let pct = if pct.is_nan() { 0.0 } else { pct.clamp(0.0, 1.0) };
        self.seek(pct * duration).await
    }

    pub(crate) fn tick(&self) {
        let window = self.play_window();
        let now = self.inner.context.current_time();

        let projection = {
            let mut state = self.lock_state();
            if let Some(timer) = state.tick.take() {
                timer.cancel();
            }
            if state.destroyed {
                return;
            }
            match window {
                Some(window) => state.timeline.project(now, &window),
                None => None,
            }
        };
        let (Some(window), Some(projection)) = (window, projection) else {
            return;
        };

        if projection.wrapped {
            debug!(t = projection.time, "Loop wrapped");
            for track in self.tracks() {
                track.on_loop(projection.loops);
            }
        }

        if !window.looping && projection.time > window.end() {
            self.end();
            return;
        }

        let t = projection.time;
        let pct = self.duration().filter(|d| *d > 0.0).map_or(0.0, |d| t / d);
        self.inner.events.publish(PlayerEvent::TimeUpdate {
            t,
            pct,
            remaining: window.end() - t,
            act: now,
        });

        for track in self.tracks() {
            track.on_tick();
        }

        if self.inner.context.state() == ClockState::Running {
            let weak = self.downgrade();
            let timer = Timer::after(self.inner.config.refresh_rate, move || {
                if let Some(controller) = weak.upgrade() {
                    controller.tick();
                }
            });
            self.lock_state().tick = timer;
        }
    }

    pub(crate) fn untick(&self) {
        if let Some(timer) = self.lock_state().tick.take() {
            timer.cancel();
        }
    }

    /// Playback passed the end of the window without looping
    fn end(&self) {
        {
            let mut state = self.lock_state();
            state.desired = DesiredState::Suspended;
            state.buffering = false;
            state.timeline.reset();
            if let Some(timer) = state.tick.take() {
                timer.cancel();
            }
        }
        self.spawn_clock_op(self.inner.context.suspend(), "suspend");
        self.reset_tracks();
        info!("End of playback");
        self.inner.events.publish(PlayerEvent::End);
    }

    /// Entry point for track progress reports
    pub fn notify(&self, track: &Track, notification: TrackNotification) {
        match notification {
            TrackNotification::LoadingStart => {
                if !self.is_buffering() && !self.can_play() {
                    self.buffering_start();
                }
            }
            TrackNotification::LoadingEnd => {
                if self.is_buffering() && self.can_play() {
                    self.buffering_end();
                }
            }
            TrackNotification::Error(cause) => {
                warn!(track = %track.id(), cause = %cause, "Track error");
                self.inner.events.publish(PlayerEvent::Error { cause });
            }
            TrackNotification::Init => {
                self.inner
                    .events
                    .publish(PlayerEvent::Init { track_id: track.id() });
                self.check_duration();
            }
            TrackNotification::DurationChanged => self.check_duration(),
        }
    }

    fn buffering_start(&self) {
        {
            let mut state = self.lock_state();
            if state.buffering || state.destroyed || !state.timeline.is_set() {
                return;
            }
            state.buffering = true;
        }
        info!(t = ?self.current_time(), "Buffering");
        self.spawn_clock_op(self.inner.context.suspend(), "suspend");
        self.inner.events.publish(PlayerEvent::PauseStart);
    }

    fn buffering_end(&self) {
        let desired = {
            let mut state = self.lock_state();
            if !state.buffering {
                return;
            }
            state.buffering = false;
            state.desired
        };
        info!(t = ?self.current_time(), resume = desired == DesiredState::Resumed, "Buffering finished");
        if desired == DesiredState::Resumed {
            self.spawn_clock_op(self.inner.context.resume(), "resume");
        }
        self.inner.events.publish(PlayerEvent::PauseEnd);
    }

    fn spawn_clock_op(&self, op: BoxFuture<'static, Result<()>>, what: &'static str) {
        let run = async move {
            if let Err(e) = op.await {
                warn!(error = %e, "Clock {} failed", what);
            }
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(run);
        }
    }

    /// Publish `duration` when the aggregate duration changed
    fn check_duration(&self) {
        let duration = self.duration();
        {
            let mut state = self.lock_state();
            if state.last_duration == duration {
                return;
            }
            state.last_duration = duration;
        }
        debug!(?duration, "Duration changed");
        self.inner.events.publish(PlayerEvent::Duration { duration });
    }

    fn reset_tracks(&self) {
        for track in self.tracks() {
            track.reset();
        }
    }

    pub fn volume(&self) -> f64 {
        self.lock_state().volume
    }

    pub fn set_volume(&self, volume: f64) {
        self.lock_state().volume = volume;
        self.inner.gain.set_value(volume);
    }

    /// Ramp the master gain from silence to the current volume
    pub fn fade_in(&self, duration: Option<f64>) {
        fade::fade_in(
            self.inner.gain.as_ref(),
            self.inner.context.current_time(),
            duration.unwrap_or(self.inner.config.fade_duration),
            self.volume(),
        );
    }

    /// Ramp the master gain down to silence
    pub fn fade_out(&self, duration: Option<f64>) {
        fade::fade_out(
            self.inner.gain.as_ref(),
            self.inner.context.current_time(),
            duration.unwrap_or(self.inner.config.fade_duration),
        );
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe<F>(&self, topic: EventTopic, handler: F) -> SubscriptionId
    where
        F: Fn(&PlayerEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(topic, handler)
    }

    pub fn once<F>(&self, topic: EventTopic, handler: F) -> SubscriptionId
    where
        F: Fn(&PlayerEvent) + Send + Sync + 'static,
    {
        self.inner.events.once(topic, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Every event published from now on
    pub fn stream(&self) -> broadcast::Receiver<PlayerEvent> {
        self.inner.events.stream()
    }

    /// Stop ticking, destroy every track and drop all handlers
    ///
    /// The context is closed only when configured to be owned by the
    /// controller.
    pub async fn destroy(&self) -> Result<()> {
        let (tracks, watcher) = {
            let mut state = self.lock_state();
            if state.destroyed {
                return Ok(());
            }
            state.destroyed = true;
            state.desired = DesiredState::Suspended;
            if let Some(timer) = state.tick.take() {
                timer.cancel();
            }
            (std::mem::take(&mut state.tracks), state.watcher.take())
        };

        for track in tracks {
            track.destroy();
        }
        self.inner.gain.disconnect();
        if let Some(watcher) = watcher {
            watcher.abort();
        }

        if self.inner.config.close_context_on_destroy {
            self.inner.context.close().await?;
        } else if self.inner.context.state() == ClockState::Running {
            self.inner.context.suspend().await?;
        }

        self.inner.events.unsubscribe_all();
        info!("Controller destroyed");
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock_state().destroyed
    }
}

//! Per-track scheduler
//!
//! A track owns its segment stack and a gain node feeding the controller's
//! master gain. On every controller tick (or forced after a seek) it runs a
//! schedule pass: take the next segment from the stack, load and connect it
//! with timing derived from the timeline, and report loading state back to the
//! controller so it can run its buffering state machine.
//!
//! Lock order: the track lock may be held while segments are locked, never
//! while calling into the controller.

use super::controller::{Controller, TrackNotification, WeakController};
use super::fade;
use super::segment::{ConnectParams, Segment};
use super::stack::Stack;
use super::timeline::Timeframe;
use crate::audio::{AudioContext, GainNode};
use crate::config::TrackConfig;
use crate::error::{Error, Result};
use crate::fetch::{fetch_cancellable, Fetcher};
use crate::manifest::{parse_m3u8, SegmentSource};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Accept header sent with manifest requests
const MANIFEST_ACCEPT: &str = "application/x-mpegURL, application/vnd.apple.mpegurl";

struct TrackState {
    stack: Stack,
    /// Skip non-forced passes until the timeline reaches this point
    schedule_not_before: Option<f64>,
    manifest_load: Option<(u64, CancellationToken)>,
    load_seq: u64,
    src: Option<String>,
    volume: f64,
    destroyed: bool,
}

struct TrackInner {
    id: Uuid,
    controller: WeakController,
    context: Arc<dyn AudioContext>,
    gain: Arc<dyn GainNode>,
    fetcher: Arc<dyn Fetcher>,
    config: TrackConfig,
    state: Mutex<TrackState>,
}

/// Shared handle to a track
#[derive(Clone)]
pub struct Track {
    inner: Arc<TrackInner>,
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track").field("id", &self.inner.id).finish()
    }
}

impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Track {
    /// Create a track and register it with `controller`
    pub fn new(controller: &Controller, fetcher: Arc<dyn Fetcher>, config: TrackConfig) -> Self {
        let context = controller.context();
        let gain = context.create_gain();
        gain.connect(controller.master_gain().id());
        gain.set_value(config.volume);

        let mut stack = Stack::new(config.start, config.next_margin);
        stack.set_duration(config.duration);

        let track = Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4(),
                controller: controller.downgrade(),
                context,
                gain,
                fetcher,
                state: Mutex::new(TrackState {
                    stack,
                    schedule_not_before: None,
                    manifest_load: None,
                    load_seq: 0,
                    src: None,
                    volume: config.volume,
                    destroyed: false,
                }),
                config,
            }),
        };

        controller.observe(&track);
        track
    }

    fn state(&self) -> MutexGuard<'_, TrackState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn controller(&self) -> Option<Controller> {
        self.inner.controller.upgrade()
    }

    fn notify(&self, notification: TrackNotification) {
        if let Some(controller) = self.controller() {
            controller.notify(self, notification);
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Location of the last manifest passed to `load`
    pub fn src(&self) -> Option<String> {
        self.state().src.clone()
    }

    /// Fetch and parse a manifest, then build the segment stack
    ///
    /// Failures are also reported as an `error` event. Cancellation (a newer
    /// `load`, `cancel` or `destroy`) returns `Error::Cancelled` silently.
    pub async fn load(&self, src: &str) -> Result<Vec<SegmentSource>> {
        let (seq, token) = {
            let mut state = self.state();
            if let Some((_, previous)) = state.manifest_load.take() {
                previous.cancel();
            }
            state.load_seq += 1;
            let token = CancellationToken::new();
            state.manifest_load = Some((state.load_seq, token.clone()));
            state.src = Some(src.to_string());
            (state.load_seq, token)
        };

        info!(track = %self.inner.id, url = %src, "Loading manifest");
        let options = self
            .inner
            .config
            .fetch_options
            .with_defaults(&[("Accept", MANIFEST_ACCEPT)]);

        let result = async {
            let response =
                fetch_cancellable(self.inner.fetcher.as_ref(), src, &options, token).await?;
            if !response.ok() {
                return Err(Error::Http {
                    status: response.status,
                    url: src.to_string(),
                });
            }
            parse_m3u8(&response.text(), src)
        }
        .await;

        {
            let mut state = self.state();
            if matches!(state.manifest_load, Some((current, _)) if current == seq) {
                state.manifest_load = None;
            }
        }

        match result {
            Ok(sources) => {
                self.build_segments(&sources);
                info!(
                    track = %self.inner.id,
                    url = %src,
                    segments = sources.len(),
                    duration = self.duration(),
                    "Manifest loaded"
                );
                self.notify(TrackNotification::Init);
                Ok(sources)
            }
            Err(e) if e.is_cancelled() => {
                debug!(track = %self.inner.id, url = %src, "Manifest load cancelled");
                Err(e)
            }
            Err(e) => {
                warn!(track = %self.inner.id, url = %src, error = %e, "Manifest load failed");
                self.notify(TrackNotification::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Populate the stack from manifest text already at hand
    pub fn load_from_m3u8(&self, manifest: &str, src: &str) -> Result<()> {
        let sources = parse_m3u8(manifest, src)?;
        self.state().src = Some(src.to_string());
        self.build_segments(&sources);
        self.notify(TrackNotification::DurationChanged);
        Ok(())
    }

    fn build_segments(&self, sources: &[SegmentSource]) {
        let segments: Vec<Segment> = sources
            .iter()
            .map(|source| {
                Segment::new(
                    source.clone(),
                    self.inner.fetcher.clone(),
                    self.inner.config.fetch_options.clone(),
                    self.inner.config.cache_grace,
                )
            })
            .collect();

        let mut state = self.state();
        if !state.destroyed {
            state.stack.push(segments);
        }
    }

    /// Abort a manifest load in progress
    pub fn cancel(&self) {
        if let Some((_, token)) = self.state().manifest_load.take() {
            token.cancel();
        }
    }

    /// Snapshot of the track's segments in playback order
    pub fn segments(&self) -> Vec<Segment> {
        self.state().stack.segments().to_vec()
    }

    pub fn duration(&self) -> f64 {
        self.state().stack.duration()
    }

    /// Override the duration derived from the segments
    pub fn set_duration(&self, duration: Option<f64>) {
        self.state().stack.set_duration(duration);
        self.notify(TrackNotification::DurationChanged);
    }

    pub fn start(&self) -> f64 {
        self.state().stack.start()
    }

    /// Move the track on the shared timeline
    pub fn set_start(&self, start: f64) {
        {
            let mut state = self.state();
            state.stack.set_start(start);
            state.schedule_not_before = None;
        }
        self.notify(TrackNotification::DurationChanged);
        self.spawn_pass(true);
    }

    /// Where the track ends on the shared timeline, once it has a duration
    pub fn end(&self) -> Option<f64> {
        let state = self.state();
        let duration = state.stack.duration();
        (duration > 0.0).then(|| state.stack.start() + duration)
    }

    pub fn volume(&self) -> f64 {
        self.state().volume
    }

    pub fn set_volume(&self, volume: f64) {
        self.state().volume = volume;
        self.inner.gain.set_value(volume);
    }

    pub fn fade_in(&self, duration: Option<f64>) {
        let target = self.volume();
        let duration = duration.unwrap_or(self.fade_duration());
        fade::fade_in(
            self.inner.gain.as_ref(),
            self.inner.context.current_time(),
            duration,
            target,
        );
    }

    pub fn fade_out(&self, duration: Option<f64>) {
        let duration = duration.unwrap_or(self.fade_duration());
        fade::fade_out(
            self.inner.gain.as_ref(),
            self.inner.context.current_time(),
            duration,
        );
    }

    fn fade_duration(&self) -> f64 {
        self.controller()
            .map(|c| c.config().fade_duration)
            .unwrap_or(crate::config::DEFAULT_FADE_DURATION)
    }

    /// Whether the segment at the controller's current time is ready
    pub fn can_play(&self) -> bool {
        let t = self.controller().and_then(|c| c.current_time());
        t.is_some_and(|t| self.state().stack.get_at(t).is_some_and(Segment::is_ready))
    }

    /// Ready, or nothing to play at the current time
    pub fn should_and_can_play(&self) -> bool {
        let t = self.controller().and_then(|c| c.current_time());
        self.should_and_can_play_at(t)
    }

    pub(crate) fn should_and_can_play_at(&self, t: Option<f64>) -> bool {
        match t {
            Some(t) => self
                .state()
                .stack
                .get_at(t)
                .map_or(true, Segment::is_ready),
            None => true,
        }
    }

    /// One scheduling step
    ///
    /// Non-forced passes are skipped until the timeline reaches the watermark
    /// set by the last successful connect.
    pub async fn run_schedule_pass(&self, force: bool) {
        let Some(controller) = self.controller() else {
            return;
        };
        let Some(timeframe) = controller.current_timeframe() else {
            return;
        };

        {
            let mut state = self.state();
            if state.destroyed {
                return;
            }
            if force {
                state.schedule_not_before = None;
            }
            if let Some(not_before) = state.schedule_not_before {
                if timeframe.current_time < not_before {
                    return;
                }
            }
        }

        self.schedule_at(&controller, timeframe).await;
    }

    async fn schedule_at(&self, controller: &Controller, timeframe: Timeframe) {
        let (segment, claim) = {
            let mut state = self.state();
            let Some(segment) = state.stack.consume(&timeframe) else {
                return;
            };
            let claim = segment.claim();
            (segment, claim)
        };

        controller.notify(self, TrackNotification::LoadingStart);

        if let Err(e) = self.prepare(controller, &segment, claim, timeframe.epoch).await {
            if e.is_cancelled() {
                debug!(track = %self.inner.id, url = %segment.src(), "Segment preparation cancelled");
            } else {
                warn!(track = %self.inner.id, url = %segment.src(), error = %e, "Segment preparation failed");
                controller.notify(self, TrackNotification::Error(e.to_string()));
            }
        }

        self.state().stack.release(&segment, claim);
        controller.notify(self, TrackNotification::LoadingEnd);
    }

    /// Fetch, time and connect one consumed segment
    ///
    /// Seeks, window changes and teardown void `claim` through the stack, so
    /// a pass that lost the segment while awaiting ends as a cancellation.
    async fn prepare(
        &self,
        controller: &Controller,
        segment: &Segment,
        claim: u64,
        epoch: u64,
    ) -> Result<()> {
        if segment.needs_fetch() {
            segment.load().await?;
        }

        // Timing is taken after the fetch so a slow load starts with a
        // matching in-segment offset
        let timeframe = controller
            .current_timeframe()
            .filter(|tf| tf.epoch == epoch)
            .ok_or(Error::Cancelled)?;
        let in_next_loop = timeframe.is_next_loop(segment.next_loop_of());
        let params = ConnectParams {
            destination: self.inner.gain.id(),
            start: timeframe.calculate_real_start(segment.start(), in_next_loop),
            offset: timeframe.calculate_offset(segment.start(), in_next_loop),
            stop: timeframe.calculate_stop(in_next_loop),
        };

        segment
            .connect_claimed(&self.inner.context, params, claim)
            .await?;

        // A seek during decode invalidated these absolute times
        if controller.epoch() != epoch || self.state().destroyed {
            segment.disconnect_claimed(claim);
            return Err(Error::Cancelled);
        }

        let mut state = self.state();
        if segment.claim() != claim {
            return Err(Error::Cancelled);
        }
        if !in_next_loop {
            state.schedule_not_before = Some(segment.end() - segment.duration() / 2.0);
        }
        state.stack.recalculate_start_times();
        Ok(())
    }

    fn spawn_pass(&self, force: bool) {
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let track = self.clone();
            runtime.spawn(async move { track.run_schedule_pass(force).await });
        }
    }

    pub(crate) fn on_tick(&self) {
        self.spawn_pass(false);
    }

    /// Everything scheduled so far refers to the old timeline
    pub(crate) fn on_seek(&self) {
        {
            let mut state = self.state();
            state.stack.disconnect_all();
            state.schedule_not_before = None;
        }
        self.spawn_pass(true);
    }

    /// Request a forced pass without disconnecting anything
    pub(crate) fn kick(&self) {
        self.spawn_pass(true);
    }

    /// Stop times or loop parameters changed
    pub(crate) fn reset(&self) {
        {
            let mut state = self.state();
            state.stack.disconnect_all();
            state.schedule_not_before = None;
        }
        self.spawn_pass(true);
    }

    /// The timeline wrapped back to the loop start, `loops` wraps so far
    pub(crate) fn on_loop(&self, loops: u64) {
        let mut state = self.state();
        state.stack.clear_next_loop(loops);
        state.schedule_not_before = None;
    }

    /// Cancel loads, disconnect everything and leave the controller
    pub fn destroy(&self) {
        self.cancel();
        {
            let mut state = self.state();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.stack.destroy();
        }
        self.inner.gain.disconnect();
        if let Some(controller) = self.controller() {
            controller.unobserve(self);
        }
    }
}

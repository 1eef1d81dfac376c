//! Headless audio context
//!
//! Implements [`AudioContext`] without an output device. The clock is derived
//! from tokio's monotonic clock and only advances while running, so it follows
//! paused test time exactly. Every node operation is recorded as a
//! [`NodeEvent`], and a render task fires `ended` callbacks once the clock
//! passes a source's stop time or the end of its buffer.

use super::{
    decode, AudioBuffer, AudioContext, EndedCallback, GainNode, NodeId, SourceNode,
};
use crate::error::{Error, Result};
use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use segue_common::ClockState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// How often the render task checks for finished sources
const RENDER_INTERVAL: Duration = Duration::from_millis(20);

/// Synchronous decoder used instead of symphonia
pub type DecodeFn = Arc<dyn Fn(Bytes) -> Result<Arc<dyn AudioBuffer>> + Send + Sync>;

/// Recorded node operation
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    State(ClockState),
    Connect { node: NodeId, destination: NodeId },
    Disconnect { node: NodeId },
    Start { node: NodeId, when: f64, offset: f64 },
    Stop { node: NodeId, when: Option<f64> },
    Ended { node: NodeId },
    SetGain { node: NodeId, value: f64 },
    SetGainAtTime { node: NodeId, value: f64, when: f64 },
    RampGain { node: NodeId, value: f64, when: f64 },
}

/// Buffer of silence with a fixed length
#[derive(Debug, Clone, PartialEq)]
pub struct SilentBuffer {
    pub duration: f64,
}

impl AudioBuffer for SilentBuffer {
    fn duration(&self) -> f64 {
        self.duration
    }
}

#[derive(Debug, Default)]
struct Clock {
    elapsed: f64,
    running_since: Option<Instant>,
}

impl Clock {
    fn now(&self) -> f64 {
        self.elapsed
            + self
                .running_since
                .map_or(0.0, |since| since.elapsed().as_secs_f64())
    }

    fn stop(&mut self) {
        self.elapsed = self.now();
        self.running_since = None;
    }
}

struct SourceState {
    connected: Option<NodeId>,
    start_at: Option<f64>,
    offset: f64,
    stop_at: Option<f64>,
    on_ended: Option<EndedCallback>,
    ended: bool,
}

struct SourceShared {
    id: NodeId,
    buffer_duration: f64,
    state: Mutex<SourceState>,
}

impl SourceShared {
    /// Clock time at which output ends, if started
    fn end_time(&self, state: &SourceState) -> Option<f64> {
        let start = state.start_at?;
        let natural = start + (self.buffer_duration - state.offset).max(0.0);
        Some(match state.stop_at {
            Some(stop) => stop.min(natural),
            None => natural,
        })
    }
}

struct Inner {
    clock: Mutex<Clock>,
    state_tx: watch::Sender<ClockState>,
    next_id: AtomicU64,
    destination: NodeId,
    log: Mutex<Vec<NodeEvent>>,
    sources: Mutex<Vec<Weak<SourceShared>>>,
    render: Mutex<Option<JoinHandle<()>>>,
    decoder: Option<DecodeFn>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn now(&self) -> f64 {
        lock(&self.clock).now()
    }

    fn next_node_id(&self) -> NodeId {
        NodeId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn record(&self, event: NodeEvent) {
        lock(&self.log).push(event);
    }

    /// Fire ended callbacks for sources whose output is over
    fn render_once(&self) {
        let now = self.now();
        let mut finished: Vec<(NodeId, Option<EndedCallback>)> = Vec::new();

        {
            let mut sources = lock(&self.sources);
            sources.retain(|weak| {
                let Some(source) = weak.upgrade() else {
                    return false;
                };
                let mut state = lock(&source.state);
                if state.ended {
                    return false;
                }
                // A source ending exactly now still covers this instant
                match source.end_time(&state) {
                    Some(end) if now > end => {
                        state.ended = true;
                        finished.push((source.id, state.on_ended.take()));
                        false
                    }
                    _ => true,
                }
            });
        }

        // Callbacks may call back into the context, run them unlocked
        for (node, callback) in finished {
            self.record(NodeEvent::Ended { node });
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    fn set_state(&self, state: ClockState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!(state = %state, "Audio clock state changed");
            self.record(NodeEvent::State(state));
        }
    }
}

/// Audio context with a virtual clock and silent output
#[derive(Clone)]
pub struct HeadlessContext {
    inner: Arc<Inner>,
}

impl Default for HeadlessContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessContext {
    /// Context decoding segments with symphonia
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Context decoding segments with `decoder`
    pub fn with_decoder<F>(decoder: F) -> Self
    where
        F: Fn(Bytes) -> Result<Arc<dyn AudioBuffer>> + Send + Sync + 'static,
    {
        Self::build(Some(Arc::new(decoder)))
    }

    fn build(decoder: Option<DecodeFn>) -> Self {
        let (state_tx, _) = watch::channel(ClockState::Suspended);
        Self {
            inner: Arc::new(Inner {
                clock: Mutex::new(Clock::default()),
                state_tx,
                next_id: AtomicU64::new(1),
                destination: NodeId(0),
                log: Mutex::new(Vec::new()),
                sources: Mutex::new(Vec::new()),
                render: Mutex::new(None),
                decoder,
            }),
        }
    }

    /// Snapshot of every recorded node operation
    pub fn events(&self) -> Vec<NodeEvent> {
        lock(&self.inner.log).clone()
    }

    pub fn clear_events(&self) {
        lock(&self.inner.log).clear();
    }

    /// Sources that are started and have not ended yet
    pub fn active_sources(&self) -> usize {
        lock(&self.inner.sources)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|s| {
                let state = lock(&s.state);
                state.start_at.is_some() && !state.ended
            })
            .count()
    }

    /// Run one render step immediately
    pub fn render_now(&self) {
        self.inner.render_once();
    }

    fn ensure_render_task(&self) {
        let mut render = lock(&self.inner.render);
        if render.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        *render = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval(RENDER_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if *inner.state_tx.borrow() == ClockState::Closed {
                    break;
                }
                inner.render_once();
            }
        }));
    }
}

impl AudioContext for HeadlessContext {
    fn current_time(&self) -> f64 {
        self.inner.now()
    }

    fn state(&self) -> ClockState {
        *self.inner.state_tx.borrow()
    }

    fn state_changes(&self) -> watch::Receiver<ClockState> {
        self.inner.state_tx.subscribe()
    }

    fn suspend(&self) -> BoxFuture<'static, Result<()>> {
        if self.state() == ClockState::Closed {
            return future::ready(Err(Error::AudioContext(
                "Cannot suspend a closed context".to_string(),
            )))
            .boxed();
        }
        lock(&self.inner.clock).stop();
        self.inner.set_state(ClockState::Suspended);
        future::ready(Ok(())).boxed()
    }

    fn resume(&self) -> BoxFuture<'static, Result<()>> {
        if self.state() == ClockState::Closed {
            return future::ready(Err(Error::AudioContext(
                "Cannot resume a closed context".to_string(),
            )))
            .boxed();
        }
        {
            let mut clock = lock(&self.inner.clock);
            if clock.running_since.is_none() {
                clock.running_since = Some(Instant::now());
            }
        }
        self.inner.set_state(ClockState::Running);
        self.ensure_render_task();
        future::ready(Ok(())).boxed()
    }

    fn close(&self) -> BoxFuture<'static, Result<()>> {
        lock(&self.inner.clock).stop();
        self.inner.set_state(ClockState::Closed);
        if let Some(handle) = lock(&self.inner.render).take() {
            handle.abort();
        }
        future::ready(Ok(())).boxed()
    }

    fn destination(&self) -> NodeId {
        self.inner.destination
    }

    fn create_gain(&self) -> Arc<dyn GainNode> {
        Arc::new(HeadlessGain {
            id: self.inner.next_node_id(),
            context: self.inner.clone(),
            automation: Mutex::new(GainAutomation::new(1.0)),
        })
    }

    fn create_buffer_source(&self, buffer: Arc<dyn AudioBuffer>) -> Box<dyn SourceNode> {
        let shared = Arc::new(SourceShared {
            id: self.inner.next_node_id(),
            buffer_duration: buffer.duration(),
            state: Mutex::new(SourceState {
                connected: None,
                start_at: None,
                offset: 0.0,
                stop_at: None,
                on_ended: None,
                ended: false,
            }),
        });
        lock(&self.inner.sources).push(Arc::downgrade(&shared));
        Box::new(HeadlessSource {
            shared,
            context: self.inner.clone(),
        })
    }

    fn decode_audio_data(&self, data: Bytes) -> BoxFuture<'static, Result<Arc<dyn AudioBuffer>>> {
        match self.inner.decoder.clone() {
            Some(decoder) => future::ready(decoder(data)).boxed(),
            None => async move {
                let pcm = tokio::task::spawn_blocking(move || decode::decode_bytes(data))
                    .await
                    .map_err(|e| Error::Internal(format!("Decode task failed: {}", e)))??;
                Ok(Arc::new(pcm) as Arc<dyn AudioBuffer>)
            }
            .boxed(),
        }
    }
}

/// Scheduled gain changes, evaluated lazily against the clock
struct GainAutomation {
    base: f64,
    points: Vec<(f64, f64, bool)>,
}

impl GainAutomation {
    fn new(base: f64) -> Self {
        Self {
            base,
            points: Vec::new(),
        }
    }

    /// Value at `now`; points are `(time, value, is_ramp)` in insertion order
    fn value_at(&self, now: f64) -> f64 {
        let mut prev_time = f64::NEG_INFINITY;
        let mut prev_value = self.base;
        for &(time, value, is_ramp) in &self.points {
            if time <= now {
                prev_time = time;
                prev_value = value;
                continue;
            }
            if is_ramp && prev_time.is_finite() && time > prev_time {
                let progress = (now - prev_time) / (time - prev_time);
                return prev_value + (value - prev_value) * progress;
            }
            return prev_value;
        }
        prev_value
    }
}

struct HeadlessGain {
    id: NodeId,
    context: Arc<Inner>,
    automation: Mutex<GainAutomation>,
}

impl GainNode for HeadlessGain {
    fn id(&self) -> NodeId {
        self.id
    }

    fn value(&self) -> f64 {
        let now = self.context.now();
        lock(&self.automation).value_at(now)
    }

    fn set_value(&self, value: f64) {
        *lock(&self.automation) = GainAutomation::new(value);
        self.context.record(NodeEvent::SetGain {
            node: self.id,
            value,
        });
    }

    fn set_value_at_time(&self, value: f64, when: f64) {
        lock(&self.automation).points.push((when, value, false));
        self.context.record(NodeEvent::SetGainAtTime {
            node: self.id,
            value,
            when,
        });
    }

    fn linear_ramp_to_value_at_time(&self, value: f64, when: f64) {
        lock(&self.automation).points.push((when, value, true));
        self.context.record(NodeEvent::RampGain {
            node: self.id,
            value,
            when,
        });
    }

    fn connect(&self, destination: NodeId) {
        self.context.record(NodeEvent::Connect {
            node: self.id,
            destination,
        });
    }

    fn disconnect(&self) {
        self.context.record(NodeEvent::Disconnect { node: self.id });
    }
}

struct HeadlessSource {
    shared: Arc<SourceShared>,
    context: Arc<Inner>,
}

impl SourceNode for HeadlessSource {
    fn id(&self) -> NodeId {
        self.shared.id
    }

    fn connect(&mut self, destination: NodeId) {
        lock(&self.shared.state).connected = Some(destination);
        self.context.record(NodeEvent::Connect {
            node: self.shared.id,
            destination,
        });
    }

    fn disconnect(&mut self) {
        lock(&self.shared.state).connected = None;
        self.context.record(NodeEvent::Disconnect {
            node: self.shared.id,
        });
    }

    fn start(&mut self, when: f64, offset: f64) {
        // A start time in the past means "now"
        let effective = when.max(self.context.now());
        {
            let mut state = lock(&self.shared.state);
            state.start_at = Some(effective);
            state.offset = offset.max(0.0);
        }
        self.context.record(NodeEvent::Start {
            node: self.shared.id,
            when,
            offset,
        });
    }

    fn stop(&mut self, when: Option<f64>) {
        let at = when.unwrap_or_else(|| self.context.now());
        lock(&self.shared.state).stop_at = Some(at);
        self.context.record(NodeEvent::Stop {
            node: self.shared.id,
            when,
        });
    }

    fn set_on_ended(&mut self, callback: Option<EndedCallback>) {
        lock(&self.shared.state).on_ended = callback;
    }
}

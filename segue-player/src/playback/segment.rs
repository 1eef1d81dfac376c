//! One fetchable, decodable unit of audio
//!
//! Lifecycle: unloaded → loading → loaded (raw bytes) → connected (decoded,
//! source node scheduled) → disconnected (decoded audio cached) → evicted.
//!
//! Invariants:
//! - At most one source node at a time; connecting twice is an error.
//! - `is_ready()` ⇔ a source node exists, `is_loaded()` ⇔ decoded audio exists.
//! - A failed fetch is sticky: later `load()` calls fail without a request.
//! - A schedule pass owns the segment through a claim. Cancelling or handing
//!   the segment to another pass voids the claim, and a pass holding a void
//!   claim never installs a node.

use crate::audio::{AudioBuffer, AudioContext, NodeId, SourceNode};
use crate::config::FetchOptions;
use crate::error::{Error, Result};
use crate::fetch::{fetch_cancellable, Fetcher};
use crate::manifest::SegmentSource;
use crate::timer::Timer;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Differences below this are not reported as duration corrections
const DURATION_EPSILON: f64 = 1e-6;

/// Timing for [`Segment::connect`], in clock seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectParams {
    pub destination: NodeId,
    pub start: f64,
    pub offset: f64,
    pub stop: f64,
}

struct SegmentState {
    /// Declared duration until decoded, then the decoded length
    duration: f64,
    start: f64,
    bytes: Option<Bytes>,
    buffer: Option<Arc<dyn AudioBuffer>>,
    node: Option<Box<dyn SourceNode>>,
    loading: Option<(u64, CancellationToken)>,
    load_seq: u64,
    fetch_failed: bool,
    in_transit: bool,
    /// Loop count at which the segment was picked for the following loop
    next_loop_of: Option<u64>,
    /// Bumped whenever a pass takes the segment or loading is cancelled
    claim: u64,
    eviction: Option<Timer>,
    /// Bumped on connect and disconnect; stale ended callbacks compare against it
    generation: u64,
}

struct SegmentInner {
    src: String,
    fetcher: Arc<dyn Fetcher>,
    fetch_options: FetchOptions,
    cache_grace: Duration,
    state: Mutex<SegmentState>,
}

/// Shared handle to a segment
#[derive(Clone)]
pub struct Segment {
    inner: Arc<SegmentInner>,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Segment")
            .field("src", &self.inner.src)
            .field("start", &state.start)
            .field("duration", &state.duration)
            .field("ready", &state.node.is_some())
            .field("loaded", &state.buffer.is_some())
            .field("in_transit", &state.in_transit)
            .finish()
    }
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Segment {
    pub fn new(
        source: SegmentSource,
        fetcher: Arc<dyn Fetcher>,
        fetch_options: FetchOptions,
        cache_grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SegmentInner {
                src: source.url,
                fetcher,
                fetch_options,
                cache_grace,
                state: Mutex::new(SegmentState {
                    duration: source.duration,
                    start: 0.0,
                    bytes: None,
                    buffer: None,
                    node: None,
                    loading: None,
                    load_seq: 0,
                    fetch_failed: false,
                    in_transit: false,
                    next_loop_of: None,
                    claim: 0,
                    eviction: None,
                    generation: 0,
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SegmentState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn src(&self) -> &str {
        &self.inner.src
    }

    pub fn duration(&self) -> f64 {
        self.state().duration
    }

    pub fn set_duration(&self, duration: f64) {
        self.state().duration = duration;
    }

    pub fn start(&self) -> f64 {
        self.state().start
    }

    pub(crate) fn set_start(&self, start: f64) {
        self.state().start = start;
    }

    pub fn end(&self) -> f64 {
        let state = self.state();
        state.start + state.duration
    }

    pub fn is_ready(&self) -> bool {
        self.state().node.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.state().buffer.is_some()
    }

    /// Neither raw bytes nor decoded audio are held
    pub fn needs_fetch(&self) -> bool {
        let state = self.state();
        state.buffer.is_none() && state.bytes.is_none()
    }

    pub fn is_loading(&self) -> bool {
        self.state().loading.is_some()
    }

    pub fn fetch_failed(&self) -> bool {
        self.state().fetch_failed
    }

    pub fn in_transit(&self) -> bool {
        self.state().in_transit
    }

    pub(crate) fn set_in_transit(&self, in_transit: bool) {
        self.state().in_transit = in_transit;
    }

    /// Hand the segment to a schedule pass, voiding any earlier claim
    ///
    /// `next_loop_of` is the loop count of the pass when the segment is
    /// prepared for the loop after it.
    pub(crate) fn begin_transit(&self, next_loop_of: Option<u64>) -> u64 {
        let mut state = self.state();
        state.in_transit = true;
        state.next_loop_of = next_loop_of;
        state.claim += 1;
        state.claim
    }

    /// Release the segment unless another pass has taken it since
    pub(crate) fn end_transit(&self, claim: u64) {
        let mut state = self.state();
        if state.claim == claim {
            state.in_transit = false;
        }
    }

    pub(crate) fn claim(&self) -> u64 {
        self.state().claim
    }

    /// Whether the segment is being prepared for the next loop
    pub fn in_next_loop(&self) -> bool {
        self.state().next_loop_of.is_some()
    }

    /// Loop count at which the segment was marked for the next loop
    pub fn next_loop_of(&self) -> Option<u64> {
        self.state().next_loop_of
    }

    /// Drop next-loop marks made before loop `loops`
    pub(crate) fn expire_next_loop(&self, loops: u64) {
        let mut state = self.state();
        if state.next_loop_of.is_some_and(|of| of < loops) {
            state.next_loop_of = None;
        }
    }

    /// Fetch the raw payload
    ///
    /// A previous non-cancellation failure is returned again without a request.
    /// Starting a load supersedes one still in flight, whose caller then sees
    /// a cancellation.
    pub async fn load(&self) -> Result<()> {
        let (seq, token) = {
            let mut state = self.state();
            if state.fetch_failed {
                return Err(Error::Load {
                    url: self.inner.src.clone(),
                    reason: "previous fetch failed".to_string(),
                });
            }
            if let Some((_, previous)) = state.loading.take() {
                previous.cancel();
            }
            state.load_seq += 1;
            let token = CancellationToken::new();
            state.loading = Some((state.load_seq, token.clone()));
            (state.load_seq, token)
        };

        debug!(url = %self.inner.src, "Fetching segment");
        let result = fetch_cancellable(
            self.inner.fetcher.as_ref(),
            &self.inner.src,
            &self.inner.fetch_options,
            token,
        )
        .await;

        let mut state = self.state();
        if matches!(state.loading, Some((current, _)) if current == seq) {
            state.loading = None;
        }

        match result {
            Ok(response) if response.ok() => {
                debug!(url = %self.inner.src, bytes = response.body.len(), "Segment fetched");
                state.bytes = Some(response.body);
                Ok(())
            }
            Ok(response) => {
                state.fetch_failed = true;
                warn!(url = %self.inner.src, status = response.status, "Segment fetch failed");
                Err(Error::Http {
                    status: response.status,
                    url: self.inner.src.clone(),
                })
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                state.fetch_failed = true;
                warn!(url = %self.inner.src, error = %e, "Segment fetch failed");
                Err(e)
            }
        }
    }

    /// Abort an in-flight load, if any, and void the current claim
    pub fn cancel(&self) {
        let mut state = self.state();
        state.claim += 1;
        if let Some((_, token)) = state.loading.take() {
            token.cancel();
        }
    }

    /// Decode if needed and schedule a source node
    pub async fn connect(&self, context: &Arc<dyn AudioContext>, params: ConnectParams) -> Result<()> {
        self.attach(context, params, None).await
    }

    /// Like [`Segment::connect`], for the pass holding `claim`
    ///
    /// Fails with [`Error::Cancelled`] once the claim is void, before or after
    /// the decode. A decode finished for a void claim is still cached.
    pub(crate) async fn connect_claimed(
        &self,
        context: &Arc<dyn AudioContext>,
        params: ConnectParams,
        claim: u64,
    ) -> Result<()> {
        self.attach(context, params, Some(claim)).await
    }

    async fn attach(
        &self,
        context: &Arc<dyn AudioContext>,
        params: ConnectParams,
        claim: Option<u64>,
    ) -> Result<()> {
        let pending = {
            let mut state = self.state();
            if claim.is_some_and(|claim| claim != state.claim) {
                return Err(Error::Cancelled);
            }
            if state.node.is_some() {
                return Err(Error::InvalidState(format!(
                    "Cannot connect segment {} twice",
                    self.inner.src
                )));
            }
            state.eviction = None;

            match (&state.buffer, &state.bytes) {
                (Some(buffer), _) => Ok(buffer.clone()),
                (None, Some(bytes)) => Err(bytes.clone()),
                (None, None) => {
                    return Err(Error::InvalidState(format!(
                        "Cannot connect {}: no audio data in buffer",
                        self.inner.src
                    )))
                }
            }
        };

        let buffer = match pending {
            Ok(buffer) => buffer,
            Err(bytes) => match context.decode_audio_data(bytes).await {
                Ok(buffer) => buffer,
                Err(e) => {
                    // The payload is unusable; treat it like a failed fetch
                    let mut state = self.state();
                    state.bytes = None;
                    state.fetch_failed = true;
                    return Err(e);
                }
            },
        };

        let mut state = self.state();
        let stale = claim.is_some_and(|claim| claim != state.claim);
        if stale || state.node.is_some() {
            if state.buffer.is_none() && state.node.is_none() {
                self.store_decoded(&mut state, buffer);
            }
            if stale {
                debug!(url = %self.inner.src, "Segment taken over during decode");
                return Err(Error::Cancelled);
            }
            return Err(Error::InvalidState(format!(
                "Cannot connect segment {} twice",
                self.inner.src
            )));
        }

        self.store_decoded(&mut state, buffer.clone());

        state.generation += 1;
        let generation = state.generation;

        let mut node = context.create_buffer_source(buffer);
        node.connect(params.destination);

        let weak = Arc::downgrade(&self.inner);
        node.set_on_ended(Some(Box::new(move || on_node_ended(weak, generation))));
        node.start(params.start, params.offset);
        node.stop(Some(params.stop));

        debug!(
            url = %self.inner.src,
            start = params.start,
            offset = params.offset,
            stop = params.stop,
            "Segment connected"
        );

        state.node = Some(node);
        Ok(())
    }

    fn store_decoded(&self, state: &mut SegmentState, buffer: Arc<dyn AudioBuffer>) {
        let decoded = buffer.duration();
        if (decoded - state.duration).abs() > DURATION_EPSILON {
            debug!(
                url = %self.inner.src,
                declared = state.duration,
                decoded,
                "Corrected segment duration"
            );
        }
        state.duration = decoded;
        state.bytes = None;
        state.buffer = Some(buffer);
    }

    /// Tear down the source node now, drop decoded audio after the grace period
    pub fn disconnect(&self) {
        let state = self.state();
        self.release_node(state);
    }

    /// Disconnect only while `claim` is still current
    pub(crate) fn disconnect_claimed(&self, claim: u64) {
        let state = self.state();
        if state.claim == claim {
            self.release_node(state);
        }
    }

    fn release_node(&self, mut state: MutexGuard<'_, SegmentState>) {
        let Some(mut node) = state.node.take() else {
            return;
        };
        state.generation += 1;

        node.set_on_ended(None);
        node.disconnect();
        node.stop(None);

        let weak = Arc::downgrade(&self.inner);
        match Timer::after(self.inner.cache_grace, move || evict(weak)) {
            Some(timer) => state.eviction = Some(timer),
            None => state.buffer = None,
        }
    }

    /// Disconnect only if still on the connection that ended
    fn disconnect_if_current(&self, generation: u64) {
        let current = {
            let state = self.state();
            state.generation == generation && state.node.is_some()
        };
        if current {
            self.disconnect();
        }
    }

    /// Cancel loading and release everything
    pub fn destroy(&self) {
        self.cancel();
        self.disconnect();
        let mut state = self.state();
        state.eviction = None;
        state.bytes = None;
        state.buffer = None;
    }
}

fn on_node_ended(weak: Weak<SegmentInner>, generation: u64) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let segment = Segment { inner };
    // Deferred by one turn so the next segment is armed before this one is
    // observed as not ready
    let deferred = segment.clone();
    match Timer::after(Duration::ZERO, move || deferred.disconnect_if_current(generation)) {
        Some(timer) => timer.detach(),
        None => segment.disconnect_if_current(generation),
    }
}

fn evict(weak: Weak<SegmentInner>) {
    if let Some(inner) = weak.upgrade() {
        let mut state = inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.node.is_none() {
            state.buffer = None;
        }
    }
}

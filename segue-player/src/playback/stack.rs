//! Ordered segments of one track and the "what to prepare next" policy

use super::segment::Segment;
use super::timeline::Timeframe;

pub struct Stack {
    segments: Vec<Segment>,
    /// Position of the first segment on the shared timeline
    initial_start: f64,
    /// Where the next pushed segment starts
    start_pointer: f64,
    duration_override: Option<f64>,
    /// Look-ahead for loop and delayed-start pre-roll, in seconds
    next_margin: f64,
}

impl Stack {
    pub fn new(start: f64, next_margin: f64) -> Self {
        Self {
            segments: Vec::new(),
            initial_start: start,
            start_pointer: start,
            duration_override: None,
            next_margin,
        }
    }

    /// Append segments in playback order
    pub fn push<I>(&mut self, segments: I)
    where
        I: IntoIterator<Item = Segment>,
    {
        for segment in segments {
            segment.set_start(self.start_pointer);
            self.start_pointer += segment.duration();
            self.segments.push(segment);
        }
    }

    /// Re-derive every start from the (possibly corrected) durations
    pub fn recalculate_start_times(&mut self) {
        self.start_pointer = self.initial_start;
        for segment in &self.segments {
            segment.set_start(self.start_pointer);
            self.start_pointer += segment.duration();
        }
    }

    /// Sum of segment durations
    pub fn audio_duration(&self) -> f64 {
        self.start_pointer - self.initial_start
    }

    pub fn duration(&self) -> f64 {
        self.duration_override.unwrap_or_else(|| self.audio_duration())
    }

    pub fn set_duration(&mut self, duration: Option<f64>) {
        self.duration_override = duration;
    }

    pub fn start(&self) -> f64 {
        self.initial_start
    }

    /// Move the whole stack; scheduled nodes are invalid afterwards
    pub fn set_start(&mut self, start: f64) {
        self.initial_start = start;
        self.disconnect_all();
        self.recalculate_start_times();
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn first(&self) -> Option<&Segment> {
        self.segments.first()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Index of the segment with `start <= t <= end`
    ///
    /// On a shared boundary the earlier segment wins.
    pub fn get_index_at(&self, t: f64) -> Option<usize> {
        self.segments
            .iter()
            .position(|s| t >= s.start() && t <= s.end())
    }

    pub fn get_at(&self, t: f64) -> Option<&Segment> {
        self.get_index_at(t).map(|i| &self.segments[i])
    }

    /// Pick the next segment that needs preparing, marking it in transit
    ///
    /// Priority: the current segment, then the following one if it starts
    /// inside the play window. Nothing is prefetched while the current segment
    /// is not ready. Near the end of a loop the segment at the loop start is
    /// offered for the next loop, and before a delayed start the first segment
    /// is offered once it is within the look-ahead margin.
    pub fn consume(&mut self, timeframe: &Timeframe) -> Option<Segment> {
        let (segment, in_next_loop) = self.select(timeframe)?;
        segment.begin_transit(in_next_loop.then_some(timeframe.loops));
        Some(segment)
    }

    fn select(&self, tf: &Timeframe) -> Option<(Segment, bool)> {
        let t = tf.current_time;
        let index = self.get_index_at(t);
        let next = index.and_then(|i| self.segments.get(i + 1));

        match index.map(|i| &self.segments[i]) {
            Some(current) => {
                if !current.in_transit() && !current.is_ready() {
                    return Some((current.clone(), false));
                }
                if !current.is_ready() {
                    return None;
                }
            }
            None => {
                if let Some(first) = self.segments.first() {
                    let lead = first.start() - t;
                    if lead > 0.0
                        && lead <= self.next_margin
                        && first.start() < tf.end()
                        && !first.in_transit()
                        && !first.is_ready()
                    {
                        return Some((first.clone(), false));
                    }
                }
            }
        }

        let next_in_window = next.filter(|n| n.start() < tf.end());
        if let Some(next) = next_in_window {
            if !next.in_transit() && !next.is_ready() {
                return Some((next.clone(), false));
            }
            return None;
        }

        if tf.looping && tf.end() - t <= self.next_margin {
            let loop_index = self.get_index_at(tf.offset)?;
            let candidate = &self.segments[loop_index];
            if Some(loop_index) != index && !candidate.in_transit() && !candidate.is_ready() {
                return Some((candidate.clone(), true));
            }
        }

        None
    }

    /// Release a segment returned by `consume`
    pub fn ack(&self, segment: &Segment) {
        segment.set_in_transit(false);
    }

    /// Release a segment for the pass holding `claim` only
    pub(crate) fn release(&self, segment: &Segment, claim: u64) {
        segment.end_transit(claim);
    }

    /// Invalidate everything scheduled: cancel loads, disconnect, release
    pub fn disconnect_all(&self) {
        for segment in &self.segments {
            segment.cancel();
            segment.disconnect();
            self.ack(segment);
        }
    }

    /// Segments prepared before loop `loops` now belong to the current one
    pub fn clear_next_loop(&self, loops: u64) {
        for segment in &self.segments {
            segment.expire_next_loop(loops);
        }
    }

    pub fn destroy(&mut self) {
        for segment in &self.segments {
            segment.destroy();
        }
        self.segments.clear();
        self.start_pointer = self.initial_start;
    }
}

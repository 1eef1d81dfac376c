//! Mapping the audio clock onto the logical playback timeline
//!
//! `logical = clock - adjusted_start`. Seeking re-bases `adjusted_start`, so
//! reading the position is a subtraction rather than a counter. Looping wraps
//! the projection back into the play window and shifts `adjusted_start` by
//! whole loops, keeping the numbers bounded over long sessions.

/// Portion of the content meant for playback
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayWindow {
    pub offset: f64,
    pub play_duration: f64,
    pub looping: bool,
}

impl PlayWindow {
    pub fn end(&self) -> f64 {
        self.offset + self.play_duration
    }

    /// Clamp `t` into `[offset, offset + play_duration]`
    pub fn clamp(&self, t: f64) -> f64 {
        t.max(self.offset).min(self.end())
    }
}

/// Result of projecting the clock onto the timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub time: f64,
    /// The projection crossed the loop end and was wrapped
    pub wrapped: bool,
    /// Loop wraps so far, this one included
    pub loops: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Timeline {
    adjusted_start: Option<f64>,
    /// Bumped on every re-base and reset
    epoch: u64,
    /// Loop wraps since creation; never goes back
    loops: u64,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.adjusted_start.is_some()
    }

    pub fn adjusted_start(&self) -> Option<f64> {
        self.adjusted_start
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn loops(&self) -> u64 {
        self.loops
    }

    /// Make the logical time at clock reading `now` equal `t`
    pub fn rebase(&mut self, now: f64, t: f64) {
        self.adjusted_start = Some(now - t);
        self.epoch += 1;
    }

    /// Forget the reference point; the position becomes undefined
    pub fn reset(&mut self) {
        self.adjusted_start = None;
        self.epoch += 1;
    }

    pub fn current_time(&self, now: f64) -> Option<f64> {
        self.adjusted_start.map(|start| now - start)
    }

    /// Current logical time, wrapping into the play window when looping
    ///
    /// Wrapping moves `adjusted_start` forward by whole loops. It does not bump
    /// the epoch: absolute times scheduled for the next loop stay valid.
    pub fn project(&mut self, now: f64, window: &PlayWindow) -> Option<Projection> {
        let raw = self.current_time(now)?;

        if window.looping && window.play_duration > 0.0 && raw > window.end() {
            let loops = ((raw - window.offset) / window.play_duration).floor();
            if let Some(start) = self.adjusted_start.as_mut() {
                *start += loops * window.play_duration;
            }
            self.loops += loops as u64;
            let time = window.offset + (raw - window.offset) % window.play_duration;
            return Some(Projection {
                time,
                wrapped: true,
                loops: self.loops,
            });
        }

        Some(Projection {
            time: raw,
            wrapped: false,
            loops: self.loops,
        })
    }
}

/// Snapshot of the timeline handed to a track's schedule pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timeframe {
    /// Clock time at which logical time 0 lies
    pub adjusted_start: f64,
    /// Clock time at which the play window ends
    pub adjusted_end: f64,
    pub current_time: f64,
    pub play_duration: f64,
    pub offset: f64,
    pub looping: bool,
    /// Timeline epoch the snapshot was taken in
    pub epoch: u64,
    /// Loop wraps completed when the snapshot was taken
    pub loops: u64,
}

impl Timeframe {
    /// Logical end of the play window
    pub fn end(&self) -> f64 {
        self.offset + self.play_duration
    }

    /// Whether a segment marked at loop count `mark` still belongs to the
    /// next loop; after a wrap the mark refers to the loop now playing
    pub fn is_next_loop(&self, mark: Option<u64>) -> bool {
        mark == Some(self.loops)
    }

    /// Clock time at which a segment starting at `start` must begin
    ///
    /// A start in the past is clamped to zero, the in-segment offset then
    /// makes up the difference. Segments prepared for the next loop begin
    /// one loop later, no earlier than the loop start.
    pub fn calculate_real_start(&self, start: f64, in_next_loop: bool) -> f64 {
        let real = if in_next_loop {
            self.adjusted_start + self.play_duration + start.max(self.offset)
        } else {
            self.adjusted_start + start
        };
        real.max(0.0)
    }

    /// Position inside the segment at which output begins
    pub fn calculate_offset(&self, start: f64, in_next_loop: bool) -> f64 {
        let reference = if in_next_loop {
            self.offset
        } else {
            self.current_time
        };
        (reference - start).max(0.0)
    }

    /// Clock time at which the segment must stop
    pub fn calculate_stop(&self, in_next_loop: bool) -> f64 {
        if in_next_loop {
            self.adjusted_end + self.play_duration
        } else {
            self.adjusted_end
        }
    }
}

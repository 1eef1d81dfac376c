//! Event types for the segue player event system

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events published by a playback controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlayerEvent {
    /// Playback was requested
    #[serde(rename = "start")]
    Start,

    /// Playback was paused by the user
    #[serde(rename = "pause")]
    Pause,

    /// The timeline was re-based onto a new position
    #[serde(rename = "seek")]
    Seek { t: f64, pct: f64, remaining: f64 },

    /// Periodic position report, emitted on every tick
    ///
    /// `act` is the raw audio clock reading the report was derived from.
    #[serde(rename = "timeupdate")]
    TimeUpdate {
        t: f64,
        pct: f64,
        remaining: f64,
        act: f64,
    },

    /// Buffering started: at least one track cannot play its current segment
    #[serde(rename = "pause-start")]
    PauseStart,

    /// Buffering ended: every track can play again
    #[serde(rename = "pause-end")]
    PauseEnd,

    /// Playback reached the end of the play window
    #[serde(rename = "end")]
    End,

    /// A track reported an operational failure
    #[serde(rename = "error")]
    Error { cause: String },

    /// A track finished loading its manifest
    #[serde(rename = "init")]
    Init { track_id: Uuid },

    /// The aggregate duration changed
    #[serde(rename = "duration")]
    Duration { duration: Option<f64> },

    /// The playback offset changed
    #[serde(rename = "offset")]
    Offset { offset: f64 },

    /// The play duration override changed
    #[serde(rename = "playDuration")]
    PlayDuration { play_duration: Option<f64> },
}

/// Topic an event handler subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTopic {
    #[serde(rename = "start")]
    Start,
    #[serde(rename = "pause")]
    Pause,
    #[serde(rename = "seek")]
    Seek,
    #[serde(rename = "timeupdate")]
    TimeUpdate,
    #[serde(rename = "pause-start")]
    PauseStart,
    #[serde(rename = "pause-end")]
    PauseEnd,
    #[serde(rename = "end")]
    End,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "init")]
    Init,
    #[serde(rename = "duration")]
    Duration,
    #[serde(rename = "offset")]
    Offset,
    #[serde(rename = "playDuration")]
    PlayDuration,
}

impl EventTopic {
    /// Wire name of the topic
    pub fn as_str(&self) -> &'static str {
        match self {
            EventTopic::Start => "start",
            EventTopic::Pause => "pause",
            EventTopic::Seek => "seek",
            EventTopic::TimeUpdate => "timeupdate",
            EventTopic::PauseStart => "pause-start",
            EventTopic::PauseEnd => "pause-end",
            EventTopic::End => "end",
            EventTopic::Error => "error",
            EventTopic::Init => "init",
            EventTopic::Duration => "duration",
            EventTopic::Offset => "offset",
            EventTopic::PlayDuration => "playDuration",
        }
    }
}

impl std::fmt::Display for EventTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventTopic {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let topic = match s {
            "start" => EventTopic::Start,
            "pause" => EventTopic::Pause,
            "seek" => EventTopic::Seek,
            "timeupdate" => EventTopic::TimeUpdate,
            "pause-start" => EventTopic::PauseStart,
            "pause-end" => EventTopic::PauseEnd,
            "end" => EventTopic::End,
            "error" => EventTopic::Error,
            "init" => EventTopic::Init,
            "duration" => EventTopic::Duration,
            "offset" => EventTopic::Offset,
            "playDuration" => EventTopic::PlayDuration,
            other => {
                return Err(crate::Error::InvalidInput(format!(
                    "Unknown event topic: {}",
                    other
                )))
            }
        };
        Ok(topic)
    }
}

impl PlayerEvent {
    /// Topic this event is dispatched under
    pub fn topic(&self) -> EventTopic {
        match self {
            PlayerEvent::Start => EventTopic::Start,
            PlayerEvent::Pause => EventTopic::Pause,
            PlayerEvent::Seek { .. } => EventTopic::Seek,
            PlayerEvent::TimeUpdate { .. } => EventTopic::TimeUpdate,
            PlayerEvent::PauseStart => EventTopic::PauseStart,
            PlayerEvent::PauseEnd => EventTopic::PauseEnd,
            PlayerEvent::End => EventTopic::End,
            PlayerEvent::Error { .. } => EventTopic::Error,
            PlayerEvent::Init { .. } => EventTopic::Init,
            PlayerEvent::Duration { .. } => EventTopic::Duration,
            PlayerEvent::Offset { .. } => EventTopic::Offset,
            PlayerEvent::PlayDuration { .. } => EventTopic::PlayDuration,
        }
    }
}

/// State of the shared audio clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockState {
    /// Clock is not advancing
    Suspended,
    /// Clock is advancing and output is rendered
    Running,
    /// Clock was released and cannot be resumed
    Closed,
}

impl std::fmt::Display for ClockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClockState::Suspended => write!(f, "suspended"),
            ClockState::Running => write!(f, "running"),
            ClockState::Closed => write!(f, "closed"),
        }
    }
}

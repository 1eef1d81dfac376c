//! # segue-player
//!
//! Gapless, multi-track playback of segmented (HLS-style) audio against a
//! shared audio clock.
//!
//! **Architecture:**
//! - A [`Controller`] owns the clock and master gain and runs the buffering
//!   state machine
//! - Each [`Track`] loads an M3U8 manifest and schedules its segments ahead of
//!   the clock on every tick
//! - Audio output is abstracted behind [`audio::AudioContext`];
//!   [`audio::HeadlessContext`] provides a virtual clock without a device
//! - Network access goes through [`fetch::Fetcher`]

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod fetch;
pub mod manifest;
pub mod playback;
pub mod timer;

pub use config::{ControllerConfig, FetchOptions, TrackConfig};
pub use error::{Error, ErrorKind, Result};
pub use events::{EventBus, SubscriptionId};
pub use playback::{Controller, DesiredState, Track};
pub use segue_common::{ClockState, EventTopic, PlayerEvent};

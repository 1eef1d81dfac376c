//! Segment scheduling
//!
//! Bottom-up: [`segment`] owns one fetchable unit of audio, [`stack`] orders a
//! track's segments and picks what to prepare next, [`timeline`] maps the
//! audio clock to logical time, [`track`] runs schedule passes and
//! [`controller`] coordinates tracks around one shared clock.

pub mod controller;
pub mod fade;
pub mod segment;
pub mod stack;
pub mod timeline;
pub mod track;

#[cfg(test)]
pub(crate) mod test_support;

pub use controller::{Controller, DesiredState, TrackNotification};
pub use segment::{ConnectParams, Segment};
pub use stack::Stack;
pub use timeline::{PlayWindow, Timeframe, Timeline};
pub use track::Track;

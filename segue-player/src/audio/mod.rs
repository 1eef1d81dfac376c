//! Host audio capability
//!
//! The scheduling core never renders audio itself. It drives an implementation
//! of [`AudioContext`]: a shared clock that can be suspended and resumed, gain
//! nodes, and one-shot buffer sources started and stopped at absolute clock
//! times.

pub mod decode;
pub mod headless;

use crate::error::Result;
use bytes::Bytes;
use futures::future::BoxFuture;
use segue_common::ClockState;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

pub use decode::PcmBuffer;
pub use headless::{HeadlessContext, NodeEvent, SilentBuffer};

/// Identifier of a node inside one context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Callback invoked once when a source stops playing
pub type EndedCallback = Box<dyn FnOnce() + Send + 'static>;

/// Decoded audio
pub trait AudioBuffer: Send + Sync + fmt::Debug {
    /// Length in seconds
    fn duration(&self) -> f64;
}

/// Volume control node
pub trait GainNode: Send + Sync {
    fn id(&self) -> NodeId;

    /// Gain at the current clock time, automation included
    fn value(&self) -> f64;

    /// Set the gain immediately, dropping any scheduled automation
    fn set_value(&self, value: f64);

    fn set_value_at_time(&self, value: f64, when: f64);

    fn linear_ramp_to_value_at_time(&self, value: f64, when: f64);

    fn connect(&self, destination: NodeId);

    fn disconnect(&self);
}

/// One-shot player for a decoded buffer
pub trait SourceNode: Send {
    fn id(&self) -> NodeId;

    fn connect(&mut self, destination: NodeId);

    fn disconnect(&mut self);

    /// Start output at clock time `when`, `offset` seconds into the buffer
    fn start(&mut self, when: f64, offset: f64);

    /// Stop at clock time `when`, or now
    fn stop(&mut self, when: Option<f64>);

    /// Replace the ended callback; `None` unwires it
    fn set_on_ended(&mut self, callback: Option<EndedCallback>);
}

/// Shared clock and node factory
pub trait AudioContext: Send + Sync {
    /// Clock reading in seconds; advances only while running
    fn current_time(&self) -> f64;

    fn state(&self) -> ClockState;

    /// Receiver notified on every state transition
    fn state_changes(&self) -> watch::Receiver<ClockState>;

    fn suspend(&self) -> BoxFuture<'static, Result<()>>;

    fn resume(&self) -> BoxFuture<'static, Result<()>>;

    fn close(&self) -> BoxFuture<'static, Result<()>>;

    /// Final output node
    fn destination(&self) -> NodeId;

    fn create_gain(&self) -> Arc<dyn GainNode>;

    fn create_buffer_source(&self, buffer: Arc<dyn AudioBuffer>) -> Box<dyn SourceNode>;

    fn decode_audio_data(&self, data: Bytes) -> BoxFuture<'static, Result<Arc<dyn AudioBuffer>>>;
}

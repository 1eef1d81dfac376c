//! # Segue Common Library
//!
//! Shared code for the segue crates including:
//! - Error types
//! - Player event vocabulary (PlayerEvent enum)
//! - Configuration loading
//! - Human-readable time formatting

pub mod config;
pub mod error;
pub mod events;
pub mod human_time;

pub use error::{Error, Result};
pub use events::{ClockState, EventTopic, PlayerEvent};

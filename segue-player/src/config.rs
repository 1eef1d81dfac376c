//! Runtime configuration for controllers and tracks
//!
//! Explicit structs with documented defaults. Both can be derived from the
//! TOML configuration loaded by `segue_common::config`.

use segue_common::config::TomlConfig;
use std::collections::BTreeMap;
use std::time::Duration;

/// Default tick interval
pub const DEFAULT_REFRESH_RATE: Duration = Duration::from_millis(250);

/// Default look-ahead margin for pre-roll, in seconds
pub const DEFAULT_NEXT_MARGIN: f64 = 5.0;

/// Default fade length, in seconds
pub const DEFAULT_FADE_DURATION: f64 = 0.03;

/// Default delay before a disconnected segment drops its decoded audio
pub const DEFAULT_CACHE_GRACE: Duration = Duration::from_secs(10);

/// Options applied to every request a track makes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOptions {
    pub headers: BTreeMap<String, String>,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a request header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Copy of these options with `defaults` filled in where no header is set
    pub fn with_defaults(&self, defaults: &[(&str, &str)]) -> Self {
        let mut headers: BTreeMap<String, String> = defaults
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        headers.extend(self.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { headers }
    }
}

/// Controller settings
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// How often `timeupdate` fires and tracks run their schedule pass
    pub refresh_rate: Duration,

    /// Default length of `fade_in`/`fade_out`, in seconds
    pub fade_duration: f64,

    /// Initial master volume
    pub volume: f64,

    /// Close the audio context when the controller is destroyed
    pub close_context_on_destroy: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            refresh_rate: DEFAULT_REFRESH_RATE,
            fade_duration: DEFAULT_FADE_DURATION,
            volume: 1.0,
            close_context_on_destroy: false,
        }
    }
}

impl ControllerConfig {
    pub fn with_refresh_rate(mut self, refresh_rate: Duration) -> Self {
        self.refresh_rate = refresh_rate;
        self
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_fade_duration(mut self, fade_duration: f64) -> Self {
        self.fade_duration = fade_duration;
        self
    }

    pub fn closing_context_on_destroy(mut self, close: bool) -> Self {
        self.close_context_on_destroy = close;
        self
    }
}

impl From<&TomlConfig> for ControllerConfig {
    fn from(config: &TomlConfig) -> Self {
        Self {
            refresh_rate: Duration::from_millis(config.playback.refresh_rate_ms.max(1)),
            fade_duration: config.playback.fade_duration_secs,
            volume: config.playback.volume,
            close_context_on_destroy: false,
        }
    }
}

/// Track settings
#[derive(Debug, Clone, PartialEq)]
pub struct TrackConfig {
    /// Position of the track's first segment on the shared timeline, in seconds
    pub start: f64,

    /// Manual duration override, in seconds
    pub duration: Option<f64>,

    /// Initial track volume
    pub volume: f64,

    /// Headers for manifest and segment requests
    pub fetch_options: FetchOptions,

    /// Look-ahead margin for loop and delayed-start pre-roll, in seconds
    pub next_margin: f64,

    /// Delay before a disconnected segment drops its decoded audio
    pub cache_grace: Duration,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            start: 0.0,
            duration: None,
            volume: 1.0,
            fetch_options: FetchOptions::default(),
            next_margin: DEFAULT_NEXT_MARGIN,
            cache_grace: DEFAULT_CACHE_GRACE,
        }
    }
}

impl TrackConfig {
    pub fn with_start(mut self, start: f64) -> Self {
        self.start = start;
        self
    }

    pub fn with_duration(mut self, duration: Option<f64>) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_fetch_options(mut self, fetch_options: FetchOptions) -> Self {
        self.fetch_options = fetch_options;
        self
    }

    pub fn with_next_margin(mut self, next_margin: f64) -> Self {
        self.next_margin = next_margin;
        self
    }

    pub fn with_cache_grace(mut self, cache_grace: Duration) -> Self {
        self.cache_grace = cache_grace;
        self
    }
}

impl From<&TomlConfig> for TrackConfig {
    fn from(config: &TomlConfig) -> Self {
        Self {
            next_margin: config.playback.next_margin_secs,
            cache_grace: Duration::from_millis(config.playback.cache_grace_ms),
            fetch_options: FetchOptions {
                headers: config.network.headers.clone(),
            },
            ..Self::default()
        }
    }
}

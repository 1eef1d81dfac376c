//! Linear gain fades
//!
//! Ramps cannot reach exactly zero, so fades bottom out at [`FADE_FLOOR`].

use crate::audio::GainNode;

/// Lowest gain a fade ramps to or from
pub const FADE_FLOOR: f64 = 0.00001;

/// Ramp from the current gain down to the floor over `duration` seconds
pub fn fade_out(gain: &dyn GainNode, now: f64, duration: f64) {
    gain.set_value_at_time(gain.value(), now);
    gain.linear_ramp_to_value_at_time(FADE_FLOOR, now + duration.max(0.0));
}

/// Ramp from the floor up to `target` over `duration` seconds
pub fn fade_in(gain: &dyn GainNode, now: f64, duration: f64, target: f64) {
    let to = if target <= 0.0 { FADE_FLOOR } else { target };
    gain.set_value_at_time(FADE_FLOOR, now);
    gain.linear_ramp_to_value_at_time(to, now + duration.max(0.0));
}

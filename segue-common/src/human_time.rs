//! Human-readable playback position formatting
//!
//! Used for log lines and the command-line player's progress output.

/// Positions shorter than this are shown as `M:SS.s`, longer ones as `H:MM:SS`
const HOUR_SECS: f64 = 3600.0;

/// Format a playback position or duration given in seconds.
///
/// # Examples
///
/// ```
/// use segue_common::human_time::format_position;
///
/// assert_eq!(format_position(0.0), "0:00.0");
/// assert_eq!(format_position(75.25), "1:15.2");
/// assert_eq!(format_position(3661.0), "1:01:01");
/// assert_eq!(format_position(-2.5), "-0:02.5");
/// ```
pub fn format_position(seconds: f64) -> String {
    if !seconds.is_finite() {
        return "--:--".to_string();
    }

    let sign = if seconds < 0.0 { "-" } else { "" };
    let abs = seconds.abs();

    if abs < HOUR_SECS {
        // Truncate to tenths so the display never runs ahead of the clock
        let tenths = (abs * 10.0).floor() as u64;
        let minutes = tenths / 600;
        let secs = (tenths % 600) as f64 / 10.0;
        format!("{}{}:{:04.1}", sign, minutes, secs)
    } else {
        let whole = abs.floor() as u64;
        let hours = whole / 3600;
        let mins = (whole % 3600) / 60;
        let secs = whole % 60;
        format!("{}{}:{:02}:{:02}", sign, hours, mins, secs)
    }
}

/// Format an optional duration, showing a placeholder while it is unknown
pub fn format_duration(seconds: Option<f64>) -> String {
    match seconds {
        Some(s) => format_position(s),
        None => "--:--".to_string(),
    }
}

/// Format a 0..=1 fraction as a percentage with one decimal
pub fn format_pct(pct: f64) -> String {
    if !pct.is_finite() {
        return "--%".to_string();
    }
    format!("{:.1}%", pct * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_positions() {
        assert_eq!(format_position(5.0), "0:05.0");
        assert_eq!(format_position(59.99), "0:59.9");
        assert_eq!(format_position(600.0), "10:00.0");
    }

    #[test]
    fn test_long_positions() {
        assert_eq!(format_position(3600.0), "1:00:00");
        assert_eq!(format_position(7322.9), "2:02:02");
    }

    #[test]
    fn test_non_finite_placeholder() {
        assert_eq!(format_position(f64::NAN), "--:--");
        assert_eq!(format_duration(None), "--:--");
        assert_eq!(format_pct(f64::INFINITY), "--%");
    }

    #[test]
    fn test_pct() {
        assert_eq!(format_pct(0.5), "50.0%");
        assert_eq!(format_pct(0.0), "0.0%");
    }
}

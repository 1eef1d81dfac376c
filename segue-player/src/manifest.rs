//! M3U8 media playlist parsing
//!
//! Only what scheduling needs is read: the `#EXTINF` duration and URI of each
//! segment, in playlist order. Unknown tags are skipped.

use crate::error::{Error, Result};
use tracing::warn;
use url::Url;

/// One segment reference from a playlist
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentSource {
    /// Absolute URL when the playlist location is a URL
    pub url: String,
    /// Declared duration in seconds
    pub duration: f64,
}

/// Parse playlist `text` fetched from `src`
///
/// Relative segment URIs are resolved against `src`.
pub fn parse_m3u8(text: &str, src: &str) -> Result<Vec<SegmentSource>> {
    let protocol_error = |reason: String| Error::Protocol {
        src: src.to_string(),
        reason,
    };

    let base = Url::parse(src).ok();
    let mut lines = text
        .trim_start_matches('\u{feff}')
        .lines()
        .map(str::trim)
        .enumerate()
        .filter(|(_, line)| !line.is_empty());

    match lines.next() {
        Some((_, line)) if line.starts_with("#EXTM3U") => {}
        _ => return Err(protocol_error("missing #EXTM3U header".to_string())),
    }

    let mut segments = Vec::new();
    let mut pending: Option<f64> = None;

    for (index, line) in lines {
        let line_no = index + 1;

        if let Some(info) = line.strip_prefix("#EXTINF:") {
            let value = info.split(',').next().unwrap_or("").trim();
            let duration: f64 = value.parse().map_err(|_| {
                protocol_error(format!("invalid duration {:?} on line {}", value, line_no))
            })?;
            if !duration.is_finite() || duration < 0.0 {
                return Err(protocol_error(format!(
                    "invalid duration {:?} on line {}",
                    value, line_no
                )));
            }
            pending = Some(duration);
            continue;
        }

        if line.starts_with("#EXT-X-STREAM-INF") {
            return Err(protocol_error(
                "master playlists are not supported".to_string(),
            ));
        }

        if line.starts_with('#') {
            continue;
        }

        let duration = pending.take().ok_or_else(|| {
            protocol_error(format!("segment URI without #EXTINF on line {}", line_no))
        })?;

        let url = match &base {
            Some(base) => base
                .join(line)
                .map_err(|e| {
                    protocol_error(format!("cannot resolve {:?} on line {}: {}", line, line_no, e))
                })?
                .to_string(),
            None => line.to_string(),
        };

        segments.push(SegmentSource { url, duration });
    }

    if pending.is_some() {
        warn!(src = %src, "Playlist ends with #EXTINF but no segment URI");
    }

    if segments.is_empty() {
        return Err(protocol_error("playlist contains no segments".to_string()));
    }

    Ok(segments)
}

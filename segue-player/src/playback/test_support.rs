//! Fixtures shared by the playback unit tests

use crate::audio::{AudioBuffer, AudioContext, HeadlessContext, SilentBuffer};
use crate::config::FetchOptions;
use crate::error::{Error, Result};
use crate::fetch::{Fetcher, MemoryFetcher};
use crate::manifest::SegmentSource;
use crate::playback::segment::{ConnectParams, Segment};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Payloads are the decoded duration written as text
pub(crate) fn decode_duration_text(bytes: Bytes) -> Result<Arc<dyn AudioBuffer>> {
    let text = std::str::from_utf8(&bytes).map_err(|e| Error::Decode(e.to_string()))?;
    let duration: f64 = text
        .trim()
        .parse()
        .map_err(|_| Error::Decode(format!("not a duration: {:?}", text)))?;
    Ok(Arc::new(SilentBuffer { duration }))
}

pub(crate) fn duration_context() -> Arc<dyn AudioContext> {
    Arc::new(HeadlessContext::with_decoder(decode_duration_text))
}

pub(crate) fn segment_with(fetcher: &MemoryFetcher, url: &str, duration: f64) -> Segment {
    let fetcher: Arc<dyn Fetcher> = Arc::new(fetcher.clone());
    Segment::new(
        SegmentSource {
            url: url.to_string(),
            duration,
        },
        fetcher,
        FetchOptions::default(),
        Duration::from_secs(10),
    )
}

/// Segments whose payloads decode to their declared durations
pub(crate) fn segments(fetcher: &MemoryFetcher, durations: &[f64]) -> Vec<Segment> {
    durations
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let url = format!("http://test/{}.mp3", i);
            fetcher.insert(url.clone(), d.to_string());
            segment_with(fetcher, &url, *d)
        })
        .collect()
}

pub(crate) async fn make_ready(segment: &Segment, ctx: &Arc<dyn AudioContext>) {
    if segment.needs_fetch() {
        segment.load().await.unwrap();
    }
    segment
        .connect(
            ctx,
            ConnectParams {
                destination: ctx.destination(),
                start: 1000.0,
                offset: 0.0,
                stop: 2000.0,
            },
        )
        .await
        .unwrap();
}

//! Test helpers for segue-player integration tests
//!
//! - Fixture manifests and segment payloads served from a `MemoryFetcher`
//! - WAV segment generation for the symphonia decode path
//! - A headless context whose first decode is slow
//! - A recorder collecting controller events

#![allow(dead_code)]

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use hound::{SampleFormat, WavSpec, WavWriter};
use segue_player::audio::{AudioBuffer, AudioContext, GainNode, HeadlessContext, NodeId, SilentBuffer, SourceNode};
use segue_player::fetch::{Fetcher, MemoryFetcher};
use segue_player::{
    ClockState, Controller, ControllerConfig, Error, EventTopic, PlayerEvent, Track, TrackConfig,
};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Sample rate of generated WAV segments
pub const WAV_SAMPLE_RATE: u32 = 8000;

/// Mono 16-bit silence lasting `seconds`
pub fn wav_bytes(seconds: f64) -> Vec<u8> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: WAV_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
        let frames = (seconds * WAV_SAMPLE_RATE as f64).round() as usize;
        for _ in 0..frames {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// Decoder for payloads that spell out their own duration, e.g. `"10"`
pub fn duration_text_decoder(bytes: bytes::Bytes) -> segue_player::Result<Arc<dyn AudioBuffer>> {
    let text = String::from_utf8_lossy(&bytes);
    let duration: f64 = text
        .trim()
        .parse()
        .map_err(|_| Error::Decode(format!("not a duration: {:?}", text)))?;
    Ok(Arc::new(SilentBuffer { duration }))
}

/// Media playlist text with relative segment URIs `0.ext`, `1.ext`, ...
pub fn manifest_text(durations: &[f64], ext: &str) -> String {
    let target = durations.iter().cloned().fold(0.0, f64::max).ceil();
    let mut text = format!("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{}\n", target);
    for (i, d) in durations.iter().enumerate() {
        text.push_str(&format!("#EXTINF:{:.3},\n{}.{}\n", d, i, ext));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

/// Serve a playlist under `http://{host}/index.m3u8` whose segments decode
/// with [`duration_text_decoder`]; returns the playlist URL
pub fn serve_text_track(fetcher: &MemoryFetcher, host: &str, durations: &[f64]) -> String {
    let src = format!("http://{}/index.m3u8", host);
    fetcher.insert(src.clone(), manifest_text(durations, "txt"));
    for (i, d) in durations.iter().enumerate() {
        fetcher.insert(format!("http://{}/{}.txt", host, i), d.to_string());
    }
    src
}

/// Serve a playlist of real WAV segments; returns the playlist URL
pub fn serve_wav_track(fetcher: &MemoryFetcher, host: &str, durations: &[f64]) -> String {
    let src = format!("http://{}/index.m3u8", host);
    fetcher.insert(src.clone(), manifest_text(durations, "wav"));
    for (i, d) in durations.iter().enumerate() {
        fetcher.insert(format!("http://{}/{}.wav", host, i), wav_bytes(*d));
    }
    src
}

/// Headless context whose first decode takes `first` and later ones `rest`
///
/// Leaves room for seeks and window changes while a schedule pass is still
/// decoding.
#[derive(Clone)]
pub struct SlowDecodeContext {
    pub headless: HeadlessContext,
    first: Duration,
    rest: Duration,
    decodes: Arc<AtomicUsize>,
}

impl SlowDecodeContext {
    pub fn new(first: Duration, rest: Duration) -> Self {
        Self {
            headless: HeadlessContext::with_decoder(duration_text_decoder),
            first,
            rest,
            decodes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }
}

impl AudioContext for SlowDecodeContext {
    fn current_time(&self) -> f64 {
        self.headless.current_time()
    }

    fn state(&self) -> ClockState {
        self.headless.state()
    }

    fn state_changes(&self) -> watch::Receiver<ClockState> {
        self.headless.state_changes()
    }

    fn suspend(&self) -> BoxFuture<'static, segue_player::Result<()>> {
        self.headless.suspend()
    }

    fn resume(&self) -> BoxFuture<'static, segue_player::Result<()>> {
        self.headless.resume()
    }

    fn close(&self) -> BoxFuture<'static, segue_player::Result<()>> {
        self.headless.close()
    }

    fn destination(&self) -> NodeId {
        self.headless.destination()
    }

    fn create_gain(&self) -> Arc<dyn GainNode> {
        self.headless.create_gain()
    }

    fn create_buffer_source(&self, buffer: Arc<dyn AudioBuffer>) -> Box<dyn SourceNode> {
        self.headless.create_buffer_source(buffer)
    }

    fn decode_audio_data(&self, data: Bytes) -> BoxFuture<'static, segue_player::Result<Arc<dyn AudioBuffer>>> {
        let delay = if self.decodes.fetch_add(1, Ordering::SeqCst) == 0 {
            self.first
        } else {
            self.rest
        };
        let decode = self.headless.decode_audio_data(data);
        async move {
            tokio::time::sleep(delay).await;
            decode.await
        }
        .boxed()
    }
}

/// Controller on a context whose first decode takes 500 ms
pub async fn slow_decode_controller() -> (Controller, SlowDecodeContext) {
    let ctx = SlowDecodeContext::new(Duration::from_millis(500), Duration::from_millis(10));
    let context: Arc<dyn AudioContext> = Arc::new(ctx.clone());
    let controller = Controller::new(context, ControllerConfig::default())
        .await
        .unwrap();
    (controller, ctx)
}

/// Controller on a headless context decoding duration text
pub async fn text_controller() -> (Controller, HeadlessContext) {
    let ctx = HeadlessContext::with_decoder(duration_text_decoder);
    let controller = controller_on(&ctx, ControllerConfig::default()).await;
    (controller, ctx)
}

pub async fn controller_on(ctx: &HeadlessContext, config: ControllerConfig) -> Controller {
    let context: Arc<dyn AudioContext> = Arc::new(ctx.clone());
    Controller::new(context, config).await.unwrap()
}

pub fn new_track(controller: &Controller, fetcher: &MemoryFetcher) -> Track {
    new_track_with(controller, fetcher, TrackConfig::default())
}

pub fn new_track_with(controller: &Controller, fetcher: &MemoryFetcher, config: TrackConfig) -> Track {
    let fetcher: Arc<dyn Fetcher> = Arc::new(fetcher.clone());
    Track::new(controller, fetcher, config)
}

/// Collects every event a controller publishes
#[derive(Clone, Default)]
pub struct EventRecorder {
    log: Arc<Mutex<Vec<PlayerEvent>>>,
}

impl EventRecorder {
    pub fn attach(controller: &Controller) -> Self {
        let recorder = Self::default();
        let mut stream = controller.stream();
        let log = recorder.log.clone();
        tokio::spawn(async move {
            while let Ok(event) = stream.recv().await {
                log.lock().unwrap().push(event);
            }
        });
        recorder
    }

    pub fn events(&self) -> Vec<PlayerEvent> {
        self.log.lock().unwrap().clone()
    }

    pub fn topics(&self) -> Vec<EventTopic> {
        self.events().iter().map(PlayerEvent::topic).collect()
    }

    pub fn count(&self, topic: EventTopic) -> usize {
        self.topics().into_iter().filter(|t| *t == topic).count()
    }

    pub fn time_updates(&self) -> Vec<f64> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                PlayerEvent::TimeUpdate { t, .. } => Some(*t),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                PlayerEvent::Error { cause } => Some(cause.clone()),
                _ => None,
            })
            .collect()
    }

    /// Wait until `topic` was seen, polling on the (possibly paused) clock
    pub async fn wait_for(&self, topic: EventTopic, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.topics().contains(&topic) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.topics().contains(&topic)
    }
}

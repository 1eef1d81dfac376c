//! End-to-end playback on a headless context
//!
//! Every test runs on a paused tokio clock, so the virtual audio clock, ticks
//! and fetch latencies advance deterministically.

mod helpers;

use helpers::*;
use segue_player::audio::{AudioContext, HeadlessContext, NodeEvent};
use segue_player::fetch::MemoryFetcher;
use segue_player::{ClockState, ControllerConfig, DesiredState, Error, ErrorKind, EventTopic, PlayerEvent, TrackConfig};
use std::time::Duration;

fn starts(ctx: &HeadlessContext) -> Vec<(f64, f64)> {
    ctx.events()
        .into_iter()
        .filter_map(|e| match e {
            NodeEvent::Start { when, offset, .. } => Some((when, offset)),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_wav_segments_play_to_end() {
    let ctx = HeadlessContext::new();
    let controller = controller_on(&ctx, ControllerConfig::default()).await;
    let fetcher = MemoryFetcher::new();
    let src = serve_wav_track(&fetcher, "wav", &[0.5, 0.5, 0.5]);
    let recorder = EventRecorder::attach(&controller);

    let track = new_track(&controller, &fetcher);
    let sources = track.load(&src).await.unwrap();
    assert_eq!(sources.len(), 3);
    assert_eq!(sources[2].url, "http://wav/2.wav");
    assert_eq!(controller.duration(), Some(1.5));

    controller.play().await.unwrap();
    assert!(recorder.wait_for(EventTopic::End, Duration::from_secs(30)).await);

    let topics = recorder.topics();
    assert!(topics.contains(&EventTopic::Init));
    assert!(topics.contains(&EventTopic::Duration));
    assert!(topics.contains(&EventTopic::Start));

    let updates = recorder.time_updates();
    assert!(!updates.is_empty());
    assert!(updates.windows(2).all(|w| w[0] <= w[1]));
    assert!(updates.iter().all(|t| *t <= 1.5));

    assert_eq!(controller.current_time(), None);
    assert_eq!(controller.desired_state(), DesiredState::Suspended);
}

#[tokio::test(start_paused = true)]
async fn test_segments_are_scheduled_back_to_back() {
    let (controller, ctx) = text_controller().await;
    let fetcher = MemoryFetcher::new();
    let src = serve_text_track(&fetcher, "gapless", &[1.0, 1.0, 1.0]);
    let track = new_track(&controller, &fetcher);
    track.load(&src).await.unwrap();

    controller.play().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2800)).await;

    let scheduled = starts(&ctx);
    assert_eq!(scheduled.len(), 3, "{:?}", scheduled);
    for (i, (when, offset)) in scheduled.iter().enumerate() {
        assert!((when - i as f64).abs() < 1e-9, "segment {} at {}", i, when);
        assert_eq!(*offset, 0.0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_seek_into_segment_starts_with_offset() {
    let (controller, ctx) = text_controller().await;
    let fetcher = MemoryFetcher::new();
    let src = serve_text_track(&fetcher, "seek", &[10.0, 10.0, 10.0]);
    new_track(&controller, &fetcher).load(&src).await.unwrap();

    controller.seek(13.0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let scheduled = starts(&ctx);
    assert_eq!(scheduled.len(), 1);
    let (_, offset) = scheduled[0];
    assert!((offset - 3.0).abs() < 1e-9);
    assert!((controller.current_time().unwrap() - 13.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_seek_while_playing_resumes() {
    let (controller, ctx) = text_controller().await;
    let fetcher = MemoryFetcher::new();
    let src = serve_text_track(&fetcher, "resume", &[10.0, 10.0, 10.0]);
    new_track(&controller, &fetcher).load(&src).await.unwrap();
    let recorder = EventRecorder::attach(&controller);

    controller.play().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(ctx.state(), ClockState::Running);

    controller.seek(25.0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(ctx.state(), ClockState::Running);
    let t = controller.current_time().unwrap();
    assert!(t > 25.0 && t < 26.0, "t = {}", t);
    assert!(recorder.events().iter().any(|e| matches!(
        e,
        PlayerEvent::Seek { t, remaining, .. } if (*t - 25.0).abs() < 1e-9 && (*remaining - 5.0).abs() < 1e-9
    )));
}

#[tokio::test(start_paused = true)]
async fn test_seek_during_decode_is_silent() {
    let (controller, ctx) = slow_decode_controller().await;
    let fetcher = MemoryFetcher::new();
    let src = serve_text_track(&fetcher, "decode", &[10.0, 10.0, 10.0]);
    new_track(&controller, &fetcher).load(&src).await.unwrap();
    let recorder = EventRecorder::attach(&controller);

    controller.play().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.seek(2.0).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(ctx.decodes() >= 2);
    assert!(recorder.errors().is_empty(), "{:?}", recorder.errors());

    // The pass that began before the seek never connected its timing
    let scheduled = starts(&ctx.headless);
    assert!(
        !scheduled.iter().any(|(when, offset)| *when == 0.0 && *offset == 0.0),
        "{:?}",
        scheduled
    );
    assert!(scheduled.iter().any(|(_, offset)| (offset - 2.0).abs() < 1e-9));

    assert_eq!(ctx.state(), ClockState::Running);
    let t = controller.current_time().unwrap();
    assert!(t > 2.0 && t < 3.5, "t = {}", t);
}

#[tokio::test(start_paused = true)]
async fn test_window_change_during_decode_reschedules() {
    let (controller, ctx) = slow_decode_controller().await;
    let fetcher = MemoryFetcher::new();
    let src = serve_text_track(&fetcher, "resize", &[10.0, 10.0]);
    let track = new_track(&controller, &fetcher);
    track.load(&src).await.unwrap();
    let recorder = EventRecorder::attach(&controller);

    controller.set_play_duration(Some(5.0)).unwrap();
    controller.play().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.set_play_duration(None).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(controller.play_duration(), Some(20.0));
    assert!(recorder.errors().is_empty(), "{:?}", recorder.errors());

    let stops: Vec<f64> = ctx
        .headless
        .events()
        .into_iter()
        .filter_map(|e| match e {
            NodeEvent::Stop { when: Some(when), .. } => Some(when),
            _ => None,
        })
        .collect();
    assert!(!stops.is_empty());
    assert!(stops.iter().all(|when| (when - 20.0).abs() < 1e-9), "{:?}", stops);

    assert!(track.segments()[0].is_ready());
    assert_eq!(ctx.state(), ClockState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_seek_out_of_range_is_rejected() {
    let (controller, ctx) = text_controller().await;
    let fetcher = MemoryFetcher::new();
    let src = serve_text_track(&fetcher, "range", &[5.0]);
    new_track(&controller, &fetcher).load(&src).await.unwrap();

    controller.play().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let before = controller.current_time().unwrap();

    let err = controller.seek(5.5).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert_eq!(ctx.state(), ClockState::Running);
    assert!(controller.current_time().unwrap() >= before);
}

#[tokio::test(start_paused = true)]
async fn test_buffering_across_tracks() {
    let (controller, ctx) = text_controller().await;
    let fast = MemoryFetcher::new();
    let slow = MemoryFetcher::new().with_latency(Duration::from_secs(2));
    let fast_src = serve_text_track(&fast, "fast", &[10.0, 10.0]);
    let slow_src = serve_text_track(&slow, "slow", &[10.0, 10.0]);
    let recorder = EventRecorder::attach(&controller);

    new_track(&controller, &fast).load(&fast_src).await.unwrap();
    new_track(&controller, &slow).load(&slow_src).await.unwrap();

    controller.play().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(controller.is_buffering());
    assert!(!controller.can_play());
    assert_eq!(ctx.state(), ClockState::Suspended);
    assert_eq!(recorder.count(EventTopic::PauseStart), 1);

    assert!(recorder.wait_for(EventTopic::PauseEnd, Duration::from_secs(5)).await);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(controller.can_play());
    assert_eq!(ctx.state(), ClockState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_play_before_load_fails() {
    let (controller, _ctx) = text_controller().await;
    let fetcher = MemoryFetcher::new();
    let _track = new_track(&controller, &fetcher);

    let err = controller.play().await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[tokio::test(start_paused = true)]
async fn test_missing_manifest_reports_error() {
    let (controller, _ctx) = text_controller().await;
    let fetcher = MemoryFetcher::new();
    let recorder = EventRecorder::attach(&controller);
    let track = new_track(&controller, &fetcher);

    let err = track.load("http://nowhere/index.m3u8").await.unwrap_err();
    assert!(matches!(err, Error::Http { status: 404, .. }));
    assert_eq!(err.kind(), ErrorKind::Load);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(recorder.errors().len(), 1);
    assert!(recorder.errors()[0].contains("404"));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_manifest_names_source() {
    let (controller, _ctx) = text_controller().await;
    let fetcher = MemoryFetcher::new();
    fetcher.insert("http://bad/index.m3u8", "<html>not a playlist</html>");
    let recorder = EventRecorder::attach(&controller);
    let track = new_track(&controller, &fetcher);

    let err = track.load("http://bad/index.m3u8").await.unwrap_err();
    match &err {
        Error::Protocol { src, .. } => assert_eq!(src, "http://bad/index.m3u8"),
        other => panic!("unexpected error {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(recorder.count(EventTopic::Error), 1);
    assert_eq!(controller.duration(), None);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_manifest_load_is_silent() {
    let (controller, _ctx) = text_controller().await;
    let fetcher = MemoryFetcher::new().with_latency(Duration::from_secs(5));
    let src = serve_text_track(&fetcher, "cancel", &[10.0]);
    let recorder = EventRecorder::attach(&controller);
    let track = new_track(&controller, &fetcher);

    let loading = {
        let track = track.clone();
        tokio::spawn(async move { track.load(&src).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    track.cancel();

    let err = loading.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(recorder.count(EventTopic::Error), 0);
    assert!(track.segments().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_manifest_request_headers() {
    let (controller, _ctx) = text_controller().await;
    let fetcher = MemoryFetcher::new();
    let src = serve_text_track(&fetcher, "headers", &[10.0]);
    let config = TrackConfig::default().with_fetch_options(
        segue_player::FetchOptions::new().header("Authorization", "Bearer abc"),
    );
    let track = new_track_with(&controller, &fetcher, config);

    track.load(&src).await.unwrap();
    let options = fetcher.last_options().unwrap();
    assert_eq!(
        options.headers.get("Authorization").map(String::as_str),
        Some("Bearer abc")
    );
    assert!(options.headers.get("Accept").unwrap().contains("mpegurl"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_segment_stalls_without_retry() {
    let (controller, _ctx) = text_controller().await;
    let fetcher = MemoryFetcher::new();
    let src = serve_text_track(&fetcher, "stall", &[1.0, 1.0, 1.0]);
    fetcher.fail("http://stall/1.txt", "connection reset");
    let recorder = EventRecorder::attach(&controller);
    new_track(&controller, &fetcher).load(&src).await.unwrap();

    controller.play().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(!recorder.errors().is_empty());
    assert_eq!(recorder.count(EventTopic::End), 0);
    assert!(controller.is_buffering());
    assert_eq!(fetcher.request_count("http://stall/1.txt"), 1);
    let t = controller.current_time().unwrap();
    assert!(t >= 1.0 && t < 2.0, "stalled at {}", t);
}

#[tokio::test(start_paused = true)]
async fn test_loop_prerolls_loop_start() {
    let (controller, ctx) = text_controller().await;
    let fetcher = MemoryFetcher::new();
    let src = serve_text_track(&fetcher, "loop", &[1.0, 1.0]);
    new_track(&controller, &fetcher).load(&src).await.unwrap();
    controller.set_loop(true);
    let recorder = EventRecorder::attach(&controller);

    controller.play().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1900)).await;

    // The first segment is queued again for the second loop
    let scheduled = starts(&ctx);
    assert!(
        scheduled
            .iter()
            .any(|(when, offset)| (when - 2.0).abs() < 1e-9 && *offset == 0.0),
        "{:?}",
        scheduled
    );

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(recorder.count(EventTopic::End), 0);
    assert!(recorder.time_updates().iter().all(|t| (0.0..=2.0).contains(t)));
    assert_eq!(ctx.state(), ClockState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_offset_window_limits_playback() {
    let (controller, ctx) = text_controller().await;
    let fetcher = MemoryFetcher::new();
    let src = serve_text_track(&fetcher, "window", &[2.0, 2.0, 2.0]);
    new_track(&controller, &fetcher).load(&src).await.unwrap();
    controller.set_offset(2.5).unwrap();
    controller.set_play_duration(Some(1.0)).unwrap();
    let recorder = EventRecorder::attach(&controller);

    controller.play().await.unwrap();
    assert!(recorder.wait_for(EventTopic::End, Duration::from_secs(10)).await);

    let updates = recorder.time_updates();
    assert!(updates.iter().all(|t| (2.5..=3.5).contains(t)), "{:?}", updates);

    // Only the middle segment overlaps the window
    let scheduled = starts(&ctx);
    assert_eq!(scheduled.len(), 1, "{:?}", scheduled);
    assert!((scheduled[0].1 - 0.5).abs() < 1e-9);
    assert_eq!(fetcher.request_count("http://window/0.txt"), 0);
    assert_eq!(fetcher.request_count("http://window/2.txt"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_delayed_track_joins_later() {
    let (controller, ctx) = text_controller().await;
    let fetcher = MemoryFetcher::new();
    let main_src = serve_text_track(&fetcher, "main", &[2.0, 2.0]);
    let late_src = serve_text_track(&fetcher, "late", &[1.0]);
    new_track(&controller, &fetcher).load(&main_src).await.unwrap();
    let late = new_track_with(&controller, &fetcher, TrackConfig::default().with_start(2.5));
    late.load(&late_src).await.unwrap();
    assert_eq!(controller.duration(), Some(4.0));

    controller.play().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2300)).await;

    assert_eq!(fetcher.request_count("http://late/0.txt"), 1);
    assert!(starts(&ctx)
        .iter()
        .any(|(when, _)| (when - 2.5).abs() < 1e-9));
}

#[tokio::test(start_paused = true)]
async fn test_destroy_cancels_everything() {
    let ctx = HeadlessContext::with_decoder(duration_text_decoder);
    let controller = controller_on(&ctx, ControllerConfig::default()).await;
    let fetcher = MemoryFetcher::new().with_latency(Duration::from_secs(3));
    let src = "http://destroy/index.m3u8".to_string();
    fetcher.insert(src.clone(), manifest_text(&[10.0], "txt"));
    fetcher.insert("http://destroy/0.txt", "10");
    let track = new_track(&controller, &fetcher);
    track.load(&src).await.unwrap();

    controller.play().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.destroy().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(controller.tracks().is_empty());
    assert!(track.segments().is_empty());
    assert_eq!(ctx.active_sources(), 0);
    assert!(starts(&ctx).is_empty());
    assert_ne!(ctx.state(), ClockState::Running);
}

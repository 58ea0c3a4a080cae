//! Playback tests for nitro-media
//!
//! These tests drive a synthetic audio/video medium through the whole
//! pipeline on a manual clock and check what the host would see:
//! - Playing to the end
//! - Seeking
//! - Pausing and resuming

use anyhow::Result;
use nitro_media::{Config, MediaEvent};
use nitro_media_integration_tests::{init_logging, Harness, TestPattern};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_plays_to_the_end() -> Result<()> {
    init_logging();
    let pattern = TestPattern::new(10.0);
    let mut harness = Harness::open(&pattern, Config::default())?;
    assert!(harness.stream.has_audio());
    assert!(harness.stream.has_video());
    harness.start()?;

    assert!(harness.run_to_end(400).await, "playback never ended");

    let shown = &harness.shown;
    let total = pattern.video_frames();
    assert!(
        shown.len() >= total - 15 && shown.len() <= total,
        "{} of {} frames shown",
        shown.len(),
        total
    );
    assert!(shown.windows(2).all(|w| w[1].timestamp > w[0].timestamp));
    // Every frame carries its own picture
    for frame in shown {
        let index = (frame.timestamp * pattern.frame_rate).round() as usize;
        assert_eq!(frame.luma, TestPattern::luma(index));
    }
    let last = shown.last().copied().expect("no frame shown");
    assert!(last.timestamp >= pattern.duration - 2.0 * pattern.frame_duration());

    let stats = harness.stream.stats();
    assert_eq!(stats.frames_displayed as usize, shown.len());

    let events = harness.drain_events();
    assert!(matches!(events.first(), Some(MediaEvent::Started)));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, MediaEvent::Ended))
            .count(),
        1
    );

    harness.stream.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_video_only_plays_against_external_clock() -> Result<()> {
    init_logging();
    let pattern = TestPattern::new(3.0).video_only();
    let mut harness = Harness::open(&pattern, Config::default())?;
    assert!(!harness.stream.has_audio());
    harness.start()?;

    assert!(harness.run_to_end(150).await);
    let shown = &harness.shown;
    assert_eq!(shown.len(), pattern.video_frames());
    // One frame per tick, none dropped
    assert!(shown.windows(2).all(|w| w[1].tick == w[0].tick + 1));
    assert_eq!(harness.stream.stats().frames_dropped_late, 0);

    harness.stream.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_seek_lands_on_target() -> Result<()> {
    init_logging();
    let pattern = TestPattern::new(10.0);
    let frame = pattern.frame_duration();
    let mut harness = Harness::open(&pattern, Config::default())?;
    harness.start()?;

    harness.run(60).await;
    let before = harness.shown.last().copied().expect("no frame before the seek");
    assert!(before.timestamp < 2.5);

    harness.stream.seek(5.0)?;
    let mut first = None;
    for _ in 0..60 {
        if let Some(shown) = harness.step().await {
            first = Some(shown);
            break;
        }
    }
    let first = first.expect("no frame after the seek");
    assert!(
        (first.timestamp - 5.0).abs() < frame + 1e-9,
        "first frame after the seek at {}",
        first.timestamp
    );
    assert_ne!(first.serial, before.serial);

    harness.run(30).await;
    let after: Vec<_> = harness
        .shown
        .iter()
        .filter(|shown| shown.tick >= first.tick)
        .copied()
        .collect();
    assert!(after.len() > 20);
    assert!(after.iter().all(|shown| shown.serial == first.serial));
    assert!(after.windows(2).all(|w| w[1].timestamp > w[0].timestamp));
    // Nothing between the old position and the target leaks through
    assert!(harness
        .shown
        .iter()
        .all(|shown| shown.timestamp <= before.timestamp || shown.timestamp >= 5.0 - frame));

    let events = harness.drain_events();
    assert!(events.iter().any(
        |e| matches!(e, MediaEvent::SeekCompleted { target } if (target - 5.0).abs() < 1e-9)
    ));

    harness.stream.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_seek_past_end_clamps() -> Result<()> {
    init_logging();
    let pattern = TestPattern::new(2.0).video_only();
    let mut harness = Harness::open(&pattern, Config::default())?;
    harness.start()?;
    harness.run(10).await;

    assert!(harness.stream.seek(f64::NAN).is_err());
    harness.stream.seek(60.0)?;
    assert!(harness.run_to_end(60).await);

    let events = harness.drain_events();
    assert!(events.iter().any(
        |e| matches!(e, MediaEvent::SeekCompleted { target } if (target - 2.0).abs() < 1e-9)
    ));

    harness.stream.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pause_resume_continues_without_drops() -> Result<()> {
    init_logging();
    let pattern = TestPattern::new(10.0);
    let frame = pattern.frame_duration();
    let mut harness = Harness::open(&pattern, Config::default())?;
    harness.start()?;

    harness.run(60).await;
    let last = harness.shown.last().copied().expect("no frame before pausing");
    let dropped = harness.stream.stats().frames_dropped_late;

    harness.stream.pause()?;
    assert!(harness.stream.is_paused());
    let position = harness.stream.position();

    // Two seconds pass on the host clock
    let while_paused = harness.run(60).await;
    assert!(while_paused.is_empty());
    assert!((harness.stream.position() - position).abs() < 1e-6);

    harness.stream.resume()?;
    assert!(!harness.stream.is_paused());
    let resumed = harness.run(30).await;

    assert!(resumed.len() >= 28, "{} frames after resume", resumed.len());
    assert!(
        (resumed[0].timestamp - (last.timestamp + frame)).abs() < 1e-6,
        "resumed at {} after {}",
        resumed[0].timestamp,
        last.timestamp
    );
    assert!(resumed
        .windows(2)
        .all(|w| (w[1].timestamp - w[0].timestamp - frame).abs() < 1e-6));
    assert_eq!(harness.stream.stats().frames_dropped_late, dropped);

    let events = harness.drain_events();
    let paused = events
        .iter()
        .position(|e| matches!(e, MediaEvent::Paused))
        .expect("no pause event");
    let resumed_at = events
        .iter()
        .position(|e| matches!(e, MediaEvent::Resumed))
        .expect("no resume event");
    assert!(paused < resumed_at);

    harness.stream.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_video_only_pause_keeps_position() -> Result<()> {
    init_logging();
    let pattern = TestPattern::new(20.0).video_only();
    let frame = pattern.frame_duration();
    let mut harness = Harness::open(&pattern, Config::default())?;
    harness.start()?;

    harness.run(150).await;
    let last = harness.shown.last().copied().expect("no frame before pausing");
    assert!(last.timestamp > 4.0);

    harness.stream.pause()?;
    let position = harness.stream.position();
    assert!(
        (position - last.timestamp).abs() < 2.0 * frame,
        "paused at {} after showing {}",
        position,
        last.timestamp
    );

    assert!(harness.run(60).await.is_empty());
    assert!((harness.stream.position() - position).abs() < 1e-6);

    harness.stream.resume()?;
    assert!((harness.stream.position() - position).abs() < 1e-6);

    // The external clock picks up where it stopped, so frames keep the tick rate
    let resumed = harness.run(60).await;
    assert!(resumed.len() >= 58, "{} frames after resume", resumed.len());
    assert!((resumed[0].timestamp - (last.timestamp + frame)).abs() < 1e-6);
    assert!(resumed
        .windows(2)
        .all(|w| (w[1].timestamp - w[0].timestamp - frame).abs() < 1e-6));
    assert_eq!(harness.stream.stats().frames_dropped_late, 0);

    harness.stream.close().await?;
    Ok(())
}

//! Lifecycle and error handling tests for nitro-media
//!
//! These tests verify how a stream behaves around its pipeline:
//! - Configuration loaded from a file
//! - Corrupt packets, skipped while rare and fatal when every packet is bad
//! - Fatal task errors surfacing on close
//! - Closing a running stream

use anyhow::Result;
use nitro_media::{Config, LoopRegion, MediaError, MediaEvent};
use nitro_media_integration_tests::{init_logging, Harness, TestPattern};
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_config_file_sets_playback_options() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "[playback]\nlooping = true\n\n[playback.loop_region]\nstart = 1.0\nend = 2.0\n",
    )?;

    let config = Config::load_from(&path)?;
    let pattern = TestPattern::new(3.0).video_only();
    let mut harness = Harness::open(&pattern, config)?;
    assert!(harness.stream.is_looping());
    assert_eq!(harness.stream.loop_region(), Some(LoopRegion::new(1.0, 2.0)?));
    harness.start()?;

    harness.run(120).await;
    assert!(harness.shown.iter().all(|f| f.timestamp < 2.0));
    assert!(harness
        .shown
        .windows(2)
        .any(|w| w[1].timestamp < w[0].timestamp));
    assert!(!harness.stream.is_ended());

    harness.stream.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_corrupt_packets_are_skipped() -> Result<()> {
    init_logging();
    let mut pattern = TestPattern::new(3.0).video_only();
    pattern.corrupt_every = Some(10);
    let mut harness = Harness::open(&pattern, Config::default())?;
    harness.start()?;

    assert!(harness.run_to_end(150).await);
    let shown = &harness.shown;
    assert_eq!(shown.len(), pattern.video_frames() - pattern.video_frames() / 10);
    for frame in shown {
        let index = (frame.timestamp * pattern.frame_rate).round() as usize;
        assert_ne!(index % 10, 9, "corrupt frame {} shown", index);
    }

    let events = harness.drain_events();
    assert!(!events.iter().any(|e| matches!(e, MediaEvent::Failed(_))));
    harness.stream.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_undecodable_stream_fails() -> Result<()> {
    init_logging();
    let mut pattern = TestPattern::new(2.0).video_only();
    pattern.corrupt_every = Some(1);
    let mut harness = Harness::open(&pattern, Config::default())?;
    harness.start()?;

    let events = harness.stream.events();
    let mut failed = None;
    for _ in 0..100 {
        if let Some(message) = events.try_iter().find_map(|e| match e {
            MediaEvent::Failed(message) => Some(message),
            _ => None,
        }) {
            failed = Some(message);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let message = failed.expect("an undecodable stream must fail");
    assert!(message.contains("consecutive corrupt packets"), "{}", message);

    assert!(harness.run(10).await.is_empty());
    assert!(!events.try_iter().any(|e| matches!(e, MediaEvent::Ended)));
    assert!(matches!(
        harness.stream.close().await,
        Err(MediaError::Decode { .. })
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_task_failure_surfaces_on_close() -> Result<()> {
    init_logging();
    let mut pattern = TestPattern::new(3.0).video_only();
    pattern.broken_video = true;
    let mut harness = Harness::open(&pattern, Config::default())?;
    harness.start()?;

    let events = harness.stream.events();
    let mut failed = None;
    for _ in 0..100 {
        if let Some(message) = events.try_iter().find_map(|e| match e {
            MediaEvent::Failed(message) => Some(message),
            _ => None,
        }) {
            failed = Some(message);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let message = failed.expect("no failure reported");
    assert!(message.contains("lost its device"), "{}", message);

    assert!(harness.step().await.is_none());
    assert!(matches!(
        harness.stream.close().await,
        Err(MediaError::Video(_))
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_running_stream() -> Result<()> {
    init_logging();
    let pattern = TestPattern::new(10.0);
    let mut harness = Harness::open(&pattern, Config::default())?;
    harness.start()?;
    harness.run(30).await;
    assert!(!harness.shown.is_empty());

    tokio::time::timeout(Duration::from_secs(5), harness.stream.close()).await??;
    assert!(harness.stream.get_next_frame().is_none());
    assert!(harness.stream.start().is_err());
    // Closing twice is harmless
    harness.stream.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_while_paused() -> Result<()> {
    init_logging();
    let pattern = TestPattern::new(10.0);
    let mut harness = Harness::open(&pattern, Config::default())?;
    harness.start()?;
    harness.run(15).await;
    harness.stream.pause()?;

    tokio::time::timeout(Duration::from_secs(5), harness.stream.close()).await??;
    Ok(())
}

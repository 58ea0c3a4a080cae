//! Loop region tests for nitro-media
//!
//! A loop region replays `[start, end)` until looping is switched off.
//! Video-only media wraps on the presented frame, media with audio wraps on
//! the audio written to the sink, which must stop exactly at the region end.

use anyhow::Result;
use nitro_media::{Config, LoopRegion, MediaEvent};
use nitro_media_integration_tests::{init_logging, ramp_wraps, Harness, TestPattern};

fn looped_to(events: &[MediaEvent], to: f64) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, MediaEvent::Looped { to: t } if (t - to).abs() < 1e-9))
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_video_loop_region() -> Result<()> {
    init_logging();
    let pattern = TestPattern::new(6.0).video_only();
    let frame = pattern.frame_duration();
    let mut harness = Harness::open(&pattern, Config::default())?;
    harness.stream.set_looping(true);
    harness
        .stream
        .set_loop_region(Some(LoopRegion::new(2.0, 4.0)?))?;
    harness.start()?;

    // Ten seconds: up to the region end once, then three passes
    harness.run(300).await;

    let shown = &harness.shown;
    assert!(shown.iter().all(|f| f.timestamp < 4.0 - 1e-6));
    let wraps: Vec<_> = shown
        .windows(2)
        .filter(|w| w[1].timestamp < w[0].timestamp)
        .collect();
    assert!(wraps.len() >= 3, "{} wraps", wraps.len());
    for wrap in &wraps {
        assert!(wrap[0].timestamp >= 4.0 - 3.0 * frame, "wrapped at {}", wrap[0].timestamp);
        assert!((wrap[1].timestamp - 2.0).abs() < frame, "resumed at {}", wrap[1].timestamp);
        assert_ne!(wrap[0].serial, wrap[1].serial);
    }
    assert!(!harness.stream.is_ended());
    assert!(looped_to(&harness.drain_events(), 2.0) >= 3);

    harness.stream.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_audio_video_loop_region() -> Result<()> {
    init_logging();
    let pattern = TestPattern::new(6.0);
    let frame = pattern.frame_duration();
    let mut harness = Harness::open(&pattern, Config::default())?;
    harness.stream.set_looping(true);
    harness
        .stream
        .set_loop_region(Some(LoopRegion::new(2.0, 4.0)?))?;
    harness.start()?;

    harness.run(300).await;

    let shown = &harness.shown;
    assert!(shown.iter().all(|f| f.timestamp < 4.0 + 1e-6));
    let wraps: Vec<_> = shown
        .windows(2)
        .filter(|w| w[1].timestamp < w[0].timestamp)
        .collect();
    assert!(wraps.len() >= 2, "{} wraps", wraps.len());
    for wrap in &wraps {
        assert!((wrap[1].timestamp - 2.0).abs() < frame, "resumed at {}", wrap[1].timestamp);
    }
    assert!(!harness.stream.is_ended());
    assert!(looped_to(&harness.drain_events(), 2.0) >= 2);

    // The sink heard the region end every pass
    assert!(ramp_wraps(&harness.left_samples()).len() >= 2);

    harness.stream.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_audio_loop_truncates_at_region_end() -> Result<()> {
    init_logging();
    let pattern = TestPattern::new(6.0).audio_only();
    let mut harness = Harness::open(&pattern, Config::default())?;
    harness.stream.set_looping(true);
    harness
        .stream
        .set_loop_region(Some(LoopRegion::new(2.0, 4.0)?))?;
    harness.start()?;

    // Fourteen seconds: up to the region end once, then five passes
    harness.run(420).await;

    let samples = harness.left_samples();
    let wraps = ramp_wraps(&samples);
    assert!(wraps.len() >= 3, "{} wraps", wraps.len());

    // Each pass starts with the packet holding 2.0 s (sample 88064) and
    // stops exactly at sample 176400
    let per_pass = 176_400 - 88_064;
    for pass in wraps.windows(2) {
        let played = samples[pass[0]..pass[1]]
            .iter()
            .filter(|sample| **sample != 0)
            .count();
        assert_eq!(played, per_pass);
    }

    let scale = i16::MAX as f32;
    let first = (pattern.ramp(88_064.0 / 44_100.0) * scale) as i16;
    let last = (pattern.ramp(176_399.0 / 44_100.0) * scale) as i16;
    for &wrap in &wraps {
        assert_eq!(samples[wrap], first);
        let before = samples[..wrap]
            .iter()
            .rev()
            .find(|sample| **sample != 0)
            .copied();
        assert_eq!(before, Some(last));
    }

    assert!(!harness.stream.is_ended());
    harness.stream.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_looping_whole_medium() -> Result<()> {
    init_logging();
    let pattern = TestPattern::new(2.0).video_only();
    let mut config = Config::default();
    config.playback.looping = true;
    let mut harness = Harness::open(&pattern, config)?;
    assert!(harness.stream.is_looping());
    harness.start()?;

    harness.run(150).await;

    let wraps: Vec<_> = harness
        .shown
        .windows(2)
        .filter(|w| w[1].timestamp < w[0].timestamp)
        .collect();
    assert!(!wraps.is_empty());
    for wrap in &wraps {
        assert!(wrap[1].timestamp < pattern.frame_duration());
    }
    assert!(!harness.stream.is_ended());

    // Switching looping off lets playback run out
    harness.stream.set_looping(false);
    assert!(harness.run_to_end(120).await);

    harness.stream.close().await?;
    Ok(())
}

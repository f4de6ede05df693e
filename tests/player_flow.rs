//! Integration tests for the music player.
//!
//! Drives the player through the event bus with a mock extractor and an
//! in-memory decoder, the same way chat commands do.

mod common;

use common::*;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Test enqueueing into an idle player starts playback.
#[tokio::test]
async fn test_enqueue_starts_playback() {
    let harness = TestHarness::new(MockExtractor::new()).await;
    let mut sub = harness.subscribe();

    harness.enqueue(mock_song("a", "Song A", "alice"));

    let added = wait_for_message(&mut sub, TIMEOUT, "Added Song A").await;
    match added {
        Some(Event::Message(MessageAction::Send {
            text,
            rich: Some(RichContent::SongEnqueued { position, .. }),
        })) => {
            assert!(text.contains("at position 1"));
            assert!(text.contains("queued by alice"));
            assert_eq!(position, 1);
        }
        other => panic!("Expected enqueue message, got {:?}", other),
    }

    assert!(wait_for_message(&mut sub, TIMEOUT, "Now playing: Song A")
        .await
        .is_some());

    let sink = harness.sink.clone();
    assert!(wait_until(TIMEOUT, || sink.len() >= 5).await);
    assert_eq!(harness.stream_state().await, Some(StreamState::Running));
    assert_eq!(harness.extractor.download_count("a"), 1);
}

/// Test duplicate songs are rejected.
#[tokio::test]
async fn test_duplicate_enqueue_rejected() {
    let harness = TestHarness::new(MockExtractor::new()).await;
    let mut sub = harness.subscribe();

    harness.enqueue(mock_song("a", "Song A", "alice"));
    harness.enqueue(mock_song("a", "Song A", "bob"));

    assert!(wait_for_message(&mut sub, TIMEOUT, "Song already in queue!")
        .await
        .is_some());
}

/// Test a finished song advances to the next one.
#[tokio::test]
async fn test_finished_song_advances() {
    let extractor = MockExtractor::new().with_frames("a", 60);
    let harness = TestHarness::new(extractor).await;
    let mut sub = harness.subscribe();

    harness.enqueue(mock_song("a", "Song A", "alice"));
    harness.enqueue(mock_song("b", "Song B", "bob"));

    assert!(wait_for_message(&mut sub, TIMEOUT, "Now playing: Song B")
        .await
        .is_some());

    let player = harness.player.read().await;
    assert_eq!(player.state.playlist.history.len(), 1);
    assert_eq!(player.state.playlist.history[0].id, "a");
}

/// Test the queue ending is announced.
#[tokio::test]
async fn test_end_of_queue() {
    let extractor = MockExtractor::new().with_frames("a", 60);
    let harness = TestHarness::new(extractor).await;
    let mut sub = harness.subscribe();

    harness.enqueue(mock_song("a", "Song A", "alice"));

    assert!(wait_for_message(&mut sub, TIMEOUT, "Playback queue ended.")
        .await
        .is_some());
    assert_eq!(harness.current_id().await, None);
    assert_eq!(harness.stream_state().await, None);
}

/// Test track loop replays the same song.
#[tokio::test]
async fn test_track_loop_replays() {
    let extractor = MockExtractor::new().with_frames("a", 60);
    let harness = TestHarness::new(extractor).await;
    let mut sub = harness.subscribe();

    harness.send_playback(PlaybackAction::SetLoop {
        mode: LoopMode::Track,
    });
    harness.enqueue(mock_song("a", "Song A", "alice"));

    assert!(wait_for_message(&mut sub, TIMEOUT, "Now playing: Song A")
        .await
        .is_some());
    assert!(wait_for_message(&mut sub, TIMEOUT, "Now playing: Song A")
        .await
        .is_some());
    assert_eq!(harness.extractor.download_count("a"), 2);
}

/// Test a file that ends immediately is downloaded again, then skipped.
#[tokio::test]
async fn test_broken_download_is_retried_then_skipped() {
    let extractor = MockExtractor::new().with_frames("broken", 2);
    let harness = TestHarness::new(extractor).await;
    let mut sub = harness.subscribe();

    harness.enqueue(mock_song("broken", "Broken Song", "alice"));
    harness.enqueue(mock_song("b", "Song B", "bob"));

    assert!(wait_for_message(&mut sub, TIMEOUT, "Could not play Broken Song")
        .await
        .is_some());
    assert!(wait_for_message(&mut sub, TIMEOUT, "Now playing: Song B")
        .await
        .is_some());

    // First download plus one retry
    assert_eq!(harness.extractor.download_count("broken"), 2);

    // Broken songs are not recorded as played
    let player = harness.player.read().await;
    assert!(player.state.playlist.history.is_empty());
}

/// Test a failing download skips to the next song.
#[tokio::test]
async fn test_failed_download_skips() {
    let extractor = MockExtractor::new().failing("gone");
    let harness = TestHarness::new(extractor).await;
    let mut sub = harness.subscribe();

    harness.enqueue(mock_song("gone", "Gone Song", "alice"));
    harness.enqueue(mock_song("b", "Song B", "bob"));

    let failed = wait_for_message(&mut sub, TIMEOUT, "Failed to download Gone Song").await;
    match failed {
        Some(Event::Message(MessageAction::Send { text, .. })) => {
            assert!(text.contains("403"));
        }
        other => panic!("Expected download failure, got {:?}", other),
    }

    assert!(wait_for_message(&mut sub, TIMEOUT, "Now playing: Song B")
        .await
        .is_some());
    assert_eq!(harness.extractor.download_count("gone"), 2);
}

/// Test pause and resume control the streamer.
#[tokio::test]
async fn test_pause_and_resume() {
    let harness = TestHarness::new(MockExtractor::new()).await;
    let mut sub = harness.subscribe();

    harness.enqueue(mock_song("a", "Song A", "alice"));
    assert!(wait_for_message(&mut sub, TIMEOUT, "Now playing")
        .await
        .is_some());

    harness.send_playback(PlaybackAction::Pause);
    let player = harness.player.clone();
    assert!(
        wait_until(TIMEOUT, || {
            player
                .try_read()
                .map(|p| p.stream_state() == Some(StreamState::Paused))
                .unwrap_or(false)
        })
        .await
    );

    let paused_frames = harness.sink.len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.sink.len(), paused_frames);
    assert!(!harness.player.read().await.state.should_play);

    harness.send_playback(PlaybackAction::Play);
    let sink = harness.sink.clone();
    assert!(wait_until(TIMEOUT, || sink.len() > paused_frames).await);
    assert_eq!(harness.stream_state().await, Some(StreamState::Running));
}

/// Test songs enqueued while paused wait for play.
#[tokio::test]
async fn test_enqueue_while_paused_does_not_start() {
    let harness = TestHarness::new(MockExtractor::new()).await;
    let mut sub = harness.subscribe();

    harness.send_playback(PlaybackAction::Pause);
    harness.enqueue(mock_song("a", "Song A", "alice"));

    assert!(wait_for_message(&mut sub, TIMEOUT, "Added Song A")
        .await
        .is_some());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.extractor.downloads().is_empty());
    assert_eq!(harness.current_id().await, None);

    harness.send_playback(PlaybackAction::Play);
    assert!(wait_for_message(&mut sub, TIMEOUT, "Now playing: Song A")
        .await
        .is_some());
}

/// Test seeking restarts the decoder at the requested offset.
#[tokio::test]
async fn test_seek() {
    let harness = TestHarness::new(MockExtractor::new()).await;
    let mut sub = harness.subscribe();

    harness.enqueue(mock_song("a", "Song A", "alice"));
    assert!(wait_for_message(&mut sub, TIMEOUT, "Now playing")
        .await
        .is_some());

    harness.send_playback(PlaybackAction::Seek {
        position: Duration::from_secs(30),
    });
    assert!(wait_for_message(&mut sub, TIMEOUT, "Seeked to 0:30")
        .await
        .is_some());

    let opened = harness.sources.opened();
    assert_eq!(opened.len(), 2);
    assert_eq!(opened[1].start_offset, Duration::from_secs(30));

    let position = harness.player.read().await.position().unwrap();
    assert!(position >= Duration::from_secs(30));
    assert!(position < Duration::from_secs(32));
}

/// Test seeking past the end or with nothing loaded is rejected.
#[tokio::test]
async fn test_seek_errors() {
    let harness = TestHarness::new(MockExtractor::new()).await;
    let mut sub = harness.subscribe();

    harness.send_playback(PlaybackAction::Seek {
        position: Duration::from_secs(10),
    });
    assert!(wait_for_message(&mut sub, TIMEOUT, "Nothing is playing")
        .await
        .is_some());

    harness.enqueue(mock_song_with_duration("a", "Song A", "alice", 60));
    assert!(wait_for_message(&mut sub, TIMEOUT, "Now playing")
        .await
        .is_some());

    harness.send_playback(PlaybackAction::Seek {
        position: Duration::from_secs(90),
    });
    assert!(wait_for_message(&mut sub, TIMEOUT, "Cannot seek past the end")
        .await
        .is_some());
    assert_eq!(harness.sources.opened().len(), 1);
}

/// Test speed and filter changes respawn the decoder with new options.
#[tokio::test]
async fn test_speed_and_filter_reload_decoder() {
    let harness = TestHarness::new(MockExtractor::new()).await;
    let mut sub = harness.subscribe();

    harness.enqueue(mock_song("a", "Song A", "alice"));
    assert!(wait_for_message(&mut sub, TIMEOUT, "Now playing")
        .await
        .is_some());

    harness.send_playback(PlaybackAction::SetSpeed { speed: 1.5 });
    assert!(wait_for_message(&mut sub, TIMEOUT, "Playback speed set to 1.5x")
        .await
        .is_some());

    harness.send_playback(PlaybackAction::SetFilter {
        filter: Some(AudioFilter::Echo),
    });
    assert!(wait_for_message(&mut sub, TIMEOUT, "Filter set to echo")
        .await
        .is_some());

    let opened = harness.sources.opened();
    assert_eq!(opened.len(), 3);
    assert_eq!(opened[1].speed, 1.5);
    assert_eq!(opened[1].filter, None);
    assert_eq!(opened[2].speed, 1.5);
    assert_eq!(opened[2].filter, Some(AudioFilter::Echo));

    harness.send_playback(PlaybackAction::SetSpeed { speed: 10.0 });
    assert!(wait_for_message(&mut sub, TIMEOUT, "Speed must be between")
        .await
        .is_some());
}

/// Test a failed decoder restart leaves speed and filter as they were.
#[tokio::test]
async fn test_failed_reload_keeps_speed_and_filter() {
    let harness = TestHarness::new(MockExtractor::new()).await;
    let mut sub = harness.subscribe();

    harness.enqueue(mock_song("a", "Song A", "alice"));
    assert!(wait_for_message(&mut sub, TIMEOUT, "Now playing")
        .await
        .is_some());

    harness.sources.fail_next_opens(2);

    harness.send_playback(PlaybackAction::SetSpeed { speed: 2.0 });
    assert!(wait_for_message(&mut sub, TIMEOUT, "Failed to restart decoder")
        .await
        .is_some());

    harness.send_playback(PlaybackAction::SetFilter {
        filter: Some(AudioFilter::Nightcore),
    });
    assert!(wait_for_message(&mut sub, TIMEOUT, "Failed to restart decoder")
        .await
        .is_some());

    {
        let player = harness.player.read().await;
        assert_eq!(player.state.speed, 1.0);
        assert_eq!(player.state.filter, None);
    }

    // The next restart runs with the settings that were actually kept
    harness.send_playback(PlaybackAction::Seek {
        position: Duration::from_secs(10),
    });
    assert!(wait_for_message(&mut sub, TIMEOUT, "Seeked to 0:10")
        .await
        .is_some());

    let opened = harness.sources.opened();
    assert_eq!(opened.len(), 2);
    assert_eq!(opened[1].speed, 1.0);
    assert_eq!(opened[1].filter, None);
}

/// Test volume changes reach the running streamer.
#[tokio::test]
async fn test_set_volume() {
    let harness = TestHarness::new(MockExtractor::new()).await;
    let mut sub = harness.subscribe();

    harness.send_playback(PlaybackAction::SetVolume { volume: 0.8 });
    assert!(wait_for_message(&mut sub, TIMEOUT, "Volume set to 80%")
        .await
        .is_some());
    assert_eq!(harness.player.read().await.state.volume, 0.8);

    harness.send_playback(PlaybackAction::SetVolume { volume: 7.0 });
    assert!(wait_for_message(&mut sub, TIMEOUT, "Volume set to 200%")
        .await
        .is_some());
}

/// Test a crashed decoder is respawned at the current position.
#[tokio::test]
async fn test_decoder_crash_respawns() {
    let harness = TestHarness::build(
        MockExtractor::new(),
        MemorySourceFactory::flaky(1, 100),
        |_| {},
        None,
    )
    .await;
    let mut sub = harness.subscribe();

    harness.enqueue(mock_song("a", "Song A", "alice"));
    assert!(wait_for_message(&mut sub, TIMEOUT, "Now playing")
        .await
        .is_some());

    let sources = harness.sources.clone();
    assert!(wait_until(TIMEOUT, || sources.opened().len() == 2).await);

    let opened = harness.sources.opened();
    assert!(opened[1].start_offset >= Duration::from_millis(1900));
    assert!(opened[1].start_offset <= Duration::from_millis(2100));

    let sink = harness.sink.clone();
    assert!(wait_until(TIMEOUT, || sink.len() > 110).await);
    assert_eq!(harness.current_id().await.as_deref(), Some("a"));
}

/// Test stop clears everything.
#[tokio::test]
async fn test_stop_clears_queue() {
    let harness = TestHarness::new(MockExtractor::new()).await;
    let mut sub = harness.subscribe();

    harness.enqueue(mock_song("a", "Song A", "alice"));
    harness.enqueue(mock_song("b", "Song B", "bob"));
    assert!(wait_for_message(&mut sub, TIMEOUT, "Now playing")
        .await
        .is_some());

    harness.send_playback(PlaybackAction::Stop);
    assert!(
        wait_for_message(&mut sub, TIMEOUT, "Stopped playback and cleared the queue.")
            .await
            .is_some()
    );

    let player = harness.player.read().await;
    assert!(player.state.playlist.is_empty());
    assert_eq!(player.stream_state(), None);
    drop(player);

    let frames = harness.sink.len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.sink.len(), frames);
}

/// Test skip and prev move through the queue.
#[tokio::test]
async fn test_skip_and_prev() {
    let harness = TestHarness::new(MockExtractor::new()).await;
    let mut sub = harness.subscribe();

    harness.enqueue(mock_song("a", "Song A", "alice"));
    harness.enqueue(mock_song("b", "Song B", "bob"));
    assert!(wait_for_message(&mut sub, TIMEOUT, "Now playing: Song A")
        .await
        .is_some());

    harness.send_playback(PlaybackAction::Skip);
    assert!(wait_for_message(&mut sub, TIMEOUT, "Now playing: Song B")
        .await
        .is_some());

    harness.send_playback(PlaybackAction::Prev);
    assert!(wait_for_message(&mut sub, TIMEOUT, "Now playing: Song A")
        .await
        .is_some());

    let player = harness.player.read().await;
    assert_eq!(player.state.playlist.upcoming[0].id, "b");
}

/// Test stale completions from a replaced stream are ignored.
#[tokio::test]
async fn test_stale_stream_end_ignored() {
    let harness = TestHarness::new(MockExtractor::new()).await;
    let mut sub = harness.subscribe();

    harness.enqueue(mock_song("a", "Song A", "alice"));
    harness.enqueue(mock_song("b", "Song B", "bob"));
    assert!(wait_for_message(&mut sub, TIMEOUT, "Now playing: Song A")
        .await
        .is_some());

    let session = harness.player.read().await.session();
    harness.send_playback(PlaybackAction::StreamEnded {
        session: session - 1,
        end: StreamEnd::Finished,
    });
    harness.send_playback(PlaybackAction::NowPlaying);

    assert!(wait_for_message(&mut sub, TIMEOUT, "Now playing: Song A (")
        .await
        .is_some());
    assert_eq!(harness.current_id().await.as_deref(), Some("a"));
    assert_eq!(harness.player.read().await.session(), session);
}

/// Test requests resolve through the extractor.
#[tokio::test]
async fn test_request_resolves_and_enqueues() {
    let extractor = MockExtractor::new()
        .with_song("rick", mock_song("dQw4", "Never Gonna", "nobody"), 3000)
        .with_song(
            "long",
            mock_song_with_duration("long1", "Ten Hours", "nobody", 36_000),
            3000,
        );
    let harness = TestHarness::new(extractor).await;
    let mut sub = harness.subscribe();

    harness.send_playback(PlaybackAction::Request {
        query: "rick".to_string(),
        queued_by: "alice".to_string(),
    });
    assert!(
        wait_for_message(&mut sub, TIMEOUT, "Added Never Gonna")
            .await
            .is_some()
    );
    assert_eq!(
        harness.player.read().await.state.playlist.current.as_ref().map(|s| s.queued_by.clone()),
        Some("alice".to_string())
    );

    harness.send_playback(PlaybackAction::Request {
        query: "long".to_string(),
        queued_by: "alice".to_string(),
    });
    assert!(wait_for_message(&mut sub, TIMEOUT, "Ten Hours is too long")
        .await
        .is_some());

    harness.send_playback(PlaybackAction::Request {
        query: "unknown".to_string(),
        queued_by: "alice".to_string(),
    });
    assert!(
        wait_for_message(&mut sub, TIMEOUT, "Could not find anything for \"unknown\"")
            .await
            .is_some()
    );
}

/// Test queue listing and removal commands.
#[tokio::test]
async fn test_queue_management() {
    let harness = TestHarness::new(MockExtractor::new()).await;
    let mut sub = harness.subscribe();

    harness.send_playback(PlaybackAction::Pause);
    harness.enqueue(mock_song("a", "Song A", "alice"));
    harness.enqueue(mock_song("b", "Song B", "bob"));
    harness.enqueue(mock_song("c", "Song C", "alice"));

    harness.send_playback(PlaybackAction::ListQueue { offset: None });
    let listing = wait_for_message(&mut sub, TIMEOUT, "next up").await;
    match listing {
        Some(Event::Message(MessageAction::Send { text, rich })) => {
            assert!(text.contains("1. Song A, 2. Song B, 3. Song C"));
            assert!(matches!(
                rich,
                Some(RichContent::QueueStatus {
                    queue_length: 3,
                    ..
                })
            ));
        }
        other => panic!("Expected queue listing, got {:?}", other),
    }

    harness.send_playback(PlaybackAction::RemoveByUser {
        user: "alice".to_string(),
    });
    assert!(wait_for_message(&mut sub, TIMEOUT, "Removed song Song C")
        .await
        .is_some());

    harness.send_playback(PlaybackAction::Move { from: 2, to: 1 });
    assert!(wait_for_message(&mut sub, TIMEOUT, "Moved Song B to position 1")
        .await
        .is_some());

    harness.send_playback(PlaybackAction::Remove { pos: 5 });
    assert!(wait_for_message(&mut sub, TIMEOUT, "No song at position 5")
        .await
        .is_some());

    harness.send_playback(PlaybackAction::Clear);
    assert!(wait_for_message(&mut sub, TIMEOUT, "Cleared 2 songs")
        .await
        .is_some());

    harness.send_playback(PlaybackAction::ListQueue { offset: None });
    assert!(wait_for_message(&mut sub, TIMEOUT, "Queue is empty!")
        .await
        .is_some());
}

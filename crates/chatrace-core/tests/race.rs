mod common;

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use chatrace_core::error::{ProviderError, RaceError};
use chatrace_core::race::RaceCoordinator;

use common::{content, ms, payload, providers, Script, ScriptedOpener, HEARTBEAT, ROLE_ONLY};

fn coordinator(opener: &Arc<ScriptedOpener>, deadline_ms: u64) -> RaceCoordinator {
    RaceCoordinator::new(opener.clone(), ms(deadline_ms))
}

async fn collect(stream: chatrace_core::sse::ByteStream) -> Vec<Result<Bytes, ProviderError>> {
    stream.collect().await
}

fn joined(chunks: &[Result<Bytes, ProviderError>]) -> String {
    chunks
        .iter()
        .map(|c| String::from_utf8_lossy(c.as_ref().unwrap()).into_owned())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_slow_heartbeats_then_content_beats_failure_and_silence() {
    let mut a = vec![(ms(0), HEARTBEAT.to_string())];
    for _ in 0..4 {
        a.push((ms(500), HEARTBEAT.to_string()));
    }
    a.push((ms(0), content("Hi")));
    a.push((ms(100), content(" there")));
    a.push((ms(100), "data: [DONE]\n\n".to_string()));

    let opener = Arc::new(ScriptedOpener::new(vec![
        ("a", Script::Chunks(a)),
        ("b", Script::Reject(500)),
        ("c", Script::Hang(ms(60_000))),
    ]));
    let signal = CancellationToken::new();

    let result = coordinator(&opener, 8000)
        .race(&providers(&["a", "b", "c"]), payload(), &signal)
        .await
        .unwrap();

    assert_eq!(result.winner_id, "a");
    assert_eq!(result.winner, "A");
    assert!(result.elapsed >= ms(2000));
    assert!(opener.cancelled("b"));
    assert!(opener.cancelled("c"));
    assert!(!opener.cancelled("a"));

    let chunks = collect(result.stream).await;
    assert_eq!(
        joined(&chunks),
        format!("{}{}data: [DONE]\n\n", content("Hi"), content(" there"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_connection_alone_does_not_win() {
    let opener = Arc::new(ScriptedOpener::new(vec![
        (
            "fast",
            Script::Chunks(vec![
                (ms(0), ROLE_ONLY.to_string()),
                (ms(1000), HEARTBEAT.to_string()),
                (ms(2000), content("late")),
            ]),
        ),
        ("slow", Script::Chunks(vec![(ms(1500), content("first"))])),
    ]));

    let result = coordinator(&opener, 8000)
        .race(&providers(&["fast", "slow"]), payload(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.winner_id, "slow");
    assert!(opener.cancelled("fast"));
    // The loser stops reading at the moment it is cancelled.
    let fast_reads = opener.reads("fast");
    tokio::time::sleep(ms(5000)).await;
    assert_eq!(opener.reads("fast"), fast_reads);
}

#[tokio::test(start_paused = true)]
async fn test_frame_split_across_reads_still_wins() {
    let frame = content("split");
    let (head, tail) = frame.split_at(17);
    let opener = Arc::new(ScriptedOpener::new(vec![(
        "a",
        Script::Chunks(vec![(ms(10), head.to_string()), (ms(10), tail.to_string())]),
    )]));

    let result = coordinator(&opener, 8000)
        .race(&providers(&["a"]), payload(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(joined(&collect(result.stream).await), frame);
}

#[tokio::test(start_paused = true)]
async fn test_all_providers_fail() {
    let opener = Arc::new(ScriptedOpener::new(vec![
        ("a", Script::Reject(500)),
        ("b", Script::Chunks(vec![(ms(10), HEARTBEAT.to_string())])),
        ("c", Script::Chunks(vec![(ms(10), "data: [DONE]\n\n".to_string())])),
        ("d", Script::Broken(vec![(ms(10), ROLE_ONLY.to_string())])),
    ]));
    let signal = CancellationToken::new();

    let err = coordinator(&opener, 8000)
        .race(&providers(&["a", "b", "c", "d"]), payload(), &signal)
        .await
        .unwrap_err();

    let RaceError::AllProvidersFailed { failures } = &err else {
        panic!("unexpected {err:?}");
    };
    let names: Vec<&str> = failures.iter().map(|f| f.provider.as_str()).collect();
    assert_eq!(names, ["a", "b", "c", "d"]);
    assert!(matches!(failures[0].error, ProviderError::UpstreamRejected { status: 500, .. }));
    assert!(matches!(failures[1].error, ProviderError::NoMeaningfulOutput));
    assert!(matches!(failures[2].error, ProviderError::NoMeaningfulOutput));
    assert!(matches!(failures[3].error, ProviderError::UpstreamStream(_)));
    assert_eq!(err.upstream_status(), Some(500));
    for id in ["a", "b", "c", "d"] {
        assert!(opener.cancelled(id), "{id} not cancelled");
    }
    assert!(!signal.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_deadline_marks_pending_attempts_timed_out() {
    let opener = Arc::new(ScriptedOpener::new(vec![
        ("a", Script::Hang(ms(0))),
        ("b", Script::Reject(503)),
        ("c", Script::Chunks(vec![(ms(0), HEARTBEAT.to_string()), (ms(5000), content("x"))])),
    ]));

    let started = tokio::time::Instant::now();
    let err = coordinator(&opener, 1000)
        .race(&providers(&["a", "b", "c"]), payload(), &CancellationToken::new())
        .await
        .unwrap_err();

    let waited = started.elapsed();
    assert!(waited >= ms(1000) && waited < ms(1100), "waited {waited:?}");
    let RaceError::Timeout { deadline, failures } = &err else {
        panic!("unexpected {err:?}");
    };
    assert_eq!(*deadline, ms(1000));
    assert!(matches!(failures[0].error, ProviderError::TimedOut));
    assert!(matches!(failures[1].error, ProviderError::UpstreamRejected { status: 503, .. }));
    assert!(matches!(failures[2].error, ProviderError::TimedOut));
    assert!(opener.cancelled("a"));
    assert!(opener.cancelled("c"));
    assert!(err.is_retryable());
}

#[tokio::test(start_paused = true)]
async fn test_external_cancel_stops_every_attempt() {
    let heartbeats: Vec<_> = (0..50).map(|_| (ms(100), HEARTBEAT.to_string())).collect();
    let opener = Arc::new(ScriptedOpener::new(vec![
        ("a", Script::Chunks(heartbeats)),
        ("b", Script::Hang(ms(0))),
        // Still connecting when the caller gives up.
        ("c", Script::Hang(ms(10_000))),
    ]));
    let signal = CancellationToken::new();
    let trigger = signal.clone();
    tokio::spawn(async move {
        tokio::time::sleep(ms(350)).await;
        trigger.cancel();
    });

    let err = coordinator(&opener, 8000)
        .race(&providers(&["a", "b", "c"]), payload(), &signal)
        .await
        .unwrap_err();

    assert!(matches!(err, RaceError::Cancelled));
    assert!(!err.is_retryable());
    for id in ["a", "b", "c"] {
        assert_eq!(opener.tokens(id).len(), 1);
        assert!(opener.cancelled(id), "{id} not cancelled");
    }
    let reads = opener.reads("a");
    assert_eq!(reads, 3);
    tokio::time::sleep(ms(2000)).await;
    assert_eq!(opener.reads("a"), reads);
}

#[tokio::test(start_paused = true)]
async fn test_already_cancelled_signal() {
    let opener = Arc::new(ScriptedOpener::new(vec![("a", Script::Chunks(vec![(ms(0), content("x"))]))]));
    let signal = CancellationToken::new();
    signal.cancel();

    let err = coordinator(&opener, 8000)
        .race(&providers(&["a"]), payload(), &signal)
        .await
        .unwrap_err();
    assert!(matches!(err, RaceError::Cancelled));
}

#[tokio::test]
async fn test_no_providers() {
    let opener = Arc::new(ScriptedOpener::new(vec![]));
    let err = coordinator(&opener, 8000)
        .race(&[], payload(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RaceError::ConfigurationMissing));
    assert!(opener.opens().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_winner_stream_ends_when_signal_fires() {
    let frames: Vec<_> = (0..10).map(|i| (ms(1000), content(&format!("part{i}")))).collect();
    let opener = Arc::new(ScriptedOpener::new(vec![("a", Script::Chunks(frames))]));
    let signal = CancellationToken::new();

    let result = coordinator(&opener, 8000)
        .race(&providers(&["a"]), payload(), &signal)
        .await
        .unwrap();

    let trigger = signal.clone();
    tokio::spawn(async move {
        tokio::time::sleep(ms(1500)).await;
        trigger.cancel();
    });
    let chunks = collect(result.stream).await;
    assert_eq!(joined(&chunks), format!("{}{}", content("part0"), content("part1")));
    assert_eq!(opener.reads("a"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_drop_after_win_surfaces_error() {
    let opener = Arc::new(ScriptedOpener::new(vec![(
        "a",
        Script::Broken(vec![(ms(0), content("partial"))]),
    )]));

    let result = coordinator(&opener, 8000)
        .race(&providers(&["a"]), payload(), &CancellationToken::new())
        .await
        .unwrap();

    let chunks = collect(result.stream).await;
    assert_eq!(chunks.len(), 2);
    assert_eq!(&chunks[0].as_ref().unwrap()[..], content("partial").as_bytes());
    assert!(matches!(chunks[1], Err(ProviderError::UpstreamStream(_))));
}

#[tokio::test(start_paused = true)]
async fn test_dropping_race_future_cancels_attempts() {
    let opener = Arc::new(ScriptedOpener::new(vec![
        ("a", Script::Hang(ms(0))),
        ("b", Script::Hang(ms(0))),
    ]));
    let coordinator = coordinator(&opener, 8000);
    let list = providers(&["a", "b"]);
    let signal = CancellationToken::new();

    let outcome = tokio::time::timeout(ms(200), coordinator.race(&list, payload(), &signal)).await;
    assert!(outcome.is_err());
    assert!(opener.cancelled("a"));
    assert!(opener.cancelled("b"));
    assert!(!signal.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_oversized_frame_fails_attempt() {
    let blob = "x".repeat(chatrace_core::sse::MAX_FRAME_BYTES / 2 + 1);
    let opener = Arc::new(ScriptedOpener::new(vec![
        (
            "a",
            Script::Chunks(vec![
                (ms(10), blob.clone()),
                (ms(10), blob.clone()),
                (ms(10), blob),
            ]),
        ),
        ("b", Script::Reject(500)),
    ]));

    let err = coordinator(&opener, 8000)
        .race(&providers(&["a", "b"]), payload(), &CancellationToken::new())
        .await
        .unwrap_err();

    let RaceError::AllProvidersFailed { failures } = &err else {
        panic!("unexpected {err:?}");
    };
    assert!(matches!(failures[0].error, ProviderError::UpstreamStream(_)));
    assert_eq!(opener.reads("a"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_oversized_frame_after_win_ends_relay() {
    let blob = "x".repeat(chatrace_core::sse::MAX_FRAME_BYTES / 2 + 1);
    let mut chunks = vec![(ms(0), content("hi"))];
    chunks.extend((0..10).map(|_| (ms(10), blob.clone())));
    let opener = Arc::new(ScriptedOpener::new(vec![("a", Script::Chunks(chunks))]));

    let result = coordinator(&opener, 8000)
        .race(&providers(&["a"]), payload(), &CancellationToken::new())
        .await
        .unwrap();

    let chunks = collect(result.stream).await;
    assert_eq!(chunks.len(), 2);
    assert_eq!(&chunks[0].as_ref().unwrap()[..], content("hi").as_bytes());
    assert!(matches!(chunks[1], Err(ProviderError::UpstreamStream(_))));
    assert_eq!(opener.reads("a"), 3);
}

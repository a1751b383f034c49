use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::stream;
use hydrostream::api::ByteStream;
use hydrostream::state::{run_session, Command, SessionState, SessionUpdate, StreamSession};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SIMULATION_BODY: &str = "Meshing reach Ω-3 [PROGRESS:5]\n\
solver: k-ε turbulence, Δt=0.01 s [PROGRESS:40]\n\
converged [PROGRESS:100]\n\
{\"max_velocity\": 2.75, \"unit\": \"m/s\", \"note\": \"débit ≈ 12 m³/s\"}";

struct Outcome {
    buffer: String,
    progress_trace: Vec<u8>,
    final_progress: u8,
    result: Option<serde_json::Value>,
}

fn feed(command: &str, fragments: &[&[u8]]) -> Outcome {
    let mut session = StreamSession::new(1, Command::parse(command));
    session.open();

    let mut progress_trace = Vec::new();
    let mut updates = Vec::new();
    for fragment in fragments {
        updates.extend(session.ingest(fragment));
    }
    updates.extend(session.complete());
    for update in &updates {
        if let SessionUpdate::Progress { value, .. } = update {
            progress_trace.push(*value);
        }
    }

    Outcome {
        buffer: session.buffer().to_string(),
        progress_trace,
        final_progress: session.progress(),
        result: session
            .structured_result()
            .cloned()
            .map(|result| result.into_value()),
    }
}

#[test]
fn test_every_two_way_split_yields_identical_outcome() {
    let bytes = SIMULATION_BODY.as_bytes();
    let whole = feed("run_cfd_simulation", &[bytes]);
    assert_eq!(whole.buffer, SIMULATION_BODY);
    assert_eq!(whole.progress_trace, vec![5, 40, 100]);
    assert_eq!(whole.final_progress, 100);
    assert_eq!(
        whole.result,
        Some(json!({"max_velocity": 2.75, "unit": "m/s", "note": "débit ≈ 12 m³/s"}))
    );

    for split in 1..bytes.len() {
        let (head, tail) = bytes.split_at(split);
        let outcome = feed("run_cfd_simulation", &[head, tail]);
        assert_eq!(outcome.buffer, whole.buffer, "split at {split}");
        assert_eq!(outcome.progress_trace, whole.progress_trace, "split at {split}");
        assert_eq!(outcome.result, whole.result, "split at {split}");
    }
}

#[test]
fn test_byte_at_a_time_matches_whole_body() {
    let bytes = SIMULATION_BODY.as_bytes();
    let singles: Vec<&[u8]> = bytes.chunks(1).collect();
    let outcome = feed("run_flood_routing", &singles);
    assert_eq!(outcome.buffer, SIMULATION_BODY);
    assert_eq!(outcome.progress_trace, vec![5, 40, 100]);
    assert!(outcome.result.is_some());
}

#[test]
fn test_transcript_sink_ignores_markers() {
    let outcome = feed(
        "how deep is the [PROGRESS:50] channel?",
        &[b"It is [PROGRESS:50] 3 m.".as_slice()],
    );
    assert_eq!(outcome.buffer, "It is [PROGRESS:50] 3 m.");
    assert!(outcome.progress_trace.is_empty());
    assert_eq!(outcome.final_progress, 0);
}

#[test]
fn test_oversized_marker_value_clamps_progress() {
    let body = b"step [PROGRESS:20] then [PROGRESS:123456789012345678] done";
    let whole = feed("run_cfd_simulation", &[body.as_slice()]);
    assert_eq!(whole.progress_trace, vec![20, 100]);
    assert_eq!(whole.final_progress, 100);

    let singles: Vec<&[u8]> = body.chunks(1).collect();
    let split = feed("run_cfd_simulation", &singles);
    assert_eq!(split.progress_trace, vec![20, 100]);
    assert_eq!(split.buffer, whole.buffer);
}

#[test]
fn test_truncated_multibyte_tail_becomes_replacement_character() {
    let outcome = feed("hello", &[b"flow \xE2\x89".as_slice()]);
    assert_eq!(outcome.buffer, "flow \u{FFFD}");
    assert!(outcome.result.is_none());
}

fn scripted(chunks: Vec<Result<Bytes>>) -> ByteStream {
    Box::pin(stream::iter(chunks))
}

#[tokio::test]
async fn test_run_session_reports_mid_stream_failure_once() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = StreamSession::new(9, Command::parse("run_sediment_transport"));
    let connect = async {
        Ok(scripted(vec![
            Ok(Bytes::from_static(b"bed load [PROGRESS:30]")),
            Err(anyhow!("connection reset")),
            Ok(Bytes::from_static(b"never seen")),
        ]))
    };

    let session = run_session(session, connect, CancellationToken::new(), Some(&tx)).await;
    drop(tx);

    let mut updates = Vec::new();
    while let Some(update) = rx.recv().await {
        updates.push(update);
    }

    assert_eq!(session.state(), SessionState::Errored);
    assert_eq!(session.buffer(), "bed load [PROGRESS:30]");
    assert_eq!(session.progress(), 30);
    let failures = updates
        .iter()
        .filter(|update| matches!(update, SessionUpdate::Failed { .. }))
        .count();
    assert_eq!(failures, 1);
    assert!(matches!(updates.last(), Some(SessionUpdate::Failed { .. })));
}

#[tokio::test]
async fn test_cancelled_session_emits_nothing() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let session = StreamSession::new(2, Command::parse("hello"));
    let connect = async { Ok(scripted(vec![Ok(Bytes::from_static(b"hi"))])) };
    let session = run_session(session, connect, cancel, Some(&tx)).await;
    drop(tx);

    assert_eq!(session.state(), SessionState::Streaming);
    assert!(rx.recv().await.is_none());
}

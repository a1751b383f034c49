use super::command::{Command, Sink};
use super::decoder::ChunkDecoder;
use super::marker::MarkerExtractor;
use super::payload::{parse_trailing_payload, StructuredResult};
use crate::api::ByteStream;
use anyhow::Result;
use futures::StreamExt;
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    Complete,
    Errored,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Errored)
    }
}

/// Everything a rendering surface needs to mirror one session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Fragment {
        session: SessionId,
        text: String,
    },
    Progress {
        session: SessionId,
        value: u8,
    },
    Completed {
        session: SessionId,
        result: Option<StructuredResult>,
    },
    Failed {
        session: SessionId,
        message: String,
    },
}

impl SessionUpdate {
    pub fn session(&self) -> SessionId {
        match self {
            SessionUpdate::Fragment { session, .. }
            | SessionUpdate::Progress { session, .. }
            | SessionUpdate::Completed { session, .. }
            | SessionUpdate::Failed { session, .. } => *session,
        }
    }
}

/// One command's request/response lifecycle.
///
/// Owns the decoder, the marker scanner and the accumulated buffer. Once the
/// session reaches `Complete` or `Errored` further input is ignored.
#[derive(Debug)]
pub struct StreamSession {
    id: SessionId,
    command: Command,
    sink: Sink,
    state: SessionState,
    buffer: String,
    progress: u8,
    decoder: ChunkDecoder,
    markers: MarkerExtractor,
    structured: Option<StructuredResult>,
    error: Option<String>,
}

impl StreamSession {
    pub fn new(id: SessionId, command: Command) -> Self {
        let sink = command.sink();
        Self {
            id,
            command,
            sink,
            state: SessionState::Idle,
            buffer: String::new(),
            progress: 0,
            decoder: ChunkDecoder::new(),
            markers: MarkerExtractor::new(),
            structured: None,
            error: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn sink(&self) -> Sink {
        self.sink
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn structured_result(&self) -> Option<&StructuredResult> {
        self.structured.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn open(&mut self) {
        if self.state == SessionState::Idle {
            self.state = SessionState::Streaming;
        }
    }

    /// Feeds one transport fragment through the decoder and marker scanner.
    pub fn ingest(&mut self, fragment: &[u8]) -> Vec<SessionUpdate> {
        if self.state != SessionState::Streaming {
            tracing::warn!(session = self.id, state = ?self.state, "fragment for inactive session dropped");
            return Vec::new();
        }
        let text = self.decoder.decode(fragment);
        self.absorb_text(text)
    }

    /// Flushes the decoder and runs the trailing payload parser once.
    pub fn complete(&mut self) -> Vec<SessionUpdate> {
        if self.state != SessionState::Streaming {
            return Vec::new();
        }
        let tail = self.decoder.finish();
        let mut updates = self.absorb_text(tail);

        self.state = SessionState::Complete;
        self.structured = parse_trailing_payload(&self.buffer);
        updates.push(SessionUpdate::Completed {
            session: self.id,
            result: self.structured.clone(),
        });
        updates
    }

    /// Transport failure. A transcript buffer is discarded; a simulation log is kept.
    pub fn fail(&mut self, message: impl Into<String>) -> Option<SessionUpdate> {
        if self.state.is_terminal() {
            return None;
        }
        let message = message.into();
        self.state = SessionState::Errored;
        if self.sink == Sink::Transcript {
            self.buffer.clear();
        }
        self.error = Some(message.clone());
        Some(SessionUpdate::Failed {
            session: self.id,
            message,
        })
    }

    fn absorb_text(&mut self, text: String) -> Vec<SessionUpdate> {
        if text.is_empty() {
            return Vec::new();
        }
        self.buffer.push_str(&text);

        let progress_values = match self.sink {
            Sink::Simulation => self.markers.scan(&text),
            Sink::Transcript => Vec::new(),
        };

        let mut updates = Vec::with_capacity(1 + progress_values.len());
        updates.push(SessionUpdate::Fragment {
            session: self.id,
            text,
        });
        for value in progress_values {
            self.progress = value;
            updates.push(SessionUpdate::Progress {
                session: self.id,
                value,
            });
        }
        updates
    }
}

fn emit_session_update(
    update_tx: Option<&mpsc::UnboundedSender<SessionUpdate>>,
    update: SessionUpdate,
) {
    if let Some(tx) = update_tx {
        let _ = tx.send(update);
    }
}

fn consumer_gone(update_tx: Option<&mpsc::UnboundedSender<SessionUpdate>>) -> bool {
    update_tx.is_some_and(|tx| tx.is_closed())
}

/// Drives a session from connect to a terminal state.
///
/// Returns early, without touching the session again, when `cancel` fires or
/// the consumer drops its receiver; the transport stream is dropped with it.
pub async fn run_session<F>(
    mut session: StreamSession,
    connect: F,
    cancel: CancellationToken,
    update_tx: Option<&mpsc::UnboundedSender<SessionUpdate>>,
) -> StreamSession
where
    F: Future<Output = Result<ByteStream>>,
{
    session.open();

    let connected = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::debug!(session = session.id(), "session abandoned before connect");
            return session;
        }
        connected = connect => connected,
    };

    let mut stream = match connected {
        Ok(stream) => stream,
        Err(error) => {
            tracing::warn!(session = session.id(), error = %format!("{error:#}"), "transport failed to open");
            if let Some(update) = session.fail(format!("{error:#}")) {
                emit_session_update(update_tx, update);
            }
            return session;
        }
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(session = session.id(), "session abandoned mid-stream");
                return session;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                if consumer_gone(update_tx) {
                    tracing::debug!(session = session.id(), "consumer dropped; releasing stream");
                    return session;
                }
                for update in session.ingest(&chunk) {
                    emit_session_update(update_tx, update);
                }
            }
            Some(Err(error)) => {
                tracing::warn!(session = session.id(), error = %format!("{error:#}"), "transport failed mid-stream");
                if let Some(update) = session.fail(format!("{error:#}")) {
                    emit_session_update(update_tx, update);
                }
                return session;
            }
            None => {
                for update in session.complete() {
                    emit_session_update(update_tx, update);
                }
                return session;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NamedCommand;
    use anyhow::anyhow;
    use bytes::Bytes;
    use futures::stream;
    use serde_json::json;

    fn scripted(chunks: Vec<Result<&'static str>>) -> ByteStream {
        Box::pin(stream::iter(
            chunks
                .into_iter()
                .map(|chunk| chunk.map(|text| Bytes::from_static(text.as_bytes())))
                .collect::<Vec<_>>(),
        ))
    }

    fn simulation() -> Command {
        Command::Named(NamedCommand::CfdSimulation)
    }

    #[test]
    fn test_new_session_starts_idle_with_zero_progress() {
        let session = StreamSession::new(1, simulation());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.progress(), 0);
        assert_eq!(session.sink(), Sink::Simulation);
    }

    #[test]
    fn test_idle_session_ignores_fragments() {
        let mut session = StreamSession::new(1, simulation());
        assert!(session.ingest(b"early").is_empty());
        assert_eq!(session.buffer(), "");
    }

    #[test]
    fn test_simulation_markers_update_progress_without_rewriting_text() {
        let mut session = StreamSession::new(3, simulation());
        session.open();
        let updates = session.ingest(b"abc[PROGRESS:42]def[PROGRESS:7]ghi");
        assert_eq!(
            updates,
            vec![
                SessionUpdate::Fragment {
                    session: 3,
                    text: "abc[PROGRESS:42]def[PROGRESS:7]ghi".to_string(),
                },
                SessionUpdate::Progress {
                    session: 3,
                    value: 42
                },
                SessionUpdate::Progress {
                    session: 3,
                    value: 7
                },
            ]
        );
        assert_eq!(session.progress(), 7);
        assert_eq!(session.buffer(), "abc[PROGRESS:42]def[PROGRESS:7]ghi");
    }

    #[test]
    fn test_transcript_session_never_moves_progress() {
        let mut session = StreamSession::new(4, Command::parse("what is [PROGRESS:50]?"));
        session.open();
        let updates = session.ingest(b"It looks like [PROGRESS:50].");
        assert_eq!(updates.len(), 1);
        assert_eq!(session.progress(), 0);
    }

    #[test]
    fn test_terminal_state_is_final() {
        let mut session = StreamSession::new(5, simulation());
        session.open();
        session.ingest(b"partial log");
        assert!(session.fail("connection reset").is_some());
        assert_eq!(session.state(), SessionState::Errored);
        assert!(session.complete().is_empty());
        assert!(session.fail("again").is_none());
        assert!(session.ingest(b"more").is_empty());
        assert_eq!(session.buffer(), "partial log");
        assert_eq!(session.error(), Some("connection reset"));
    }

    #[test]
    fn test_transcript_failure_discards_buffer() {
        let mut session = StreamSession::new(6, Command::parse("hello"));
        session.open();
        session.ingest(b"Hel");
        session.fail("dropped");
        assert_eq!(session.buffer(), "");
    }

    #[tokio::test]
    async fn test_run_session_completes_and_extracts_payload() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stream = scripted(vec![
            Ok("[PROGRESS:10] meshing\n"),
            Ok("[PROGRESS:100] done {\"max_dep"),
            Ok("th_m\":2.5}"),
        ]);
        let session = run_session(
            StreamSession::new(9, simulation()),
            async move { Ok(stream) },
            CancellationToken::new(),
            Some(&tx),
        )
        .await;

        assert_eq!(session.state(), SessionState::Complete);
        assert_eq!(session.progress(), 100);
        assert_eq!(
            session.structured_result().cloned().map(|r| r.into_value()),
            Some(json!({"max_depth_m": 2.5}))
        );

        drop(tx);
        let mut last = None;
        while let Some(update) = rx.recv().await {
            last = Some(update);
        }
        assert!(matches!(
            last,
            Some(SessionUpdate::Completed {
                session: 9,
                result: Some(_)
            })
        ));
    }

    #[tokio::test]
    async fn test_run_session_connect_failure_errors_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = run_session(
            StreamSession::new(2, Command::parse("hi")),
            async { Err(anyhow!("proxy returned HTTP 502")) },
            CancellationToken::new(),
            Some(&tx),
        )
        .await;

        assert_eq!(session.state(), SessionState::Errored);
        assert_eq!(
            rx.recv().await,
            Some(SessionUpdate::Failed {
                session: 2,
                message: "proxy returned HTTP 502".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_run_session_mid_stream_error_keeps_simulation_log() {
        let stream = scripted(vec![
            Ok("step 1 [PROGRESS:30]\n"),
            Err(anyhow!("connection reset")),
            Ok("never read"),
        ]);
        let session = run_session(
            StreamSession::new(7, simulation()),
            async move { Ok(stream) },
            CancellationToken::new(),
            None,
        )
        .await;

        assert_eq!(session.state(), SessionState::Errored);
        assert_eq!(session.buffer(), "step 1 [PROGRESS:30]\n");
        assert_eq!(session.progress(), 30);
    }

    #[tokio::test]
    async fn test_cancelled_session_is_left_untouched() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stream = scripted(vec![Ok("ignored")]);
        let session = run_session(
            StreamSession::new(8, simulation()),
            async move { Ok(stream) },
            cancel,
            None,
        )
        .await;

        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.buffer(), "");
    }

    #[tokio::test]
    async fn test_dropped_receiver_releases_stream() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let stream = scripted(vec![Ok("first"), Ok("second")]);
        let session = run_session(
            StreamSession::new(10, Command::parse("hi")),
            async move { Ok(stream) },
            CancellationToken::new(),
            Some(&tx),
        )
        .await;

        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.buffer(), "");
    }
}

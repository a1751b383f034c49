use super::command::{Command, Sink};
use super::payload::StructuredResult;
use super::session::{SessionId, SessionState, SessionUpdate, StreamSession};
use crate::types::{HistoryTurn, Role};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    id: Uuid,
    role: Role,
    text: String,
}

impl TranscriptEntry {
    fn new(role: Role, text: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// The surface-side mirror of the session currently bound to the conversation.
#[derive(Debug)]
pub struct ActiveSession {
    id: SessionId,
    command: Command,
    sink: Sink,
    state: SessionState,
    model_entry: Option<Uuid>,
    log: String,
    progress: u8,
    structured: Option<StructuredResult>,
    error: Option<String>,
    cancel: CancellationToken,
}

impl ActiveSession {
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

    /// Simulation log; always empty for transcript sessions.
    pub fn log(&self) -> &str {
        &self.log
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

    pub fn model_entry(&self) -> Option<Uuid> {
        self.model_entry
    }
}

/// What the dispatcher needs to start driving a new session.
pub struct SessionTicket {
    pub session: StreamSession,
    pub cancel: CancellationToken,
    pub history: Vec<HistoryTurn>,
}

/// One conversation surface: the transcript plus at most one active session.
///
/// Sessions run elsewhere and report through [`SessionUpdate`]s; updates that
/// carry any id other than the active session's are dropped, so a superseded
/// or abandoned session can never write here again.
#[derive(Debug, Default)]
pub struct Conversation {
    transcript: Vec<TranscriptEntry>,
    active: Option<ActiveSession>,
    next_session_id: SessionId,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn active(&self) -> Option<&ActiveSession> {
        self.active.as_ref()
    }

    pub fn is_streaming(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.state == SessionState::Streaming)
    }

    /// Records the user's command and binds a fresh session to the surface.
    ///
    /// A still-streaming predecessor is cancelled; its partial model entry is
    /// left in the transcript as it stood.
    pub fn begin(&mut self, input: &str) -> SessionTicket {
        self.abandon();

        let history = self.history();
        let command = Command::parse(input);
        let sink = command.sink();

        self.next_session_id += 1;
        let id = self.next_session_id;

        self.transcript
            .push(TranscriptEntry::new(Role::User, input.to_string()));
        let model_entry = match sink {
            Sink::Transcript => {
                let entry = TranscriptEntry::new(Role::Model, String::new());
                let entry_id = entry.id;
                self.transcript.push(entry);
                Some(entry_id)
            }
            Sink::Simulation => None,
        };

        let cancel = CancellationToken::new();
        self.active = Some(ActiveSession {
            id,
            command: command.clone(),
            sink,
            state: SessionState::Streaming,
            model_entry,
            log: String::new(),
            progress: 0,
            structured: None,
            error: None,
            cancel: cancel.clone(),
        });

        tracing::debug!(session = id, ?sink, "session started");
        SessionTicket {
            session: StreamSession::new(id, command),
            cancel,
            history,
        }
    }

    /// Applies one update. Returns false when the update was stale and ignored.
    pub fn apply(&mut self, update: SessionUpdate) -> bool {
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        if update.session() != active.id || active.state.is_terminal() {
            tracing::trace!(
                session = update.session(),
                active = active.id,
                "dropping stale session update"
            );
            return false;
        }

        match update {
            SessionUpdate::Fragment { text, .. } => match active.sink {
                Sink::Transcript => {
                    if let Some(entry) = active
                        .model_entry
                        .and_then(|id| self.transcript.iter_mut().find(|entry| entry.id == id))
                    {
                        entry.text.push_str(&text);
                    }
                }
                Sink::Simulation => active.log.push_str(&text),
            },
            SessionUpdate::Progress { value, .. } => {
                active.progress = value;
            }
            SessionUpdate::Completed { result, .. } => {
                active.state = SessionState::Complete;
                active.structured = result;
            }
            SessionUpdate::Failed { message, .. } => {
                active.state = SessionState::Errored;
                active.error = Some(message);
                if let Some(entry_id) = active.model_entry.take() {
                    self.transcript.retain(|entry| entry.id != entry_id);
                }
            }
        }
        true
    }

    /// Releases the active session's transport and detaches it from the surface.
    pub fn abandon(&mut self) {
        if let Some(active) = self.active.take() {
            if !active.state.is_terminal() {
                tracing::debug!(session = active.id, "abandoning streaming session");
            }
            active.cancel.cancel();
        }
    }

    /// Finished turns to send as context; the in-flight model entry is excluded.
    pub fn history(&self) -> Vec<HistoryTurn> {
        let in_flight = self
            .active
            .as_ref()
            .filter(|active| !active.state.is_terminal())
            .and_then(|active| active.model_entry);
        self.transcript
            .iter()
            .filter(|entry| Some(entry.id) != in_flight)
            .map(|entry| HistoryTurn {
                role: entry.role,
                text: entry.text.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::parse_trailing_payload;
    use serde_json::json;

    fn fragment(session: SessionId, text: &str) -> SessionUpdate {
        SessionUpdate::Fragment {
            session,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_transcript_session_grows_model_entry() {
        let mut conversation = Conversation::new();
        let ticket = conversation.begin("Explain a hydraulic jump");
        let id = ticket.session.id();

        assert!(conversation.apply(fragment(id, "A hydraulic ")));
        assert!(conversation.apply(fragment(id, "jump is...")));

        let transcript = conversation.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].role(), Role::User);
        assert_eq!(transcript[1].role(), Role::Model);
        assert_eq!(transcript[1].text(), "A hydraulic jump is...");
        assert_eq!(conversation.active().unwrap().log(), "");
    }

    #[test]
    fn test_simulation_session_never_touches_transcript() {
        let mut conversation = Conversation::new();
        let ticket = conversation.begin("run_cfd_simulation");
        let id = ticket.session.id();

        conversation.apply(fragment(id, "[PROGRESS:25] solving\n"));
        conversation.apply(SessionUpdate::Progress {
            session: id,
            value: 25,
        });

        let transcript = conversation.transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].role(), Role::User);
        let active = conversation.active().unwrap();
        assert_eq!(active.sink(), Sink::Simulation);
        assert_eq!(active.log(), "[PROGRESS:25] solving\n");
        assert_eq!(active.progress(), 25);
    }

    #[test]
    fn test_transport_error_removes_partial_model_entry() {
        let mut conversation = Conversation::new();
        let id = conversation.begin("hello").session.id();
        conversation.apply(fragment(id, "Hel"));
        conversation.apply(fragment(id, "lo the"));

        conversation.apply(SessionUpdate::Failed {
            session: id,
            message: "connection reset".to_string(),
        });

        let transcript = conversation.transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].role(), Role::User);
        let active = conversation.active().unwrap();
        assert_eq!(active.state(), SessionState::Errored);
        assert_eq!(active.error(), Some("connection reset"));
    }

    #[test]
    fn test_transport_error_keeps_simulation_log() {
        let mut conversation = Conversation::new();
        let id = conversation.begin("run_flood_routing").session.id();
        conversation.apply(fragment(id, "routing reach 1\n"));
        conversation.apply(SessionUpdate::Failed {
            session: id,
            message: "upstream closed".to_string(),
        });

        let active = conversation.active().unwrap();
        assert_eq!(active.log(), "routing reach 1\n");
        assert_eq!(active.state(), SessionState::Errored);
    }

    #[test]
    fn test_completed_session_exposes_structured_result_and_keeps_text() {
        let mut conversation = Conversation::new();
        let id = conversation.begin("generate_diagram").session.id();
        let body = r#"Here is the section. {"chart":"profile"}"#;
        conversation.apply(fragment(id, body));
        conversation.apply(SessionUpdate::Completed {
            session: id,
            result: parse_trailing_payload(body),
        });

        let active = conversation.active().unwrap();
        assert_eq!(active.state(), SessionState::Complete);
        assert_eq!(
            active.structured_result().cloned().map(|r| r.into_value()),
            Some(json!({"chart": "profile"}))
        );
        assert_eq!(conversation.transcript()[1].text(), body);
    }

    #[test]
    fn test_new_command_supersedes_and_ignores_stale_updates() {
        let mut conversation = Conversation::new();
        let first = conversation.begin("first question");
        let first_id = first.session.id();
        conversation.apply(fragment(first_id, "partial"));
        assert!(conversation.is_streaming());

        let second = conversation.begin("second question");
        assert!(first.cancel.is_cancelled());
        assert!(conversation.is_streaming());
        assert_ne!(second.session.id(), first_id);

        assert!(!conversation.apply(fragment(first_id, " ghost")));
        assert!(!conversation.apply(SessionUpdate::Failed {
            session: first_id,
            message: "late".to_string(),
        }));

        let texts: Vec<&str> = conversation
            .transcript()
            .iter()
            .map(TranscriptEntry::text)
            .collect();
        assert_eq!(texts, vec!["first question", "partial", "second question", ""]);
    }

    #[test]
    fn test_updates_after_terminal_state_are_ignored() {
        let mut conversation = Conversation::new();
        let id = conversation.begin("hi").session.id();
        conversation.apply(fragment(id, "done"));
        conversation.apply(SessionUpdate::Completed {
            session: id,
            result: None,
        });
        assert!(!conversation.is_streaming());
        assert!(!conversation.apply(fragment(id, " extra")));
        assert_eq!(conversation.transcript()[1].text(), "done");
    }

    #[test]
    fn test_abandon_cancels_and_detaches() {
        let mut conversation = Conversation::new();
        let ticket = conversation.begin("run_sediment_transport");
        conversation.abandon();
        assert!(!conversation.is_streaming());
        assert!(ticket.cancel.is_cancelled());
        assert!(conversation.active().is_none());
        assert!(!conversation.apply(fragment(ticket.session.id(), "late log")));
    }

    #[test]
    fn test_history_excludes_in_flight_model_entry() {
        let mut conversation = Conversation::new();
        let id = conversation.begin("q1").session.id();
        conversation.apply(fragment(id, "a1"));
        conversation.apply(SessionUpdate::Completed {
            session: id,
            result: None,
        });

        let ticket = conversation.begin("q2");
        assert_eq!(
            ticket.history,
            vec![
                HistoryTurn {
                    role: Role::User,
                    text: "q1".to_string()
                },
                HistoryTurn {
                    role: Role::Model,
                    text: "a1".to_string()
                },
            ]
        );
        assert_eq!(conversation.history().len(), 3);
    }
}

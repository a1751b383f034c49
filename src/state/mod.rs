mod command;
mod conversation;
mod decoder;
mod marker;
mod payload;
mod session;

pub use command::{Command, NamedCommand, Sink};
pub use conversation::{ActiveSession, Conversation, SessionTicket, TranscriptEntry};
pub use decoder::ChunkDecoder;
pub use marker::{scan_markers, MarkerExtractor, MARKER_PREFIX, MAX_PROGRESS};
pub use payload::{parse_trailing_payload, StructuredResult};
pub use session::{run_session, SessionId, SessionState, SessionUpdate, StreamSession};

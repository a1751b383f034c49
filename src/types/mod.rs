mod api;

pub use api::{
    Candidate, CandidateContent, ChatCompletionChunk, ChatRequest, ChunkChoice, ChunkDelta,
    GenerateContentChunk, HistoryTurn, Part, ProviderError, Role,
};

use super::logging::emit_envelope_parse_error;
use super::upstream::ApiProtocol;
use crate::state::ChunkDecoder;
use crate::types::{ChatCompletionChunk, GenerateContentChunk};
use anyhow::{bail, Result};

const DONE_SENTINEL: &str = "[DONE]";

/// Incremental parser for a provider's server-sent-event stream.
///
/// Yields only the text carried by each envelope; framing, usage metadata and
/// finish markers are dropped. An error envelope fails the stream.
pub struct EnvelopeParser {
    protocol: ApiProtocol,
    decoder: ChunkDecoder,
    buffer: String,
    done: bool,
}

impl EnvelopeParser {
    pub fn new(protocol: ApiProtocol) -> Self {
        Self {
            protocol,
            decoder: ChunkDecoder::new(),
            buffer: String::new(),
            done: false,
        }
    }

    pub fn process(&mut self, chunk: &[u8]) -> Result<Vec<String>> {
        let decoded = self.decoder.decode(chunk);
        self.push_normalized(&decoded);

        let mut fragments = Vec::new();
        let mut start = 0;
        while let Some(end) = self.buffer[start..].find("\n\n") {
            let event_end = start + end + 2;
            let event_text = self.buffer[start..event_end].to_string();
            start = event_end;
            if let Some(text) = self.parse_event(&event_text)? {
                fragments.push(text);
            }
        }

        if start > 0 {
            self.buffer.drain(..start);
        }

        Ok(fragments)
    }

    /// Parses whatever is left once the upstream body ends without a blank line.
    pub fn finish(&mut self) -> Result<Vec<String>> {
        let tail = self.decoder.finish();
        self.push_normalized(&tail);
        let remaining = std::mem::take(&mut self.buffer);
        if remaining.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.parse_event(&remaining)?.into_iter().collect())
    }

    /// True once an OpenAI-style `[DONE]` sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn push_normalized(&mut self, text: &str) {
        if text.contains('\r') {
            self.buffer.push_str(&text.replace('\r', ""));
        } else {
            self.buffer.push_str(text);
        }
    }

    fn parse_event(&mut self, event_text: &str) -> Result<Option<String>> {
        let mut data_lines = Vec::new();
        let mut event_type = None;
        for line in event_text.lines() {
            if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
            } else if let Some(rest) = line.strip_prefix("event:") {
                event_type = Some(rest.trim());
            }
        }
        if data_lines.is_empty() {
            return Ok(None);
        }

        let data = data_lines.join("\n");
        let data = data.trim();
        if data == DONE_SENTINEL {
            self.done = true;
            return Ok(None);
        }
        if self.done {
            return Ok(None);
        }

        match self.protocol {
            ApiProtocol::Gemini => match serde_json::from_str::<GenerateContentChunk>(data) {
                Ok(envelope) => {
                    if let Some(error) = envelope.error {
                        bail!("upstream provider error: {error}");
                    }
                    Ok(envelope.text_fragment())
                }
                Err(error) => {
                    emit_envelope_parse_error(event_type, data, &error);
                    Ok(None)
                }
            },
            ApiProtocol::OpenAiChatCompletions => {
                match serde_json::from_str::<ChatCompletionChunk>(data) {
                    Ok(envelope) => {
                        if let Some(error) = envelope.error {
                            bail!("upstream provider error: {error}");
                        }
                        Ok(envelope.text_fragment())
                    }
                    Err(error) => {
                        emit_envelope_parse_error(event_type, data, &error);
                        Ok(None)
                    }
                }
            }
        }
    }
}

use crate::api::{ApiProtocol, ByteStream, EnvelopeParser};
use anyhow::Result;
use bytes::Bytes;
use futures::{stream, StreamExt};

struct RelayState {
    upstream: ByteStream,
    parser: EnvelopeParser,
    forwarded_bytes: usize,
    finished: bool,
}

impl RelayState {
    fn forward(mut self, fragments: Vec<String>) -> Option<(Result<Bytes>, Self)> {
        let text = fragments.concat();
        if text.is_empty() {
            return None;
        }
        self.forwarded_bytes += text.len();
        Some((Ok(Bytes::from(text)), self))
    }

    fn abort(mut self, error: anyhow::Error) -> Option<(Result<Bytes>, Self)> {
        self.finished = true;
        if self.forwarded_bytes == 0 {
            tracing::warn!(error = %format!("{error:#}"), "upstream failed before first byte");
        } else {
            tracing::error!(
                error = %format!("{error:#}"),
                forwarded_bytes = self.forwarded_bytes,
                "upstream failed mid-stream; aborting response"
            );
        }
        Some((Err(error), self))
    }
}

/// Turns a provider byte stream into a stream of plain text fragments.
///
/// Each upstream read is parsed and its text yielded before the next read is
/// requested. The first error ends the stream; nothing follows it. A `[DONE]`
/// sentinel ends it too, without waiting for the provider to close.
pub fn relay_text_stream(upstream: ByteStream, protocol: ApiProtocol) -> ByteStream {
    let state = RelayState {
        upstream,
        parser: EnvelopeParser::new(protocol),
        forwarded_bytes: 0,
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            match state.upstream.next().await {
                Some(Ok(chunk)) => match state.parser.process(&chunk) {
                    Ok(fragments) if state.parser.is_done() => {
                        state.finished = true;
                        tracing::debug!(
                            forwarded_bytes = state.forwarded_bytes,
                            "upstream sent end-of-stream sentinel"
                        );
                        return state.forward(fragments);
                    }
                    Ok(fragments) if fragments.iter().all(String::is_empty) => continue,
                    Ok(fragments) => return state.forward(fragments),
                    Err(error) => return state.abort(error),
                },
                Some(Err(error)) => return state.abort(error),
                None => {
                    state.finished = true;
                    let forwarded_bytes = state.forwarded_bytes;
                    let item = match state.parser.finish() {
                        Ok(fragments) => state.forward(fragments),
                        Err(error) => state.abort(error),
                    };
                    if item.is_none() {
                        tracing::debug!(forwarded_bytes, "upstream stream complete");
                    }
                    return item;
                }
            }
        }
    }))
}
